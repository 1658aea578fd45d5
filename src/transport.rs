use std::io;
use std::ops::Range;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder as _, Encoder as _};
use tracing::{debug, trace};

use crate::protocol::{FrameError, HexDump, REQUEST_LEN, Request, Response, X10aCodec};
use crate::registers::RegisterDescriptor;

/// Byte oriented duplex link to the unit.
///
/// Implementations must never block: [`SerialLink::read_available`] only hands over what has
/// already arrived.
pub trait SerialLink {
    /// Drop whatever has been received but not read yet.
    fn discard_input(&mut self) -> io::Result<()>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Append the bytes received so far to `buffer`, returning how many were appended.
    fn read_available(&mut self, buffer: &mut BytesMut) -> io::Result<usize>;
}

impl SerialLink for Box<dyn serialport::SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut **self, bytes)?;
        io::Write::flush(&mut **self)
    }

    fn read_available(&mut self, buffer: &mut BytesMut) -> io::Result<usize> {
        let pending = self.bytes_to_read().map_err(io::Error::from)? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let start = buffer.len();
        buffer.resize(start + pending, 0);
        match io::Read::read(&mut **self, &mut buffer[start..]) {
            Ok(n) => {
                buffer.truncate(start + n);
                Ok(n)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                buffer.truncate(start);
                Ok(0)
            }
            Err(e) => {
                buffer.truncate(start);
                Err(e)
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("could not send the request over the serial link")]
    Send(#[source] io::Error),
    #[error("could not read from the serial link")]
    Receive(#[source] io::Error),
    #[error("response frame is malformed")]
    Frame(#[source] FrameError),
    #[error("unit answered with an error frame")]
    Rejected,
    #[error("response is for registry {received:#04x}, but {expected:#04x} was requested")]
    AddressMismatch { expected: u8, received: u8 },
    #[error("response payload of {len} bytes does not contain bytes {field:?}")]
    ShortPayload { len: usize, field: Range<usize> },
    #[error("there is no outstanding request")]
    NothingRequested,
}

#[derive(Debug)]
pub enum PollResponse {
    /// Keep polling, the response is not complete yet.
    Pending,
    /// A validated response; carries the requested register's field.
    Frame(Bytes),
    Failed(TransportError),
}

#[derive(Clone)]
struct Outstanding {
    registry_id: u8,
    field: Range<usize>,
}

pub struct Transport<L> {
    link: L,
    codec: X10aCodec,
    buffer: BytesMut,
    outstanding: Option<Outstanding>,
}

impl<L: SerialLink> Transport<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            codec: X10aCodec {},
            buffer: BytesMut::with_capacity(64),
            outstanding: None,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn send_request(&mut self, register: &RegisterDescriptor) -> Result<(), TransportError> {
        let request = Request::for_register(register);
        self.outstanding = None;
        self.buffer.clear();
        self.link.discard_input().map_err(TransportError::Send)?;
        let mut frame = BytesMut::with_capacity(REQUEST_LEN);
        self.codec
            .encode(&request, &mut frame)
            .map_err(TransportError::Frame)?;
        debug!(
            register.label = %register.label,
            frame = %HexDump(&frame),
            "sending request"
        );
        self.link.write_all(&frame).map_err(TransportError::Send)?;
        self.outstanding = Some(Outstanding {
            registry_id: request.registry_id,
            field: register.field(),
        });
        Ok(())
    }

    pub fn poll_response(&mut self) -> PollResponse {
        let Some(Outstanding { registry_id, field }) = self.outstanding.clone() else {
            return PollResponse::Failed(TransportError::NothingRequested);
        };
        let outcome = match self.link.read_available(&mut self.buffer) {
            Err(e) => PollResponse::Failed(TransportError::Receive(e)),
            Ok(_) => match self.codec.decode(&mut self.buffer) {
                Ok(None) => return PollResponse::Pending,
                Ok(Some(Response::Rejected)) => PollResponse::Failed(TransportError::Rejected),
                Ok(Some(Response::Data {
                    registry_id: received,
                    payload,
                })) => {
                    trace!(frame = %HexDump(&payload), registry = received, "received payload");
                    if received != registry_id {
                        PollResponse::Failed(TransportError::AddressMismatch {
                            expected: registry_id,
                            received,
                        })
                    } else if payload.len() < field.end {
                        PollResponse::Failed(TransportError::ShortPayload {
                            len: payload.len(),
                            field,
                        })
                    } else {
                        PollResponse::Frame(payload.slice(field))
                    }
                }
                Err(e) => PollResponse::Failed(TransportError::Frame(e)),
            },
        };
        self.outstanding = None;
        outcome
    }

    /// Forget the outstanding request, e.g. after it timed out.
    pub fn abandon(&mut self) {
        self.outstanding = None;
        self.buffer.clear();
    }
}
