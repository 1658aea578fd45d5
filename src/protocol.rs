use tokio_util::bytes::{Buf as _, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::registers::RegisterDescriptor;

pub const READ_COMMAND: u8 = 0x03;
pub const FRAME_START: u8 = 0x40;
pub const NAK: [u8; 2] = [0x15, 0xEA];
pub const REQUEST_LEN: usize = 4;
/// Frame start, registry id and length.
const HEADER_LEN: usize = 3;

/// Complement of the byte sum, as used in both directions of the X10A link.
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub registry_id: u8,
}

impl Request {
    pub fn for_register(register: &RegisterDescriptor) -> Self {
        Self {
            registry_id: register.registry_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_LEN] {
        let mut frame = [READ_COMMAND, FRAME_START, self.registry_id, 0];
        frame[3] = checksum(&frame[..3]);
        frame
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    /// The unit returned the contents of a registry.
    Data { registry_id: u8, payload: Bytes },
    /// The unit refused the request.
    Rejected,
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("frame checksum mismatch (computed {computed:#04x}, received {received:#04x})")]
    Checksum { computed: u8, received: u8 },
    #[error("serial link i/o failed")]
    Io(#[from] std::io::Error),
}

/// Frames X10A requests and responses.
///
/// The length byte is not covered by anything but the trailing checksum. A corrupted length
/// that ends the frame early on a byte that happens to equal the checksum of the shorter frame
/// decodes successfully, with a truncated payload. Callers check the payload size against what
/// they asked for.
pub struct X10aCodec {}

impl Encoder<&Request> for X10aCodec {
    type Error = FrameError;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&req.to_bytes());
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for X10aCodec {
    type Item = Response;
    type Error = FrameError;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some(&first) = src.first() else {
                return Ok(None);
            };
            if first == NAK[0] {
                let Some(&second) = src.get(1) else {
                    return Ok(None);
                };
                if second == NAK[1] {
                    src.advance(NAK.len());
                    return Ok(Some(Response::Rejected));
                }
                src.advance(1);
                continue;
            }
            if first != FRAME_START {
                // Line noise or the tail of a frame we gave up on.
                src.advance(1);
                continue;
            }
            let Some(&length) = src.get(2) else {
                return Ok(None);
            };
            let total = usize::from(length) + 2;
            if total < HEADER_LEN + 1 {
                src.advance(1);
                continue;
            }
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            let frame = src.split_to(total).freeze();
            let computed = checksum(&frame[..total - 1]);
            let received = frame[total - 1];
            if computed != received {
                return Err(FrameError::Checksum { computed, received });
            }
            return Ok(Some(Response::Data {
                registry_id: frame[1],
                payload: frame.slice(HEADER_LEN..total - 1),
            }));
        }
    }
}

/// Formats bytes as space separated upper-case hex for logging.
pub struct HexDump<'a>(pub &'a [u8]);

impl std::fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, byte) in self.0.iter().enumerate() {
            if idx != 0 {
                f.write_str(" ")?;
            }
            f.write_fmt(format_args!("{byte:02X}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(registry_id: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![FRAME_START, registry_id, (data.len() + 2) as u8];
        frame.extend_from_slice(data);
        frame.push(checksum(&frame));
        frame
    }

    #[test]
    fn request_frame() {
        let bytes = Request { registry_id: 0x61 }.to_bytes();
        assert_eq!(bytes[..3], [0x03, 0x40, 0x61]);
        assert_eq!(bytes[3], !(0x03u8 + 0x40 + 0x61));
        let mut encoded = BytesMut::new();
        X10aCodec {}
            .encode(&Request { registry_id: 0x61 }, &mut encoded)
            .unwrap();
        assert_eq!(&encoded[..], &bytes[..]);
    }

    #[test]
    fn decodes_data_frame_after_noise() {
        let mut src = BytesMut::from(&[0x00, 0xFF][..]);
        src.extend_from_slice(&response(0x20, &[0xD7, 0x00, 0x01]));
        src.extend_from_slice(&[0x40]);
        let decoded = X10aCodec {}.decode(&mut src).unwrap();
        assert_eq!(
            decoded,
            Some(Response::Data {
                registry_id: 0x20,
                payload: Bytes::from_static(&[0xD7, 0x00, 0x01])
            })
        );
        // The start of the next frame is kept around.
        assert_eq!(&src[..], &[0x40]);
    }

    #[test]
    fn waits_for_complete_frame() {
        let frame = response(0x10, &[1, 2, 3, 4]);
        let mut src = BytesMut::new();
        let mut codec = X10aCodec {};
        for (idx, byte) in frame.iter().enumerate() {
            src.extend_from_slice(&[*byte]);
            let decoded = codec.decode(&mut src).unwrap();
            assert_eq!(decoded.is_some(), idx == frame.len() - 1);
        }
    }

    #[test]
    fn corrupted_checksum() {
        let mut frame = response(0x10, &[1, 2]);
        frame[3] ^= 0x10;
        let mut src = BytesMut::from(&frame[..]);
        let err = X10aCodec {}.decode(&mut src).unwrap_err();
        assert!(matches!(err, FrameError::Checksum { .. }));
        assert!(src.is_empty());
    }

    #[test]
    fn shortened_length_can_still_checksum() {
        let mut frame = response(5, &[0x00, 0xB7]);
        frame[2] = 3;
        let mut src = BytesMut::from(&frame[..]);
        let decoded = X10aCodec {}.decode(&mut src).unwrap();
        assert_eq!(
            decoded,
            Some(Response::Data { registry_id: 5, payload: Bytes::from_static(&[0x00]) })
        );
        assert_eq!(&src[..], &frame[5..]);
    }

    #[test]
    fn error_frame() {
        let mut src = BytesMut::from(&[0x15, 0xEA][..]);
        assert_eq!(X10aCodec {}.decode(&mut src).unwrap(), Some(Response::Rejected));
    }

    #[test]
    fn hex_dump() {
        assert_eq!(HexDump(&[0x03, 0x40, 0xA1]).to_string(), "03 40 A1");
    }
}
