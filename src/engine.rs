//! Tick driven polling of the register table.
//!
//! The engine never blocks. An external scheduler calls [`Engine::tick`] periodically and every
//! call does a small bounded amount of work: at most one request is sent and whatever response
//! bytes have arrived are examined.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::bytes::Bytes;
use tracing::{debug, info, warn};

use crate::convert::{self, Value};
use crate::registers::{RegisterError, RegisterTable};
use crate::sensor::{NumericSensor, SensorFactory, SensorRegistry, TextSensor};
use crate::transport::{PollResponse, SerialLink, Transport, TransportError};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long to wait for a complete response before the attempt counts as failed.
    pub response_timeout: Duration,
    /// How many times a register is re-requested before it is skipped for the cycle.
    pub retries: u8,
    /// Minimum time between the starts of two consecutive scans of the table.
    pub scan_interval: Duration,
    /// Time to stay quiet after the first tick, giving the unit time to boot.
    pub initial_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(300),
            retries: 2,
            scan_interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RequestSent,
    AwaitingResponse,
    Decoded,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The register at this table index was read and published.
    Decoded(usize),
    /// The register at this table index exhausted its retries and was skipped.
    Failed(usize),
    /// The cursor wrapped around after the last register.
    CycleComplete,
}

pub struct Engine<L> {
    table: RegisterTable,
    transport: Transport<L>,
    config: EngineConfig,
    sensors: SensorRegistry,
    factory: Option<Box<dyn SensorFactory>>,
    values: Vec<Option<Value>>,
    phase: Phase,
    cursor: usize,
    attempts: u8,
    sent_at: Option<Instant>,
    frame: Option<Bytes>,
    epoch: Option<Instant>,
    next_cycle_at: Option<Instant>,
    cycle_started_at: Option<Instant>,
    cycle_finished: bool,
    last_successful_read: Option<Instant>,
}

impl<L: SerialLink> Engine<L> {
    pub fn new(table: RegisterTable, transport: Transport<L>, config: EngineConfig) -> Self {
        Self {
            values: vec![None; table.len()],
            table,
            transport,
            config,
            sensors: SensorRegistry::new(),
            factory: None,
            phase: Phase::Idle,
            cursor: 0,
            attempts: 0,
            sent_at: None,
            frame: None,
            epoch: None,
            next_cycle_at: None,
            cycle_started_at: None,
            cycle_finished: false,
            last_successful_read: None,
        }
    }

    pub fn set_sensor_factory(&mut self, factory: Box<dyn SensorFactory>) {
        self.factory = Some(factory);
    }

    pub fn register_dynamic_sensor(&mut self, label: &str, handle: &Arc<dyn NumericSensor>) {
        self.sensors.register_sensor(label, handle);
    }

    pub fn register_dynamic_text_sensor(&mut self, label: &str, handle: &Arc<dyn TextSensor>) {
        self.sensors.register_text_sensor(label, handle);
    }

    pub fn table(&self) -> &RegisterTable {
        &self.table
    }

    pub fn sensors(&self) -> &SensorRegistry {
        &self.sensors
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn link(&self) -> &L {
        self.transport.link()
    }

    pub fn link_mut(&mut self) -> &mut L {
        self.transport.link_mut()
    }

    /// Latest decoded value of a register, if it was ever read successfully.
    pub fn register_value(&self, label: &str) -> Result<Option<&Value>, RegisterError> {
        let idx = self
            .table
            .index_of(label)
            .ok_or_else(|| RegisterError::NotFound(label.to_string()))?;
        Ok(self.values[idx].as_ref())
    }

    /// Latest decoded value of a register rendered as text.
    ///
    /// Empty if the label is unknown or the register has not been read yet.
    pub fn get_register_value(&self, label: &str) -> String {
        let Some(idx) = self.table.index_of(label) else {
            return String::new();
        };
        let (Some(register), Some(value)) = (self.table.get(idx), &self.values[idx]) else {
            return String::new();
        };
        value.format(register.decimals())
    }

    pub fn last_successful_read(&self) -> Option<Instant> {
        self.last_successful_read
    }

    /// Milliseconds between the first tick and the latest validated response. Wraps like a
    /// 32-bit millisecond counter does; 0 if nothing has been read yet.
    pub fn last_successful_read_ms(&self) -> u32 {
        match (self.epoch, self.last_successful_read) {
            (Some(epoch), Some(last)) => last.duration_since(epoch).as_millis() as u32,
            _ => 0,
        }
    }

    pub fn tick(&mut self, now: Instant) -> Option<Event> {
        let epoch = *self.epoch.get_or_insert(now);
        let next_cycle_at = *self
            .next_cycle_at
            .get_or_insert(epoch + self.config.initial_delay);
        loop {
            match self.phase {
                Phase::Idle => {
                    if self.cycle_finished {
                        self.cycle_finished = false;
                        let started = self.cycle_started_at.unwrap_or(now);
                        self.next_cycle_at = Some(started + self.config.scan_interval);
                        debug!(elapsed = ?now.duration_since(started), "register scan finished");
                        return Some(Event::CycleComplete);
                    }
                    if self.table.is_empty() {
                        return None;
                    }
                    if self.cursor == 0 {
                        if now < next_cycle_at {
                            return None;
                        }
                        debug!(registers = self.table.len(), "starting a register scan");
                        self.cycle_started_at = Some(now);
                    }
                    self.attempts = 0;
                    self.phase = Phase::RequestSent;
                }
                Phase::RequestSent => {
                    let Some(register) = self.table.get(self.cursor) else {
                        self.cursor = 0;
                        self.phase = Phase::Idle;
                        continue;
                    };
                    match self.transport.send_request(register) {
                        Ok(()) => {
                            self.sent_at = Some(now);
                            self.phase = Phase::AwaitingResponse;
                            return None;
                        }
                        Err(e) => self.retry_or_fail(e.into()),
                    }
                }
                Phase::AwaitingResponse => match self.transport.poll_response() {
                    PollResponse::Pending => {
                        let sent_at = self.sent_at.unwrap_or(now);
                        if now.duration_since(sent_at) <= self.config.response_timeout {
                            return None;
                        }
                        self.transport.abandon();
                        self.retry_or_fail(ResponseTimeout(self.config.response_timeout).into());
                    }
                    PollResponse::Frame(frame) => {
                        self.frame = Some(frame);
                        self.phase = Phase::Decoded;
                    }
                    PollResponse::Failed(e) => self.retry_or_fail(e.into()),
                },
                Phase::Decoded => {
                    let index = self.cursor;
                    self.publish(index, now);
                    self.advance();
                    return Some(Event::Decoded(index));
                }
                Phase::Failed => {
                    let index = self.cursor;
                    if let Some(register) = self.table.get(index) {
                        warn!(
                            register.label = %register.label,
                            attempts = self.attempts,
                            "giving up on the register for this scan"
                        );
                    }
                    self.advance();
                    return Some(Event::Failed(index));
                }
            }
        }
    }

    fn retry_or_fail(&mut self, reason: AttemptError) {
        let label = self.table.get(self.cursor).map(|r| r.label.as_str());
        debug!(
            register.label = label,
            attempt = self.attempts,
            error = (&reason as &dyn std::error::Error),
            "request attempt failed"
        );
        self.sent_at = None;
        if self.attempts < self.config.retries {
            self.attempts += 1;
            self.phase = Phase::RequestSent;
        } else {
            self.phase = Phase::Failed;
        }
    }

    fn publish(&mut self, index: usize, now: Instant) {
        let (Some(register), Some(frame)) = (self.table.get(index), self.frame.take()) else {
            return;
        };
        let value = convert::decode(&frame, register.data_type, register.conv_id);
        debug!(
            register.label = %register.label,
            value = %value.format(register.decimals()),
            "decoded register"
        );
        self.last_successful_read = Some(now);
        if register.mode.is_publishable() && !self.sensors.is_bound(&register.label) {
            if let Some(factory) = &mut self.factory {
                match register.kind() {
                    convert::ValueKind::Numeric => {
                        if let Some(handle) = factory.numeric_sensor(register) {
                            self.sensors.register_sensor(&register.label, &handle);
                        }
                    }
                    convert::ValueKind::Text => {
                        if let Some(handle) = factory.text_sensor(register) {
                            self.sensors.register_text_sensor(&register.label, &handle);
                        }
                    }
                }
            }
        }
        match &value {
            Value::Numeric(n) => self.sensors.update(&register.label, *n, now),
            Value::Text(t) => self.sensors.update_text(&register.label, t, now),
        };
        self.values[index] = Some(value);
    }

    fn advance(&mut self) {
        self.sent_at = None;
        self.frame = None;
        self.attempts = 0;
        self.cursor += 1;
        if self.cursor >= self.table.len() {
            self.cursor = 0;
            self.cycle_finished = true;
            if self.last_successful_read.is_none() {
                info!("no register has been read successfully yet");
            }
        }
        self.phase = Phase::Idle;
    }
}

#[derive(thiserror::Error, Debug)]
#[error("no complete response within {0:?}")]
struct ResponseTimeout(Duration);

#[derive(thiserror::Error, Debug)]
enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Timeout(#[from] ResponseTimeout),
}
