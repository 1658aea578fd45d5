use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use daikin_x10a_tools::climate::{ClimateController, ClimateMode, Relay, RelayError};
use daikin_x10a_tools::engine::{Engine, EngineConfig, Event};
use daikin_x10a_tools::protocol::checksum;
use daikin_x10a_tools::registers::{DataType, RegisterTable};
use daikin_x10a_tools::transport::{SerialLink, Transport};
use tokio_util::bytes::BytesMut;

const LEAVING_WATER: &str = "Leaving water temp.";
const OPERATION_MODE: &str = "Operation Mode";

#[derive(Default)]
struct ScriptedLink {
    replies: VecDeque<Vec<u8>>,
    inbound: Vec<u8>,
}

impl SerialLink for ScriptedLink {
    fn discard_input(&mut self) -> io::Result<()> {
        self.inbound.clear();
        Ok(())
    }

    fn write_all(&mut self, _: &[u8]) -> io::Result<()> {
        if let Some(reply) = self.replies.pop_front() {
            self.inbound.extend(reply);
        }
        Ok(())
    }

    fn read_available(&mut self, buffer: &mut BytesMut) -> io::Result<usize> {
        let n = self.inbound.len();
        buffer.extend_from_slice(&self.inbound);
        self.inbound.clear();
        Ok(n)
    }
}

struct NoopRelay;

impl Relay for NoopRelay {
    fn turn_on(&self) -> Result<(), RelayError> {
        Ok(())
    }
    fn turn_off(&self) -> Result<(), RelayError> {
        Ok(())
    }
}

fn response(registry_id: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x40, registry_id, (data.len() + 2) as u8];
    frame.extend_from_slice(data);
    frame.push(checksum(&frame));
    frame
}

fn engine() -> Engine<ScriptedLink> {
    let mut table = RegisterTable::new();
    table.add_register(1, 0x01, 0, 5, 2, DataType::CEL, LEAVING_WATER).unwrap();
    table.add_register(1, 201, 0, 0x10, 1, DataType::U, OPERATION_MODE).unwrap();
    let config = EngineConfig {
        initial_delay: Duration::ZERO,
        scan_interval: Duration::from_secs(1),
        ..EngineConfig::default()
    };
    let mut link = ScriptedLink::default();
    link.replies.push_back(response(5, &215i16.to_le_bytes()));
    link.replies.push_back(response(0x10, &[3]));
    Engine::new(table, Transport::new(link), config)
}

/// Tick through one scan, returning the time it finished at.
fn scan(engine: &mut Engine<ScriptedLink>, mut now: Instant) -> Instant {
    for _ in 0..100_000 {
        match engine.tick(now) {
            Some(Event::CycleComplete) => return now,
            Some(_) => {}
            None => now += Duration::from_millis(10),
        }
    }
    panic!("scan did not complete");
}

fn controller(source: &str) -> ClimateController {
    ClimateController::new(Arc::new(NoopRelay), Arc::new(NoopRelay), source)
        .with_stale_after(Duration::from_secs(60))
}

#[test]
fn unknown_before_the_first_read() {
    let engine = engine();
    let mut climate = controller(LEAVING_WATER);
    let state = climate.update_state(&engine, Instant::now());
    assert_eq!(state.current_temperature, None);
    assert!(!state.available);
    assert_eq!(state.mode, ClimateMode::Off);
}

#[test]
fn reads_the_source_register() {
    let mut engine = engine();
    let now = scan(&mut engine, Instant::now());
    let mut climate = controller(LEAVING_WATER);
    climate.control(ClimateMode::Heat).unwrap();
    let state = climate.update_state(&engine, now);
    assert_eq!(state.current_temperature, Some(21.5));
    assert!(state.available);
    assert_eq!(state.mode, ClimateMode::Heat);
}

#[test]
fn text_or_missing_source_is_unknown() {
    let mut engine = engine();
    let now = scan(&mut engine, Instant::now());
    assert_eq!(engine.get_register_value(OPERATION_MODE), "defrost");

    let state = controller(OPERATION_MODE).update_state(&engine, now);
    assert_eq!(state.current_temperature, None);
    assert!(!state.available);

    let state = controller("no such register").update_state(&engine, now);
    assert_eq!(state.current_temperature, None);
    assert!(!state.available);
}

#[test]
fn stale_reading_is_unavailable() {
    let mut engine = engine();
    let now = scan(&mut engine, Instant::now());
    let mut climate = controller(LEAVING_WATER);
    assert!(climate.update_state(&engine, now + Duration::from_secs(60)).available);
    let state = climate.update_state(&engine, now + Duration::from_secs(61));
    assert!(!state.available);
    assert_eq!(state.current_temperature, Some(21.5));
}
