//! Two relay heat/cool thermostat fed from a polled register.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::transport::SerialLink;

pub const DEFAULT_TEMPERATURE_SOURCE: &str = "Leaving water temp. before BUH (R1T)";

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::VariantNames,
    strum::VariantArray,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ClimateMode {
    #[default]
    Off,
    Heat,
    Cool,
}

impl std::fmt::Display for ClimateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(<&'static str>::from(*self))
    }
}

/// An on/off actuator.
pub trait Relay {
    fn turn_on(&self) -> Result<(), RelayError>;
    fn turn_off(&self) -> Result<(), RelayError>;
}

#[derive(thiserror::Error, Debug)]
#[error("the relay did not accept the command")]
pub struct RelayError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("could not release the {0} relay, staying in {1} mode")]
    Release(&'static str, ClimateMode, #[source] RelayError),
    #[error("could not engage the {0} relay, both relays are off")]
    Engage(&'static str, #[source] RelayError),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClimateState {
    pub mode: ClimateMode,
    pub current_temperature: Option<f64>,
    /// Whether `current_temperature` comes from a fresh enough read.
    pub available: bool,
}

pub struct ClimateController {
    mode: ClimateMode,
    heat_relay: Arc<dyn Relay + Send + Sync>,
    cool_relay: Arc<dyn Relay + Send + Sync>,
    source: String,
    stale_after: Option<Duration>,
    state: ClimateState,
}

impl ClimateController {
    pub fn new(
        heat_relay: Arc<dyn Relay + Send + Sync>,
        cool_relay: Arc<dyn Relay + Send + Sync>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            mode: ClimateMode::Off,
            heat_relay,
            cool_relay,
            source: source.into(),
            stale_after: None,
            state: ClimateState {
                mode: ClimateMode::Off,
                current_temperature: None,
                available: false,
            },
        }
    }

    /// Treat the temperature as unavailable if no register was read within `window`.
    pub fn with_stale_after(mut self, window: Duration) -> Self {
        self.stale_after = Some(window);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn mode(&self) -> ClimateMode {
        self.mode
    }

    pub fn state(&self) -> ClimateState {
        self.state
    }

    /// Switch to `mode`. Both relays are released before the new one is engaged, so heating and
    /// cooling are never driven at the same time.
    ///
    /// If a relay cannot be released the previous mode is kept and nothing is engaged. If the
    /// new relay cannot be engaged the controller ends up in [`ClimateMode::Off`].
    pub fn control(&mut self, mode: ClimateMode) -> Result<(), ControlError> {
        info!(from = %self.mode, to = %mode, "changing climate mode");
        let previous = self.mode;
        self.heat_relay
            .turn_off()
            .map_err(|e| ControlError::Release("heat", previous, e))?;
        self.cool_relay
            .turn_off()
            .map_err(|e| ControlError::Release("cool", previous, e))?;
        let engaged = match mode {
            ClimateMode::Off => Ok(()),
            ClimateMode::Heat => self
                .heat_relay
                .turn_on()
                .map_err(|e| ControlError::Engage("heat", e)),
            ClimateMode::Cool => self
                .cool_relay
                .turn_on()
                .map_err(|e| ControlError::Engage("cool", e)),
        };
        self.mode = if engaged.is_ok() { mode } else { ClimateMode::Off };
        self.state.mode = self.mode;
        engaged
    }

    /// Refresh the current temperature from the engine.
    pub fn update_state<L: SerialLink>(&mut self, engine: &Engine<L>, now: Instant) -> ClimateState {
        let raw = engine.get_register_value(&self.source);
        let temperature = if raw.is_empty() {
            debug!(source = %self.source, "temperature source has no value yet");
            None
        } else {
            match raw.parse::<f64>() {
                Ok(t) if t.is_finite() => Some(t),
                _ => {
                    warn!(source = %self.source, value = %raw, "temperature source is not numeric");
                    None
                }
            }
        };
        let fresh = match (engine.last_successful_read(), self.stale_after) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(last), Some(window)) => now.saturating_duration_since(last) <= window,
        };
        if !fresh && temperature.is_some() {
            debug!(source = %self.source, "temperature reading is stale");
        }
        self.state = ClimateState {
            mode: self.mode,
            current_temperature: temperature,
            available: fresh && temperature.is_some(),
        };
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    type Log = Arc<Mutex<Vec<(&'static str, bool)>>>;

    struct RecordingRelay {
        name: &'static str,
        log: Log,
        broken_off: AtomicBool,
        broken_on: AtomicBool,
    }

    impl RecordingRelay {
        fn new(name: &'static str, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                name,
                log: log.clone(),
                broken_off: AtomicBool::new(false),
                broken_on: AtomicBool::new(false),
            })
        }

        fn switch(&self, on: bool, broken: &AtomicBool) -> Result<(), RelayError> {
            if broken.load(Ordering::Relaxed) {
                return Err(RelayError("request queue is full".into()));
            }
            self.log.lock().unwrap().push((self.name, on));
            Ok(())
        }
    }

    impl Relay for RecordingRelay {
        fn turn_on(&self) -> Result<(), RelayError> {
            self.switch(true, &self.broken_on)
        }
        fn turn_off(&self) -> Result<(), RelayError> {
            self.switch(false, &self.broken_off)
        }
    }

    fn relays() -> (Arc<RecordingRelay>, Arc<RecordingRelay>, Log) {
        let log = Log::default();
        (RecordingRelay::new("heat", &log), RecordingRelay::new("cool", &log), log)
    }

    fn controller() -> (ClimateController, Log) {
        let (heat, cool, log) = relays();
        (ClimateController::new(heat, cool, DEFAULT_TEMPERATURE_SOURCE), log)
    }

    /// Replays the relay log and returns the final (heat, cool) states, failing if both were
    /// ever on together.
    fn replay(log: &Log) -> (bool, bool) {
        let mut heat = false;
        let mut cool = false;
        for (name, on) in log.lock().unwrap().iter() {
            match *name {
                "heat" => heat = *on,
                _ => cool = *on,
            }
            assert!(!(heat && cool), "both relays active");
        }
        (heat, cool)
    }

    #[test]
    fn never_both_relays_on() {
        let (mut climate, log) = controller();
        climate.control(ClimateMode::Heat).unwrap();
        climate.control(ClimateMode::Cool).unwrap();
        climate.control(ClimateMode::Heat).unwrap();
        climate.control(ClimateMode::Off).unwrap();
        assert_eq!(replay(&log), (false, false));
        assert_eq!(climate.mode(), ClimateMode::Off);
    }

    #[test]
    fn failed_release_keeps_the_previous_mode() {
        let (heat, cool, log) = relays();
        let mut climate = ClimateController::new(heat.clone(), cool, DEFAULT_TEMPERATURE_SOURCE);
        climate.control(ClimateMode::Heat).unwrap();
        heat.broken_off.store(true, Ordering::Relaxed);
        let err = climate.control(ClimateMode::Cool).unwrap_err();
        assert!(matches!(err, ControlError::Release("heat", ClimateMode::Heat, _)));
        assert_eq!(replay(&log), (true, false));
        assert_eq!(climate.mode(), ClimateMode::Heat);
        assert_eq!(climate.state().mode, ClimateMode::Heat);

        heat.broken_off.store(false, Ordering::Relaxed);
        climate.control(ClimateMode::Cool).unwrap();
        assert_eq!(replay(&log), (false, true));
        assert_eq!(climate.mode(), ClimateMode::Cool);
    }

    #[test]
    fn failed_engage_leaves_everything_off() {
        let (heat, cool, log) = relays();
        let mut climate = ClimateController::new(heat, cool.clone(), DEFAULT_TEMPERATURE_SOURCE);
        climate.control(ClimateMode::Heat).unwrap();
        cool.broken_on.store(true, Ordering::Relaxed);
        let err = climate.control(ClimateMode::Cool).unwrap_err();
        assert!(matches!(err, ControlError::Engage("cool", _)));
        assert_eq!(replay(&log), (false, false));
        assert_eq!(climate.mode(), ClimateMode::Off);
    }

    #[test]
    fn mode_names() {
        assert_eq!("heat".parse::<ClimateMode>().unwrap(), ClimateMode::Heat);
        assert_eq!(ClimateMode::Cool.to_string(), "cool");
        assert!("dry".parse::<ClimateMode>().is_err());
        assert_eq!(ClimateMode::default(), ClimateMode::Off);
    }
}
