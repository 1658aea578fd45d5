//! Label keyed bindings between decoded registers and whoever consumes their values.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, warn};

use crate::convert::{Value, ValueKind};
use crate::registers::RegisterDescriptor;

pub trait NumericSensor {
    fn publish_state(&self, value: f64);
}

pub trait TextSensor {
    fn publish_state(&self, value: &str);
}

/// Creates sensor handles for publishable registers that nobody bound explicitly.
///
/// The factory keeps the handles alive; the registry only ever holds weak references.
pub trait SensorFactory {
    fn numeric_sensor(&mut self, register: &RegisterDescriptor) -> Option<Arc<dyn NumericSensor>>;
    fn text_sensor(&mut self, register: &RegisterDescriptor) -> Option<Arc<dyn TextSensor>>;
}

enum Handle {
    Numeric(Weak<dyn NumericSensor>),
    Text(Weak<dyn TextSensor>),
}

pub struct SensorBinding {
    handle: Handle,
    last_value: Option<Value>,
    last_update: Option<Instant>,
}

impl SensorBinding {
    fn new(handle: Handle) -> Self {
        Self {
            handle,
            last_value: None,
            last_update: None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self.handle {
            Handle::Numeric(_) => ValueKind::Numeric,
            Handle::Text(_) => ValueKind::Text,
        }
    }

    pub fn last_value(&self) -> Option<&Value> {
        self.last_value.as_ref()
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Whether the consumer behind this binding still exists.
    pub fn is_live(&self) -> bool {
        match &self.handle {
            Handle::Numeric(h) => h.strong_count() != 0,
            Handle::Text(h) => h.strong_count() != 0,
        }
    }
}

#[derive(Default)]
pub struct SensorRegistry {
    bindings: BTreeMap<String, SensorBinding>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sensor(&mut self, label: &str, handle: &Arc<dyn NumericSensor>) {
        self.bind(label, Handle::Numeric(Arc::downgrade(handle)));
    }

    pub fn register_text_sensor(&mut self, label: &str, handle: &Arc<dyn TextSensor>) {
        self.bind(label, Handle::Text(Arc::downgrade(handle)));
    }

    fn bind(&mut self, label: &str, handle: Handle) {
        let binding = SensorBinding::new(handle);
        let kind = binding.kind();
        if let Some(previous) = self.bindings.insert(label.to_string(), binding) {
            warn!(
                register.label = label,
                previous = %previous.kind(),
                new = %kind,
                "replacing an existing sensor binding"
            );
        } else {
            debug!(register.label = label, %kind, "bound a sensor");
        }
    }

    pub fn binding(&self, label: &str) -> Option<&SensorBinding> {
        self.bindings.get(label)
    }

    pub fn is_bound(&self, label: &str) -> bool {
        self.bindings.get(label).is_some_and(SensorBinding::is_live)
    }

    /// Forward a numeric value. Returns `false` if nothing received it.
    pub fn update(&mut self, label: &str, value: f64, now: Instant) -> bool {
        let Some(binding) = self.live_binding(label, ValueKind::Numeric) else {
            return false;
        };
        let Handle::Numeric(handle) = &binding.handle else {
            return false;
        };
        let Some(sensor) = handle.upgrade() else {
            return false;
        };
        sensor.publish_state(value);
        binding.last_value = Some(Value::Numeric(value));
        binding.last_update = Some(now);
        true
    }

    /// Forward a text value. Returns `false` if nothing received it.
    pub fn update_text(&mut self, label: &str, value: &str, now: Instant) -> bool {
        let Some(binding) = self.live_binding(label, ValueKind::Text) else {
            return false;
        };
        let Handle::Text(handle) = &binding.handle else {
            return false;
        };
        let Some(sensor) = handle.upgrade() else {
            return false;
        };
        sensor.publish_state(value);
        binding.last_value = Some(Value::Text(value.to_string()));
        binding.last_update = Some(now);
        true
    }

    fn live_binding(&mut self, label: &str, kind: ValueKind) -> Option<&mut SensorBinding> {
        let Some(binding) = self.bindings.get_mut(label) else {
            debug!(register.label = label, "no sensor bound, discarding value");
            return None;
        };
        if binding.kind() != kind {
            warn!(
                register.label = label,
                bound = %binding.kind(),
                value = %kind,
                "bound sensor does not accept this kind of value"
            );
            return None;
        }
        if !binding.is_live() {
            debug!(register.label = label, "bound sensor has been dropped, discarding value");
            return None;
        }
        Some(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);
    impl NumericSensor for Recorder {
        fn publish_state(&self, value: f64) {
            self.0.lock().unwrap().push(value.to_string());
        }
    }
    impl TextSensor for Recorder {
        fn publish_state(&self, value: &str) {
            self.0.lock().unwrap().push(value.to_string());
        }
    }
    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn rebinding_replaces_previous_handle() {
        let now = Instant::now();
        let mut registry = SensorRegistry::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        registry.register_sensor("t", &(first.clone() as Arc<dyn NumericSensor>));
        assert!(registry.update("t", 1.0, now));
        registry.register_sensor("t", &(second.clone() as Arc<dyn NumericSensor>));
        assert!(registry.update("t", 2.0, now));
        assert_eq!(first.seen(), ["1"]);
        assert_eq!(second.seen(), ["2"]);
        assert_eq!(registry.binding("t").unwrap().last_value(), Some(&Value::Numeric(2.0)));
    }

    #[test]
    fn updates_without_binding_are_discarded() {
        let mut registry = SensorRegistry::new();
        assert!(!registry.update("missing", 1.0, Instant::now()));
        assert!(!registry.update_text("missing", "on", Instant::now()));
    }

    #[test]
    fn dropped_and_mismatched_handles() {
        let now = Instant::now();
        let mut registry = SensorRegistry::new();
        let text = Arc::new(Recorder::default());
        registry.register_text_sensor("mode", &(text.clone() as Arc<dyn TextSensor>));
        assert!(!registry.update("mode", 3.0, now));
        assert!(registry.update_text("mode", "heating", now));
        assert_eq!(text.seen(), ["heating"]);
        drop(text);
        assert!(!registry.is_bound("mode"));
        assert!(!registry.update_text("mode", "cooling", now));
    }
}
