use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use homie5::HomieID;
use homie5::device_description::HomieNodeDescription;
use tokio::sync::mpsc::UnboundedSender;

use super::common::{register_property, registry_node_id, slug};
use crate::registers::{RegisterDescriptor, RegisterTable};
use crate::sensor::{NumericSensor, SensorFactory, TextSensor};

/// A new value for a homie property, waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub node_id: HomieID,
    pub prop_id: HomieID,
    pub value: String,
}

/// Where in the homie device each publishable register ends up.
///
/// Registers are grouped into one node per registry.
pub struct RegistryNodes {
    nodes: BTreeMap<HomieID, HomieNodeDescription>,
    properties: HashMap<String, (HomieID, HomieID)>,
}

impl RegistryNodes {
    pub fn new(table: &RegisterTable) -> Self {
        let mut nodes = BTreeMap::<HomieID, HomieNodeDescription>::new();
        let mut taken = BTreeSet::<(HomieID, String)>::new();
        let mut properties = HashMap::new();
        for register in table.iter().filter(|r| r.mode.is_publishable()) {
            let node_id = registry_node_id(register.registry_id);
            let base = slug(&register.label);
            let mut candidate = base.clone();
            let mut suffix = 2;
            while taken.contains(&(node_id.clone(), candidate.clone())) {
                candidate = format!("{base}-{suffix}");
                suffix += 1;
            }
            let Ok(prop_id) = HomieID::try_from(candidate.clone()) else {
                tracing::warn!(
                    register.label = %register.label,
                    prop_id = %candidate,
                    "register label does not make for a valid property id, not publishing"
                );
                continue;
            };
            taken.insert((node_id.clone(), candidate));
            let node = nodes.entry(node_id.clone()).or_insert_with(|| HomieNodeDescription {
                name: Some(format!("registry {:#04x}", register.registry_id)),
                r#type: None,
                properties: BTreeMap::new(),
            });
            node.properties.insert(prop_id.clone(), register_property(register));
            properties.insert(register.label.clone(), (node_id.clone(), prop_id));
        }
        Self { nodes, properties }
    }

    pub fn descriptions(&self) -> impl Iterator<Item = (&HomieID, &HomieNodeDescription)> {
        self.nodes.iter()
    }

    pub fn property_of(&self, label: &str) -> Option<&(HomieID, HomieID)> {
        self.properties.get(label)
    }

    pub fn sensor_factory(&self, updates: UnboundedSender<PropertyUpdate>) -> PropertySensors {
        PropertySensors {
            properties: self.properties.clone(),
            updates,
            sensors: Vec::new(),
        }
    }
}

/// Forwards a register's values to its homie property.
pub struct PropertySensor {
    node_id: HomieID,
    prop_id: HomieID,
    decimals: u8,
    updates: UnboundedSender<PropertyUpdate>,
}

impl PropertySensor {
    fn send(&self, value: String) {
        let update = PropertyUpdate {
            node_id: self.node_id.clone(),
            prop_id: self.prop_id.clone(),
            value,
        };
        if self.updates.send(update).is_err() {
            tracing::debug!(prop_id = %self.prop_id, "nobody is publishing property updates anymore");
        }
    }
}

impl NumericSensor for PropertySensor {
    fn publish_state(&self, value: f64) {
        self.send(format!("{:.*}", usize::from(self.decimals), value));
    }
}

impl TextSensor for PropertySensor {
    fn publish_state(&self, value: &str) {
        self.send(value.to_string());
    }
}

/// Hands out [`PropertySensor`]s as the engine discovers registers with values.
pub struct PropertySensors {
    properties: HashMap<String, (HomieID, HomieID)>,
    updates: UnboundedSender<PropertyUpdate>,
    sensors: Vec<Arc<PropertySensor>>,
}

impl PropertySensors {
    fn sensor(&mut self, register: &RegisterDescriptor) -> Option<Arc<PropertySensor>> {
        let (node_id, prop_id) = self.properties.get(&register.label)?.clone();
        let sensor = Arc::new(PropertySensor {
            node_id,
            prop_id,
            decimals: register.decimals(),
            updates: self.updates.clone(),
        });
        self.sensors.push(Arc::clone(&sensor));
        Some(sensor)
    }
}

impl SensorFactory for PropertySensors {
    fn numeric_sensor(&mut self, register: &RegisterDescriptor) -> Option<Arc<dyn NumericSensor>> {
        self.sensor(register).map(|s| s as Arc<dyn NumericSensor>)
    }

    fn text_sensor(&mut self, register: &RegisterDescriptor) -> Option<Arc<dyn TextSensor>> {
        self.sensor(register).map(|s| s as Arc<dyn TextSensor>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::DataType;

    #[test]
    fn registers_group_by_registry() {
        let mut table = RegisterTable::new();
        table.add_register(1, 1, 0, 0x61, 2, DataType::CEL, "Temp (a)").unwrap();
        table.add_register(1, 1, 2, 0x61, 2, DataType::CEL, "temp a").unwrap();
        table.add_register(1, 201, 0, 0x10, 1, DataType::U, "Operation Mode").unwrap();
        table.add_register(0, 1, 4, 0x61, 2, DataType::S, "Hidden").unwrap();
        let nodes = RegistryNodes::new(&table);
        assert_eq!(nodes.descriptions().count(), 2);
        let (node, prop) = nodes.property_of("Temp (a)").unwrap();
        assert_eq!(node.to_string(), "registry-61");
        assert_eq!(prop.to_string(), "temp-a");
        assert_eq!(nodes.property_of("temp a").unwrap().1.to_string(), "temp-a-2");
        assert!(nodes.property_of("Hidden").is_none());
    }

    #[test]
    fn sensors_forward_formatted_values() {
        let mut table = RegisterTable::new();
        table.add_register(1, 1, 0, 0x61, 2, DataType::CEL, "LWT").unwrap();
        let nodes = RegistryNodes::new(&table);
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let mut factory = nodes.sensor_factory(sender);
        let sensor = factory.numeric_sensor(table.lookup("LWT").unwrap()).unwrap();
        sensor.publish_state(21.5);
        let update = receiver.try_recv().unwrap();
        assert_eq!(update.node_id.to_string(), "registry-61");
        assert_eq!(update.prop_id.to_string(), "lwt");
        assert_eq!(update.value, "21.5");
    }
}
