use std::collections::BTreeMap;

use homie5::device_description::{HomieNodeDescription, PropertyDescriptionBuilder};
use homie5::{HomieDataType, HomieID};
use rumqttc::v5::AsyncClient;
use rumqttc::v5::mqttbytes::QoS;
use tracing::warn;

use super::common::homie_enum;
use super::node::PropertyUpdate;
use crate::climate::{ClimateMode, ClimateState, Relay, RelayError};

pub(crate) static NODE_ID: HomieID = HomieID::new_const("climate");
pub(crate) static MODE: HomieID = HomieID::new_const("mode");
static CURRENT_TEMPERATURE: HomieID = HomieID::new_const("current-temperature");
static AVAILABLE: HomieID = HomieID::new_const("available");

pub(crate) fn description(source: &str) -> HomieNodeDescription {
    let mut mode = homie_enum::<ClimateMode>().settable(true).retained(true).build();
    mode.name = Some("requested mode".to_string());
    let mut temperature = PropertyDescriptionBuilder::new(HomieDataType::Float)
        .unit(homie5::HOMIE_UNIT_DEGREE_CELSIUS)
        .retained(true)
        .build();
    temperature.name = Some(source.to_string());
    let available = PropertyDescriptionBuilder::new(HomieDataType::Boolean)
        .retained(true)
        .build();
    HomieNodeDescription {
        name: Some("heating and cooling relays".to_string()),
        r#type: None,
        properties: BTreeMap::from([
            (MODE.clone(), mode),
            (CURRENT_TEMPERATURE.clone(), temperature),
            (AVAILABLE.clone(), available),
        ]),
    }
}

/// The property values describing `state`. An unknown temperature keeps its last published value.
pub(crate) fn updates(state: &ClimateState) -> Vec<PropertyUpdate> {
    let update = |prop_id: &HomieID, value: String| PropertyUpdate {
        node_id: NODE_ID.clone(),
        prop_id: prop_id.clone(),
        value,
    };
    let mut updates = vec![
        update(&MODE, state.mode.to_string()),
        update(&AVAILABLE, state.available.to_string()),
    ];
    if let Some(t) = state.current_temperature {
        updates.push(update(&CURRENT_TEMPERATURE, t.to_string()));
    }
    updates
}

/// A relay that is switched by publishing `true` or `false` to an MQTT topic.
pub(crate) struct MqttRelay {
    mqtt: AsyncClient,
    topic: String,
}

impl MqttRelay {
    pub(crate) fn new(mqtt: AsyncClient, topic: String) -> Self {
        Self { mqtt, topic }
    }

    fn set(&self, on: bool) -> Result<(), RelayError> {
        let payload = if on { "true" } else { "false" };
        self.mqtt
            .try_publish(&self.topic, QoS::AtLeastOnce, true, payload)
            .map_err(|e| {
                warn!(
                    topic = %self.topic,
                    error = (&e as &dyn std::error::Error),
                    "could not queue the relay command"
                );
                RelayError(Box::new(e))
            })
    }
}

impl Relay for MqttRelay {
    fn turn_on(&self) -> Result<(), RelayError> {
        self.set(true)
    }

    fn turn_off(&self) -> Result<(), RelayError> {
        self.set(false)
    }
}
