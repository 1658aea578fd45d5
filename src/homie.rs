mod climate_node;
mod common;
mod node;

use std::sync::Arc;
use std::time::{Duration, Instant};

use homie5::client::{Publish, QoS, Subscription};
use homie5::device_description::HomieDeviceDescription;
use homie5::{Homie5DeviceProtocol, HomieDeviceStatus, HomieDomain, HomieID, PropertyRef};
use rumqttc::v5::mqttbytes::v5::Packet;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

use crate::climate::{ClimateController, ClimateMode, DEFAULT_TEMPERATURE_SOURCE};
use crate::connection;
use crate::engine::{Engine, Event};
use crate::registers::{self, LoadError};
use crate::transport::SerialLink;
use node::{PropertyUpdate, RegistryNodes};

/// Publish the registers as a Homie 5 device over MQTT.
#[derive(clap::Parser)]
pub struct Args {
    #[clap(flatten)]
    connection: connection::Args,
    #[clap(flatten)]
    registers: registers::Args,

    /// MQTT broker to connect to.
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,
    #[arg(long, default_value = "daikin-x10a")]
    mqtt_client_id: String,
    /// The homie device ID.
    #[arg(long, default_value = "daikin-x10a")]
    device_id: String,
    #[arg(long, default_value = "Daikin Altherma")]
    device_name: String,

    /// Topic of the relay enabling heating. Exposes a `climate` node when set.
    #[arg(long, requires = "cool_relay_topic")]
    heat_relay_topic: Option<String>,
    /// Topic of the relay enabling cooling.
    #[arg(long, requires = "heat_relay_topic")]
    cool_relay_topic: Option<String>,
    /// Label of the register to report as the current temperature of the `climate` node.
    #[arg(long, default_value = DEFAULT_TEMPERATURE_SOURCE)]
    temperature_source: String,
    /// Report the temperature as unavailable if no register was read in this amount of time.
    #[arg(long, default_value = "2m")]
    stale_after: humantime::Duration,

    /// How often to drive the register engine.
    #[arg(long, default_value = "10ms")]
    tick: humantime::Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not load the register table")]
    Load(#[source] LoadError),
    #[error("could not set up the connection to the unit")]
    Connection(#[source] connection::Error),
    #[error("`{0}` is not a valid homie device id")]
    DeviceId(String),
    #[error("could not start the async runtime")]
    Runtime(#[source] std::io::Error),
    #[error("could not publish to the MQTT broker")]
    Publish(#[source] rumqttc::v5::ClientError),
    #[error("could not subscribe to the settable properties")]
    Subscribe(#[source] rumqttc::v5::ClientError),
    #[error("could not produce the homie messages for the device")]
    Protocol(#[source] homie5::Homie5ProtocolError),
    #[error("the MQTT event loop has stopped")]
    EventLoopGone,
}

pub fn run(args: Args) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Runtime)?;
    runtime.block_on(run_device(args))
}

async fn run_device(args: Args) -> Result<(), Error> {
    let table = args.registers.load().map_err(Error::Load)?;
    let device_id = HomieID::try_from(args.device_id.clone())
        .map_err(|_| Error::DeviceId(args.device_id.clone()))?;
    let (protocol, last_will) = Homie5DeviceProtocol::new(device_id, HomieDomain::Default);
    let mut options =
        rumqttc::v5::MqttOptions::new(&args.mqtt_client_id, &args.mqtt_host, args.mqtt_port);
    options.set_keep_alive(Duration::from_secs(5));
    options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
        last_will.topic,
        last_will.message,
        convert_qos(last_will.qos),
        last_will.retain,
        None,
    ));
    let (mqtt, event_loop) = rumqttc::v5::AsyncClient::new(options, 64);
    let (command_sender, commands) = mpsc::unbounded_channel();
    let event_loop_task = AbortOnDropHandle::new(tokio::spawn(forward_commands(
        event_loop,
        command_sender,
    )));

    let nodes = RegistryNodes::new(&table);
    let (update_sender, updates) = mpsc::unbounded_channel();
    let factory = nodes.sensor_factory(update_sender);
    let mut engine = args
        .connection
        .engine(table, args.connection.engine_config())
        .map_err(Error::Connection)?;
    engine.set_sensor_factory(Box::new(factory));

    let climate = match (&args.heat_relay_topic, &args.cool_relay_topic) {
        (Some(heat), Some(cool)) => {
            if engine.table().lookup(&args.temperature_source).is_err() {
                warn!(
                    source = %args.temperature_source,
                    "temperature source is not in the register table, temperature will stay unknown"
                );
            }
            let heat = climate_node::MqttRelay::new(mqtt.clone(), heat.clone());
            let cool = climate_node::MqttRelay::new(mqtt.clone(), cool.clone());
            Some(
                ClimateController::new(
                    Arc::new(heat),
                    Arc::new(cool),
                    args.temperature_source.clone(),
                )
                .with_stale_after(*args.stale_after),
            )
        }
        _ => None,
    };

    let mut description = homie5::device_description::DeviceDescriptionBuilder::new()
        .name(args.device_name.as_str());
    for (node_id, node) in nodes.descriptions() {
        description = description.add_node(node_id.clone(), node.clone());
    }
    if let Some(climate) = &climate {
        description = description.add_node(
            climate_node::NODE_ID.clone(),
            climate_node::description(climate.source()),
        );
    }
    let mut device = X10aDevice {
        mqtt,
        protocol,
        state: HomieDeviceStatus::Init,
        description: description.build(),
        engine,
        climate,
        updates,
        commands,
        tick: *args.tick,
        _event_loop_task: event_loop_task,
    };
    device.publish_device().await?;
    device.run().await
}

struct X10aDevice<L> {
    mqtt: rumqttc::v5::AsyncClient,
    protocol: Homie5DeviceProtocol,
    state: HomieDeviceStatus,
    description: HomieDeviceDescription,
    engine: Engine<L>,
    climate: Option<ClimateController>,
    updates: mpsc::UnboundedReceiver<PropertyUpdate>,
    commands: mpsc::UnboundedReceiver<Command>,
    tick: Duration,
    // Held for its drop handler.
    _event_loop_task: AbortOnDropHandle<()>,
}

impl<L: SerialLink> X10aDevice<L> {
    async fn publish_device(&mut self) -> Result<(), Error> {
        for step in homie5::homie_device_publish_steps() {
            match step {
                homie5::DevicePublishStep::DeviceStateInit => {
                    self.state = HomieDeviceStatus::Init;
                    let p = self.protocol.publish_state(self.state);
                    self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
                homie5::DevicePublishStep::DeviceDescription => {
                    let p = self
                        .protocol
                        .publish_description(&self.description)
                        .map_err(Error::Protocol)?;
                    self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
                homie5::DevicePublishStep::PropertyValues => {
                    // Register values are only known once the first scan completes. They are
                    // published as they come in.
                    if let Some(climate) = &self.climate {
                        for update in climate_node::updates(&climate.state()) {
                            self.publish_update(update).await?;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                homie5::DevicePublishStep::SubscribeProperties => {
                    // An empty subscription surfaces as an `EmptySubscription` error from the
                    // event loop.
                    let mut p = self
                        .protocol
                        .subscribe_props(&self.description)
                        .map_err(Error::Protocol)?
                        .peekable();
                    if p.peek().is_some() {
                        self.mqtt.homie_subscribe(p).await.map_err(Error::Subscribe)?;
                    }
                }
                homie5::DevicePublishStep::DeviceStateReady => {
                    debug!("device becomes ready...");
                    self.state = HomieDeviceStatus::Ready;
                    let p = self.protocol.publish_state(self.state);
                    self.mqtt.homie_publish(p).await.map_err(Error::Publish)?;
                }
            }
        }
        info!("published the homie device");
        Ok(())
    }

    async fn run(mut self) -> Result<(), Error> {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.drive_engine().await?,
                Some(update) = self.updates.recv() => self.publish_update(update).await?,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Err(Error::EventLoopGone);
                    };
                    self.handle_command(command).await?;
                }
            }
        }
    }

    async fn drive_engine(&mut self) -> Result<(), Error> {
        let mut refreshed = None;
        while let Some(event) = self.engine.tick(Instant::now()) {
            if event != Event::CycleComplete {
                continue;
            }
            trace!(
                last_read_ms = self.engine.last_successful_read_ms(),
                "register scan complete"
            );
            if let Some(climate) = &mut self.climate {
                refreshed = Some(climate.update_state(&self.engine, Instant::now()));
            }
        }
        if let Some(state) = refreshed {
            for update in climate_node::updates(&state) {
                self.publish_update(update).await?;
            }
        }
        Ok(())
    }

    async fn publish_update(&mut self, update: PropertyUpdate) -> Result<(), Error> {
        let Some(pd) = self
            .description
            .get_property_by_id(&update.node_id, &update.prop_id)
        else {
            warn!(
                node_id = %update.node_id,
                prop_id = %update.prop_id,
                "property update without description"
            );
            return Ok(());
        };
        let p = self
            .protocol
            .publish_value(&update.node_id, &update.prop_id, update.value, pd.retained);
        self.mqtt.homie_publish(p).await.map_err(Error::Publish)
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), Error> {
        let Command::Set { property, value } = command;
        if property.device_id() != self.protocol.device_ref().device_id() {
            debug!(?property, "set command for another device");
            return Ok(());
        }
        if property.node_id() != &climate_node::NODE_ID || property.prop_id() != &climate_node::MODE
        {
            warn!(?property, "property is not settable");
            return Ok(());
        }
        let Some(climate) = &mut self.climate else {
            return Ok(());
        };
        let mode = match value.parse::<ClimateMode>() {
            Ok(mode) => mode,
            Err(_) => {
                warn!(%value, "unknown climate mode requested");
                return Ok(());
            }
        };
        if let Err(e) = climate.control(mode) {
            warn!(
                error = (&e as &dyn std::error::Error),
                mode = %climate.mode(),
                "could not change the climate mode"
            );
        }
        let state = climate.update_state(&self.engine, Instant::now());
        for update in climate_node::updates(&state) {
            self.publish_update(update).await?;
        }
        Ok(())
    }
}

async fn forward_commands(
    mut event_loop: rumqttc::v5::EventLoop,
    commands: mpsc::UnboundedSender<Command>,
) {
    loop {
        match event_loop.poll().await {
            Ok(rumqttc::v5::Event::Incoming(Packet::Publish(publish))) => {
                match Command::try_from_mqtt_command(publish) {
                    Ok(command) => {
                        if commands.send(command).is_err() {
                            return;
                        }
                    }
                    Err(publish) => trace!(topic = ?publish.topic, "ignoring a publish"),
                }
            }
            Ok(event) => trace!(?event, "mqtt event"),
            Err(e) => {
                warn!(
                    error = (&e as &dyn std::error::Error),
                    "MQTT connection failed, will reconnect"
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

trait MqttClientExt {
    type PublishError;
    type SubscribeError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError>;
    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError>;
}

impl MqttClientExt for rumqttc::v5::AsyncClient {
    type PublishError = rumqttc::v5::ClientError;
    type SubscribeError = rumqttc::v5::ClientError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError> {
        self.publish(p.topic, convert_qos(p.qos), p.retain, p.payload)
            .await
    }

    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError> {
        self.subscribe_many(
            subs.map(|sub| {
                rumqttc::v5::mqttbytes::v5::Filter::new(sub.topic, convert_qos(sub.qos))
            }),
        )
        .await
    }
}

pub fn convert_qos(homie: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match homie {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}

enum Command {
    Set { property: PropertyRef, value: String },
}

impl Command {
    fn try_from_mqtt_command(
        msg: rumqttc::v5::mqttbytes::v5::Publish,
    ) -> Result<Self, rumqttc::v5::mqttbytes::v5::Publish> {
        let Ok(topic) = std::str::from_utf8(&msg.topic) else {
            return Err(msg);
        };
        match homie5::parse_mqtt_message(topic, &msg.payload) {
            Ok(homie5::Homie5Message::PropertySet {
                property,
                set_value,
            }) => Ok(Self::Set {
                property,
                value: set_value,
            }),
            _ => Err(msg),
        }
    }
}
