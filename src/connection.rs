use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, EngineConfig};
use crate::registers::RegisterTable;
use crate::transport::Transport;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the serial device at {1:?}")]
    OpenDevice(#[source] serialport::Error, String),
}

/// A serial port opened with the X10A line settings.
pub type Port = Box<dyn serialport::SerialPort>;

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Path to the serial device connected to the X10A port of the unit.
    #[arg(long, short = 'd')]
    device: String,

    /// The baudrate of the X10A port.
    #[arg(long, default_value = "9600")]
    baudrate: u32,

    /// Consider a request failed if its response isn't complete within this amount of time.
    #[arg(long, default_value = "300ms")]
    response_timeout: humantime::Duration,

    /// How many times to re-send a request that failed before skipping the register.
    #[arg(long, default_value = "2")]
    retries: u8,

    /// Start a scan of the register table at most this often.
    #[arg(long, default_value = "30s")]
    scan_interval: humantime::Duration,

    /// Wait this long before the very first scan.
    ///
    /// The unit ignores requests for a while after it powers up.
    #[arg(long, default_value = "15s")]
    initial_delay: humantime::Duration,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            response_timeout: *self.response_timeout,
            retries: self.retries,
            scan_interval: *self.scan_interval,
            initial_delay: *self.initial_delay,
        }
    }

    pub fn open(&self) -> Result<Port, Error> {
        info!(device = %self.device, baudrate = self.baudrate, "opening serial device");
        serialport::new(&self.device, self.baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(|e| Error::OpenDevice(e, self.device.clone()))
    }

    /// Open the device and set up an engine polling `table` over it.
    pub fn engine(&self, table: RegisterTable, config: EngineConfig) -> Result<Engine<Port>, Error> {
        let port = self.open()?;
        Ok(Engine::new(table, Transport::new(port), config))
    }
}
