pub mod registers {
    use crate::convert::ValueKind;
    use crate::output::{self, Record};
    use crate::registers::{self, DataType, LoadError, Mode, RegisterDescriptor};

    /// List the register table that the other commands poll.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        registers: registers::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Only list registers with this text in their label, or in this registry (e.g. `0x61`).
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the register table")]
        Load(#[source] LoadError),
        #[error("could not output the register table")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema<'a> {
        pub label: &'a str,
        pub registry_id: u8,
        pub offset: u8,
        pub data_size: u8,
        pub data_type: DataType,
        pub conv_id: u16,
        pub kind: ValueKind,
        pub mode: Mode,
        pub unit: Option<&'a str>,
        pub device_class: Option<&'a str>,
    }

    impl<'a> From<&'a RegisterDescriptor> for RegisterSchema<'a> {
        fn from(register: &'a RegisterDescriptor) -> Self {
            Self {
                label: &register.label,
                registry_id: register.registry_id,
                offset: register.offset,
                data_size: register.data_size,
                data_type: register.data_type,
                conv_id: register.conv_id,
                kind: register.kind(),
                mode: register.mode,
                unit: register.unit.as_deref(),
                device_class: register.device_class.as_deref(),
            }
        }
    }

    impl RegisterSchema<'_> {
        pub fn is_match(&self, pattern: &str) -> bool {
            if self.label.to_lowercase().contains(&pattern.to_lowercase()) {
                return true;
            }
            let registry = format!("{:#04x}", self.registry_id);
            registry.eq_ignore_ascii_case(pattern)
        }
    }

    impl Record for RegisterSchema<'_> {
        const HEADERS: &'static [&'static str] = &[
            "Label", "Registry", "Offset", "Size", "Type", "Conversion", "Kind", "Mode", "Unit",
            "Class",
        ];
        fn cells(&self) -> Vec<String> {
            vec![
                self.label.to_string(),
                format!("{:#04x}", self.registry_id),
                self.offset.to_string(),
                self.data_size.to_string(),
                self.data_type.to_string(),
                self.conv_id.to_string(),
                self.kind.to_string(),
                self.mode.to_string(),
                self.unit.unwrap_or_default().to_string(),
                self.device_class.unwrap_or_default().to_string(),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let table = args.registers.load().map_err(Error::Load)?;
        let mut output = args.output.open::<RegisterSchema>().map_err(Error::Output)?;
        for register in &table {
            let schema = RegisterSchema::from(register);
            if let Some(pattern) = &args.filter {
                if !schema.is_match(pattern) {
                    continue;
                }
            }
            output.record(&schema).map_err(Error::Output)?;
        }
        output.finish().map_err(Error::Output)
    }
}

pub mod conversions {
    use strum::VariantArray as _;

    use crate::convert::TextConversion;
    use crate::output::{self, Record};

    /// List the codes of every conversion that turns a register into text.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list this conversion id.
        #[arg(long)]
        conv_id: Option<u16>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("{0} is not a text conversion id")]
        NotText(u16),
        #[error("could not output the conversions")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct ConversionCode {
        conv_id: u16,
        conversion: &'static str,
        code: u32,
        name: &'static str,
    }

    impl Record for ConversionCode {
        const HEADERS: &'static [&'static str] = &["Conversion", "Name", "Code", "Value"];
        fn cells(&self) -> Vec<String> {
            vec![
                self.conv_id.to_string(),
                self.conversion.to_string(),
                self.code.to_string(),
                self.name.to_string(),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let conversions = match args.conv_id {
            None => TextConversion::VARIANTS.to_vec(),
            Some(id) => vec![TextConversion::from_conv_id(id).ok_or(Error::NotText(id))?],
        };
        let mut output = args.output.open::<ConversionCode>().map_err(Error::Output)?;
        for conversion in conversions {
            for (code, name) in conversion.codes() {
                let record = ConversionCode {
                    conv_id: conversion.conv_id(),
                    conversion: conversion.into(),
                    code,
                    name,
                };
                output.record(&record).map_err(Error::Output)?;
            }
        }
        output.finish().map_err(Error::Output)
    }
}

pub mod read {
    use std::time::{Duration, Instant};

    use crate::connection;
    use crate::convert::Value;
    use crate::engine::Event;
    use crate::output::{self, Record};
    use crate::registers::{self, LoadError, RegisterError};

    /// Read every register of the table once and print the values.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        registers: registers::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Only read the registers with these labels.
        #[arg(long = "label", short = 'l')]
        labels: Vec<String>,
        /// How long to sleep between engine ticks.
        #[arg(long, default_value = "5ms")]
        tick: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the register table")]
        Load(#[source] LoadError),
        #[error("could not select the requested registers")]
        Select(#[source] RegisterError),
        #[error("could not set up the connection to the unit")]
        Connection(#[source] connection::Error),
        #[error("could not output the register values")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Reading<'a> {
        label: &'a str,
        registry_id: u8,
        offset: u8,
        value: Option<&'a Value>,
        unit: Option<&'a str>,
        #[serde(skip)]
        decimals: u8,
    }

    impl Record for Reading<'_> {
        const HEADERS: &'static [&'static str] = &["Label", "Registry", "Offset", "Value", "Unit"];
        fn cells(&self) -> Vec<String> {
            vec![
                self.label.to_string(),
                format!("{:#04x}", self.registry_id),
                self.offset.to_string(),
                self.value
                    .map(|v| v.format(self.decimals))
                    .unwrap_or_else(|| "failed".to_string()),
                self.unit.unwrap_or_default().to_string(),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let table = args.registers.load().map_err(Error::Load)?;
        let table = if args.labels.is_empty() {
            table
        } else {
            table.subset(args.labels.iter().map(String::as_str)).map_err(Error::Select)?
        };
        let mut config = args.connection.engine_config();
        config.initial_delay = Duration::ZERO;
        let mut engine = args.connection.engine(table, config).map_err(Error::Connection)?;
        let mut failed = 0;
        while !engine.table().is_empty() {
            match engine.tick(Instant::now()) {
                Some(Event::CycleComplete) => break,
                Some(Event::Failed(_)) => failed += 1,
                Some(Event::Decoded(_)) => continue,
                None => std::thread::sleep(*args.tick),
            }
        }
        tracing::info!(failed, total = engine.table().len(), "finished reading registers");
        let mut output = args.output.open::<Reading>().map_err(Error::Output)?;
        for register in engine.table() {
            let value = engine
                .register_value(&register.label)
                .map_err(Error::Select)?;
            let reading = Reading {
                label: &register.label,
                registry_id: register.registry_id,
                offset: register.offset,
                value,
                unit: register.unit.as_deref(),
                decimals: register.decimals(),
            };
            output.record(&reading).map_err(Error::Output)?;
        }
        output.finish().map_err(Error::Output)
    }
}
