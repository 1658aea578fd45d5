use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::convert::ValueKind;

/// Largest payload a response frame can carry.
///
/// The length byte counts the whole frame minus two, and the header plus trailer take four bytes.
pub const MAX_FRAME_PAYLOAD: usize = u8::MAX as usize - 2;

/// Widest single field the value converter will interpret.
pub const MAX_FIELD_BYTES: u8 = 4;

#[derive(Clone, Copy, Debug, serde::Serialize, PartialEq, Eq)]
pub struct DataType {
    scale: u16,
    signed: bool,
}

impl DataType {
    // Convenience aliases for the nicely tabulated `builtin_registers` macro below.
    pub const U: Self = Self {
        scale: 1,
        signed: false,
    };
    pub const S: Self = Self {
        scale: 1,
        signed: true,
    };
    pub const CEL: Self = Self {
        scale: 10,
        signed: true,
    };
    pub const U10: Self = Self {
        scale: 10,
        signed: false,
    };
    pub const S100: Self = Self {
        scale: 100,
        signed: true,
    };
    pub const U100: Self = Self {
        scale: 100,
        signed: false,
    };

    const BY_CODE: [Self; 6] = [Self::U, Self::S, Self::CEL, Self::U10, Self::S100, Self::U100];

    /// Data type for a `dataType` code used in register configuration.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::BY_CODE.get(usize::from(code)).copied()
    }

    pub fn code(&self) -> u8 {
        Self::BY_CODE
            .iter()
            .position(|v| v == self)
            .map(|v| v as u8)
            .unwrap_or(u8::MAX)
    }

    pub const fn is_signed(&self) -> bool {
        self.signed
    }

    pub const fn scale(&self) -> u16 {
        self.scale
    }

    /// Number of decimals needed to show a value of this type without losing precision.
    pub const fn default_decimals(&self) -> u8 {
        match self.scale {
            1 => 0,
            10 => 1,
            100 => 2,
            _ => 3,
        }
    }

    /// Interpret little-endian bytes as an integer of this type's signedness.
    ///
    /// Width is taken from the slice. Bytes past the eighth are ignored.
    pub fn integer_from_bytes(self, bs: &[u8]) -> i64 {
        let bs = &bs[..bs.len().min(8)];
        let mut buffer = [0u8; 8];
        buffer[..bs.len()].copy_from_slice(bs);
        let unsigned = u64::from_le_bytes(buffer);
        let bits = 8 * bs.len() as u32;
        if !self.signed || bits == 0 || bits == 64 {
            return unsigned as i64;
        }
        let shift = 64 - bits;
        ((unsigned << shift) as i64) >> shift
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.signed { "S/" } else { "U/" })?;
        f.write_fmt(format_args!("{}", self.scale))?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Mode(u8);

impl Mode {
    pub const PUBLISH: Self = Self(1);
    pub const INTERNAL: Self = Self(0);

    pub const fn new(tag: u8) -> Self {
        Self(tag)
    }

    pub const fn tag(&self) -> u8 {
        self.0
    }

    /// Publishable registers get a sensor bound to them automatically.
    pub const fn is_publishable(&self) -> bool {
        self.0 == Self::PUBLISH.0
    }
}

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.0)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_publishable() {
            f.write_str("publish")
        } else {
            f.write_fmt(format_args!("internal({})", self.0))
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RegisterError {
    #[error("register label must not be empty")]
    EmptyLabel,
    #[error("register `{label}` has a degenerate data size of {size} bytes")]
    DataSize { label: String, size: u8 },
    #[error("register `{label}` reaches past the largest frame payload (offset {offset}, size {size})")]
    PastPayload { label: String, offset: u8, size: u8 },
    #[error("register `{label}` uses unknown data type {code}")]
    UnknownDataType { label: String, code: u8 },
    #[error("register `{0}` is defined more than once")]
    DuplicateLabel(String),
    #[error("no register is labelled `{0}`")]
    NotFound(String),
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("could not open the register table at {1:?}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("could not parse the register table at {1:?}")]
    Parse(#[source] serde_json::Error, PathBuf),
    #[error("register table at {1:?} contains an invalid register")]
    Register(#[source] RegisterError, PathBuf),
}

/// A single entry of the declarative register list.
///
/// Both the snake_case keys and the spellings used by older ESPHome configurations are accepted.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct RegisterEntry {
    pub mode: u8,
    #[serde(alias = "convid", alias = "convId")]
    pub conv_id: u16,
    pub offset: u8,
    #[serde(alias = "registryID", alias = "registryId")]
    pub registry_id: u8,
    #[serde(alias = "dataSize")]
    pub data_size: u8,
    #[serde(alias = "dataType")]
    pub data_type: u8,
    pub label: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(default)]
    pub accuracy_decimals: Option<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegisterDescriptor {
    pub mode: Mode,
    pub conv_id: u16,
    pub offset: u8,
    pub registry_id: u8,
    pub data_size: u8,
    pub data_type: DataType,
    pub label: String,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    pub accuracy_decimals: Option<u8>,
    kind: ValueKind,
}

impl RegisterDescriptor {
    /// Whether decoded values of this register are numbers or text. Fixed when the table is built.
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Location of this register's bytes within the response payload.
    pub fn field(&self) -> Range<usize> {
        let start = usize::from(self.offset);
        start..start + usize::from(self.data_size)
    }

    pub fn decimals(&self) -> u8 {
        self.accuracy_decimals
            .unwrap_or_else(|| self.data_type.default_decimals())
    }
}

#[derive(Clone, Debug, Default)]
pub struct RegisterTable {
    registers: Vec<RegisterDescriptor>,
    by_label: HashMap<String, usize>,
}

impl RegisterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_register(
        &mut self,
        mode: u8,
        conv_id: u16,
        offset: u8,
        registry_id: u8,
        data_size: u8,
        data_type: DataType,
        label: &str,
    ) -> Result<usize, RegisterError> {
        self.push(RegisterDescriptor {
            mode: Mode::new(mode),
            conv_id,
            offset,
            registry_id,
            data_size,
            data_type,
            label: label.to_string(),
            unit: None,
            device_class: None,
            accuracy_decimals: None,
            kind: ValueKind::for_conv_id(conv_id),
        })
    }

    pub fn add_entry(&mut self, entry: RegisterEntry) -> Result<usize, RegisterError> {
        let Some(data_type) = DataType::from_code(entry.data_type) else {
            return Err(RegisterError::UnknownDataType {
                label: entry.label,
                code: entry.data_type,
            });
        };
        self.push(RegisterDescriptor {
            mode: Mode::new(entry.mode),
            conv_id: entry.conv_id,
            offset: entry.offset,
            registry_id: entry.registry_id,
            data_size: entry.data_size,
            data_type,
            kind: ValueKind::for_conv_id(entry.conv_id),
            label: entry.label,
            unit: entry.unit,
            device_class: entry.device_class,
            accuracy_decimals: entry.accuracy_decimals,
        })
    }

    fn push(&mut self, register: RegisterDescriptor) -> Result<usize, RegisterError> {
        if register.label.is_empty() {
            return Err(RegisterError::EmptyLabel);
        }
        if register.data_size == 0 || register.data_size > MAX_FIELD_BYTES {
            return Err(RegisterError::DataSize {
                label: register.label,
                size: register.data_size,
            });
        }
        if register.field().end > MAX_FRAME_PAYLOAD {
            return Err(RegisterError::PastPayload {
                label: register.label,
                offset: register.offset,
                size: register.data_size,
            });
        }
        if self.by_label.contains_key(&register.label) {
            return Err(RegisterError::DuplicateLabel(register.label));
        }
        let index = self.registers.len();
        self.by_label.insert(register.label.clone(), index);
        self.registers.push(register);
        Ok(index)
    }

    pub fn lookup(&self, label: &str) -> Result<&RegisterDescriptor, RegisterError> {
        self.index_of(label)
            .map(|idx| &self.registers[idx])
            .ok_or_else(|| RegisterError::NotFound(label.to_string()))
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.by_label.get(label).copied()
    }

    pub fn get(&self, index: usize) -> Option<&RegisterDescriptor> {
        self.registers.get(index)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RegisterDescriptor> {
        self.registers.iter()
    }

    pub fn from_entries(
        entries: impl IntoIterator<Item = RegisterEntry>,
    ) -> Result<Self, RegisterError> {
        let mut table = Self::new();
        for entry in entries {
            table.add_entry(entry)?;
        }
        Ok(table)
    }

    /// A new table with just the registers labelled `labels`, in that order.
    pub fn subset<'a>(
        &self,
        labels: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, RegisterError> {
        let mut table = Self::new();
        for label in labels {
            table.push(self.lookup(label)?.clone())?;
        }
        Ok(table)
    }

    /// Read a JSON array of [`RegisterEntry`] from `path`.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let file = std::fs::File::open(path).map_err(|e| LoadError::Open(e, path.into()))?;
        let entries: Vec<RegisterEntry> = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| LoadError::Parse(e, path.into()))?;
        Self::from_entries(entries).map_err(|e| LoadError::Register(e, path.into()))
    }

    /// The register set of a typical Altherma LT unit.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        macro_rules! add {
            ($($mode:literal, $conv:literal, $offset:literal, $registry:literal, $size:literal, $ty:ident,
               $label:literal $(, unit = $unit:literal)?;)*) => {
                $(
                    // Covered by `builtin_table_is_well_formed`.
                    let _idx = table
                        .add_register($mode, $conv, $offset, $registry, $size, DataType::$ty, $label)
                        .expect("built-in register table is well formed");
                    $(table.registers[_idx].unit = Some($unit.to_string());)?
                )*
            }
        }
        add! {
            1, 201, 0, 0x10, 1, U, "Operation Mode";
            1, 200, 1, 0x10, 1, U, "Thermostat ON/OFF";
            0, 200, 2, 0x10, 1, U, "Restart flag";
            1, 210, 3, 0x10, 1, U, "Defrost Operation";
            1, 204, 4, 0x10, 1, U, "Thermostat request";
            1, 211, 5, 0x10, 1, U, "Compressor state";
            1, 0x01, 0, 0x20, 2, CEL, "Outdoor air temp.(R1T)", unit = "°C";
            1, 0x01, 2, 0x20, 2, CEL, "Heat exchanger mid-temp.(R2T)", unit = "°C";
            1, 0x01, 4, 0x20, 2, CEL, "Discharge pipe temp.(R3T)", unit = "°C";
            0, 0x01, 6, 0x20, 2, CEL, "Suction pipe temp.(R4T)", unit = "°C";
            1, 0x01, 0, 0x21, 2, U10, "INV primary current (A)", unit = "A";
            1, 0x01, 2, 0x21, 2, U10, "INV secondary current (A)", unit = "A";
            1, 0x01, 0, 0x30, 1, U, "Fan 1 step";
            1, 0x01, 1, 0x30, 2, U, "Fan 1 speed", unit = "rpm";
            1, 0x01, 3, 0x30, 2, U, "INV frequency", unit = "rps";
            1, 213, 0, 0x60, 1, U, "Flow switch";
            1, 212, 1, 0x60, 1, U, "Backup heater relay";
            1, 202, 2, 0x60, 1, U, "3-way valve";
            1, 207, 3, 0x60, 1, U, "Quiet mode";
            1, 0x01, 2, 0x61, 2, CEL, "Leaving water temp. before BUH (R1T)", unit = "°C";
            1, 0x01, 4, 0x61, 2, CEL, "Leaving water temp. after BUH (R2T)", unit = "°C";
            1, 0x01, 6, 0x61, 2, CEL, "Refrigerant temp. liquid side (R3T)", unit = "°C";
            1, 0x01, 8, 0x61, 2, CEL, "Inlet water temp.(R4T)", unit = "°C";
            1, 0x01, 10, 0x61, 2, CEL, "DHW tank temp. (R5T)", unit = "°C";
            1, 0x01, 0, 0x62, 2, U10, "Flow sensor", unit = "l/min";
            0, 0x01, 2, 0x62, 2, S, "Water pressure raw";
            1, 203, 4, 0x62, 1, U, "Error severity";
        }
        table
    }
}

impl<'a> IntoIterator for &'a RegisterTable {
    type Item = &'a RegisterDescriptor;
    type IntoIter = std::slice::Iter<'a, RegisterDescriptor>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Command line selection of the register table.
#[derive(clap::Parser, Clone)]
#[group(id = "registers::Args")]
pub struct Args {
    /// JSON file with the register table to use instead of the built-in one.
    #[arg(long)]
    registers: Option<PathBuf>,
}

impl Args {
    pub fn load(&self) -> Result<RegisterTable, LoadError> {
        match &self.registers {
            None => Ok(RegisterTable::builtin()),
            Some(path) => RegisterTable::load(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_registers() {
        let mut table = RegisterTable::new();
        assert!(matches!(
            table.add_register(1, 1, 0, 5, 0, DataType::U, "zero"),
            Err(RegisterError::DataSize { size: 0, .. })
        ));
        assert!(matches!(
            table.add_register(1, 1, 0, 5, 5, DataType::U, "wide"),
            Err(RegisterError::DataSize { size: 5, .. })
        ));
        assert!(matches!(
            table.add_register(1, 1, 252, 5, 2, DataType::U, "far"),
            Err(RegisterError::PastPayload { .. })
        ));
        assert!(matches!(
            table.add_register(1, 1, 0, 5, 2, DataType::U, ""),
            Err(RegisterError::EmptyLabel)
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let mut table = RegisterTable::new();
        table.add_register(1, 1, 0, 5, 2, DataType::CEL, "temp").unwrap();
        let err = table.add_register(0, 1, 2, 6, 2, DataType::CEL, "temp");
        assert!(matches!(err, Err(RegisterError::DuplicateLabel(l)) if l == "temp"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("temp").unwrap().registry_id, 5);
    }

    #[test]
    fn lookup_unknown_label() {
        let table = RegisterTable::builtin();
        assert!(matches!(table.lookup("nope"), Err(RegisterError::NotFound(_))));
        let register = table.lookup("Leaving water temp. before BUH (R1T)").unwrap();
        assert_eq!(register.registry_id, 0x61);
        assert_eq!(register.field(), 2..4);
        assert_eq!(register.decimals(), 1);
    }

    #[test]
    fn builtin_table_is_well_formed() {
        let table = RegisterTable::builtin();
        assert!(!table.is_empty());
        for (idx, register) in table.iter().enumerate() {
            assert_eq!(table.index_of(&register.label), Some(idx));
            assert_eq!(register.field().len(), usize::from(register.data_size));
        }
    }

    #[test]
    fn subset_keeps_requested_order() {
        let table = RegisterTable::builtin();
        let subset = table
            .subset(["Error severity", "Flow sensor"])
            .unwrap();
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.get(0).unwrap().label, "Error severity");
        assert_eq!(subset.lookup("Flow sensor").unwrap().unit.as_deref(), Some("l/min"));
        assert!(matches!(table.subset(["nope"]), Err(RegisterError::NotFound(_))));
        assert!(matches!(
            table.subset(["Flow sensor", "Flow sensor"]),
            Err(RegisterError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn entries_accept_legacy_key_spellings() {
        let json = r#"[
            { "mode": 1, "convid": 201, "offset": 0, "registryID": 16, "dataSize": 1,
              "dataType": 0, "label": "Operation Mode" },
            { "mode": 1, "conv_id": 1, "offset": 2, "registry_id": 97, "data_size": 2,
              "data_type": 2, "label": "LWT", "unit": "°C", "accuracy_decimals": 2 }
        ]"#;
        let entries: Vec<RegisterEntry> = serde_json::from_str(json).unwrap();
        let table = RegisterTable::from_entries(entries).unwrap();
        let mode = table.lookup("Operation Mode").unwrap();
        assert_eq!(mode.kind(), ValueKind::Text);
        assert_eq!(mode.registry_id, 16);
        let lwt = table.lookup("LWT").unwrap();
        assert_eq!(lwt.kind(), ValueKind::Numeric);
        assert_eq!(lwt.data_type, DataType::CEL);
        assert_eq!(lwt.decimals(), 2);
        assert_eq!(lwt.unit.as_deref(), Some("°C"));
    }

    #[test]
    fn unknown_data_type_code() {
        let entry = RegisterEntry {
            mode: 1,
            conv_id: 1,
            offset: 0,
            registry_id: 1,
            data_size: 2,
            data_type: 42,
            label: "x".into(),
            unit: None,
            device_class: None,
            accuracy_decimals: None,
        };
        assert!(matches!(
            RegisterTable::new().add_entry(entry),
            Err(RegisterError::UnknownDataType { code: 42, .. })
        ));
    }

    #[test]
    fn integers_are_little_endian_and_sign_extended() {
        assert_eq!(DataType::S.integer_from_bytes(&[0xD7, 0x00]), 215);
        assert_eq!(DataType::S.integer_from_bytes(&[0xFE, 0xFF]), -2);
        assert_eq!(DataType::U.integer_from_bytes(&[0xFE, 0xFF]), 0xFFFE);
        assert_eq!(DataType::S.integer_from_bytes(&[0x80]), -128);
        assert_eq!(DataType::S.integer_from_bytes(&[0x00, 0x00, 0x80]), -0x80_0000);
        assert_eq!(DataType::U.integer_from_bytes(&[]), 0);
    }

    #[test]
    fn data_type_codes() {
        for code in 0..6 {
            assert_eq!(DataType::from_code(code).unwrap().code(), code);
        }
        assert_eq!(DataType::from_code(6), None);
        assert_eq!(DataType::CEL.to_string(), "S/10");
    }
}
