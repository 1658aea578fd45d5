//! Decoding of raw register bytes into values.

use num_traits::ToPrimitive as _;

use crate::registers::DataType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Numeric,
    Text,
}

impl ValueKind {
    pub fn for_conv_id(conv_id: u16) -> Self {
        if TextConversion::from_conv_id(conv_id).is_some() {
            Self::Text
        } else {
            Self::Numeric
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ValueKind::Numeric => "numeric",
            ValueKind::Text => "text",
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Numeric(f64),
    Text(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Numeric(_) => ValueKind::Numeric,
            Value::Text(_) => ValueKind::Text,
        }
    }

    pub fn as_numeric(&self) -> Option<f64> {
        match *self {
            Value::Numeric(n) => Some(n),
            Value::Text(_) => None,
        }
    }

    /// Render the value, using `decimals` digits after the point for numbers.
    pub fn format(&self, decimals: u8) -> String {
        match self {
            Value::Numeric(n) => format!("{:.*}", usize::from(decimals), n),
            Value::Text(t) => t.clone(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Numeric(n) => f.write_fmt(format_args!("{}", n)),
            Value::Text(t) => f.write_str(t),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Numeric(n) => serializer.serialize_f64(*n),
            Value::Text(t) => serializer.serialize_str(t),
        }
    }
}

/// Decode the bytes of a single register field.
///
/// `raw` must already be exactly the register's field. This never fails: codes without a name in
/// a text conversion come out as `unknown(<code>)`.
pub fn decode(raw: &[u8], data_type: DataType, conv_id: u16) -> Value {
    let integer = data_type.integer_from_bytes(raw);
    match TextConversion::from_conv_id(conv_id) {
        Some(conversion) => Value::Text(conversion.describe(integer)),
        None => Value::Numeric(integer as f64 / f64::from(data_type.scale())),
    }
}

macro_rules! text_conversions {
    ($(
        $conv:literal => $(#[$meta:meta])* $name:ident {
            $($variant:ident = $value:literal),* $(,)?
        }
    )*) => {
        $(
            #[derive(
                Clone,
                Copy,
                Debug,
                PartialEq,
                Eq,
                strum::VariantNames,
                strum::VariantArray,
                strum::FromRepr,
                strum::IntoStaticStr,
                strum::EnumString,
                num_derive::ToPrimitive,
            )]
            #[strum(serialize_all = "kebab-case")]
            #[repr(u32)]
            $(#[$meta])*
            pub enum $name {
                $($variant = $value),*
            }
        )*

        /// Conversion ids whose registers hold an enumerated code rather than a quantity.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, strum::VariantArray, strum::IntoStaticStr)]
        #[strum(serialize_all = "kebab-case")]
        pub enum TextConversion {
            $($name),*
        }

        impl TextConversion {
            pub const fn from_conv_id(conv_id: u16) -> Option<Self> {
                match conv_id {
                    $($conv => Some(Self::$name),)*
                    _ => None,
                }
            }

            pub const fn conv_id(self) -> u16 {
                match self {
                    $(Self::$name => $conv,)*
                }
            }

            pub fn name_of(self, code: u32) -> Option<&'static str> {
                match self {
                    $(Self::$name => $name::from_repr(code).map(<&'static str>::from),)*
                }
            }

            /// Every known code of this conversion along with its name.
            pub fn codes(self) -> Vec<(u32, &'static str)> {
                match self {
                    $(Self::$name => <$name as strum::VariantArray>::VARIANTS
                        .iter()
                        .filter_map(|v| Some((v.to_u32()?, <&'static str>::from(v))))
                        .collect(),)*
                }
            }
        }
    };
}

text_conversions! {
    200 => OnOff { Off = 0, On = 1 }
    201 => OperatingMode { FanOnly = 0, Heating = 1, Cooling = 2, Defrost = 3, HotWater = 4, Auto = 5 }
    202 => ValveState { SpaceHeating = 0, HotWater = 1 }
    203 => ErrorSeverity { Clear = 0, Warning = 1, Error = 2 }
    204 => ThermostatRequest { Idle = 0, Heating = 1, Cooling = 2 }
    205 => PumpMode { Continuous = 0, Sample = 1, Request = 2 }
    206 => HotWaterMode { Reheat = 0, Scheduled = 1, ReheatAndScheduled = 2 }
    207 => QuietMode { Off = 0, Automatic = 1, On = 2 }
    208 => ScheduleType { Off = 0, Daily = 1, Weekly = 2, Holiday = 3 }
    209 => SetpointMode { Fixed = 0, WeatherDependent = 1, FixedScheduled = 2, WeatherDependentScheduled = 3 }
    210 => DefrostState { Idle = 0, Requested = 1, Active = 2, Finishing = 3 }
    211 => CompressorState { Stopped = 0, Starting = 1, Running = 2, Stopping = 3 }
    212 => BackupHeaterState { Off = 0, Step1 = 1, Step2 = 2 }
    213 => FlowSwitch { NoFlow = 0, Flow = 1 }
    214 => SmartGridState { Normal = 0, ForcedOff = 1, RecommendedOn = 2, ForcedOn = 3 }
    215 => DisinfectionState { Idle = 0, Heating = 1, Holding = 2, Done = 3 }
}

impl TextConversion {
    pub fn describe(self, code: i64) -> String {
        u32::try_from(code)
            .ok()
            .and_then(|code| self.name_of(code))
            .map(str::to_string)
            .unwrap_or_else(|| format!("unknown({code})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::VariantArray as _;

    #[test]
    fn scaled_temperature() {
        let value = decode(&215i16.to_le_bytes(), DataType::CEL, 0x01);
        assert_eq!(value, Value::Numeric(21.5));
        assert_eq!(value.format(1), "21.5");
        let value = decode(&(-75i16).to_le_bytes(), DataType::CEL, 0x01);
        assert_eq!(value.format(1), "-7.5");
    }

    #[test]
    fn text_codes() {
        assert_eq!(decode(&[3], DataType::U, 201), Value::Text("defrost".into()));
        assert_eq!(decode(&[4], DataType::U, 201), Value::Text("hot-water".into()));
        assert_eq!(decode(&[99], DataType::U, 201), Value::Text("unknown(99)".into()));
        assert_eq!(
            decode(&(-1i16).to_le_bytes(), DataType::S, 200),
            Value::Text("unknown(-1)".into())
        );
    }

    #[test]
    fn text_set_selects_kind() {
        assert_eq!(TextConversion::VARIANTS.len(), 16);
        for conv_id in 0..=u16::from(u8::MAX) * 2 {
            let value = decode(&[1, 0], DataType::U, conv_id);
            let expected = if (200..=215).contains(&conv_id) {
                ValueKind::Text
            } else {
                ValueKind::Numeric
            };
            assert_eq!(value.kind(), expected, "conv id {conv_id}");
            assert_eq!(ValueKind::for_conv_id(conv_id), expected);
        }
    }

    #[test]
    fn conversion_listing() {
        for conversion in TextConversion::VARIANTS {
            assert_eq!(TextConversion::from_conv_id(conversion.conv_id()), Some(*conversion));
            assert!(!conversion.codes().is_empty());
        }
        assert_eq!(
            TextConversion::OperatingMode.codes()[3],
            (3, "defrost")
        );
    }
}
