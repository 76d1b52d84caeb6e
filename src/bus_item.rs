use std::fmt;
use zbus::zvariant::Value;

/// A single value published on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum BusValue {
    /// No value available, sent as an empty int array
    Invalid,
    Int(i32),
    Double(f64),
    Text(String),
}

impl BusValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BusValue::Int(v) => Some(f64::from(*v)),
            BusValue::Double(v) => Some(*v),
            BusValue::Invalid | BusValue::Text(_) => None,
        }
    }

    pub fn to_variant(&self) -> Value<'static> {
        match self {
            BusValue::Invalid => Value::from(Vec::<i32>::new()),
            BusValue::Int(v) => Value::from(*v),
            BusValue::Double(v) => Value::from(*v),
            BusValue::Text(v) => Value::from(v.clone()),
        }
    }

    /// Decodes a value written by another bus client
    pub fn from_variant(value: &Value<'_>) -> Option<Self> {
        let decoded = match value {
            Value::Value(inner) => return Self::from_variant(inner),
            Value::Bool(v) => BusValue::Int(i32::from(*v)),
            Value::U8(v) => BusValue::Int(i32::from(*v)),
            Value::I16(v) => BusValue::Int(i32::from(*v)),
            Value::U16(v) => BusValue::Int(i32::from(*v)),
            Value::I32(v) => BusValue::Int(*v),
            Value::U32(v) => int_or_double(i64::from(*v)),
            Value::I64(v) => int_or_double(*v),
            Value::U64(v) => match i64::try_from(*v) {
                Ok(v) => int_or_double(v),
                Err(_) => BusValue::Double(*v as f64),
            },
            Value::F64(v) => BusValue::Double(*v),
            Value::Str(v) => BusValue::Text(v.as_str().to_string()),
            Value::Array(array) if array.is_empty() => BusValue::Invalid,
            _ => return None,
        };
        Some(decoded)
    }
}

fn int_or_double(v: i64) -> BusValue {
    match i32::try_from(v) {
        Ok(v) => BusValue::Int(v),
        Err(_) => BusValue::Double(v as f64),
    }
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Invalid => f.write_str("---"),
            BusValue::Int(v) => write!(f, "{v}"),
            BusValue::Double(v) => write!(f, "{v}"),
            BusValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i32> for BusValue {
    fn from(v: i32) -> Self {
        BusValue::Int(v)
    }
}

impl From<f64> for BusValue {
    fn from(v: f64) -> Self {
        BusValue::Double(v)
    }
}

impl From<&str> for BusValue {
    fn from(v: &str) -> Self {
        BusValue::Text(v.to_string())
    }
}

impl From<String> for BusValue {
    fn from(v: String) -> Self {
        BusValue::Text(v)
    }
}

/// How a value is rendered for `GetText`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    KiloWattHours,
    Amps,
    Watts,
    Volts,
}

impl TextFormat {
    pub fn render(self, value: &BusValue) -> String {
        let (suffix, precision): (&str, usize) = match self {
            TextFormat::Plain => return value.to_string(),
            TextFormat::KiloWattHours => ("KWh", 2),
            TextFormat::Amps => ("A", 1),
            TextFormat::Watts => ("W", 1),
            TextFormat::Volts => ("V", 1),
        };
        match value.as_f64() {
            Some(number) => format!("{number:.precision$}{suffix}"),
            None => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusItem {
    pub value: BusValue,
    pub format: TextFormat,
    /// Whether other bus clients may change the value
    pub writeable: bool,
}

impl BusItem {
    pub fn constant(value: impl Into<BusValue>) -> Self {
        Self {
            value: value.into(),
            format: TextFormat::Plain,
            writeable: false,
        }
    }

    pub fn measurement(format: TextFormat) -> Self {
        Self {
            value: BusValue::Double(0.0),
            format,
            writeable: true,
        }
    }

    pub fn text(&self) -> String {
        self.format.render(&self.value)
    }
}
