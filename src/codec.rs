//! Scalar codecs shared by the tool schemas.
//!
//! Fooocus-family tools embed Python-flavoured values inside JSON strings:
//! tuples such as `"(1024, 1024)"`, single-quoted style lists, and LoRA
//! references that are either positional arrays or `"name : weight"`
//! strings. Each codec here has a plain `decode`/`encode` pair plus serde
//! impls so the schema structs can use them as field types directly.

use crate::error::CodecError;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Element types allowed inside a [`Tuple`].
pub trait TupleElement: Copy + FromStr {
    fn format_element(&self) -> String;
}

impl TupleElement for u16 {
    fn format_element(&self) -> String {
        self.to_string()
    }
}

impl TupleElement for f32 {
    fn format_element(&self) -> String {
        format!("{:.1}", self)
    }
}

/// Variable-length numeric tuple stored as a parenthesised string.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tuple<T>(Vec<T>);

/// `(width, height)` as written by Fooocus.
pub type Resolution = Tuple<u16>;
/// `(b1, b2, s1, s2)`.
pub type FreeU = Tuple<f32>;
/// `(positive, negative, end)`.
pub type AdmGuidance = Tuple<f32>;

impl<T: TupleElement> Tuple<T> {
    pub fn new(values: Vec<T>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[T] {
        &self.0
    }

    /// Parses `"(a, b, c)"`. Fails when the parentheses are missing or any
    /// element does not parse as `T`.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let inner = raw
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| CodecError::MissingParentheses(raw.to_string()))?;

        if inner.trim().is_empty() {
            return Ok(Self(Vec::new()));
        }

        inner
            .split(',')
            .map(|element| {
                let element = element.trim();
                element.parse::<T>().map_err(|_| CodecError::InvalidNumber {
                    value: element.to_string(),
                    context: "tuple",
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Floats are always written with one decimal digit, integers plainly.
    pub fn encode(&self) -> String {
        let elements = self
            .0
            .iter()
            .map(TupleElement::format_element)
            .collect::<Vec<_>>();
        format!("({})", elements.join(", "))
    }
}

impl<T: TupleElement> Serialize for Tuple<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de, T: TupleElement> Deserialize<'de> for Tuple<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::decode(&raw).map_err(de::Error::custom)
    }
}

/// Style names encoded as a Python list literal, e.g.
/// `"['Fooocus V2', 'Fooocus Enhance']"`.
///
/// Decoding swaps every `'` for `"` and reads the result as JSON, so a style
/// name containing an apostrophe does not survive. Encoding does no escaping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Styles(pub Vec<String>);

impl Styles {
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let quoted = raw.replace('\'', "\"");
        serde_json::from_str::<Vec<String>>(&quoted)
            .map(Self)
            .map_err(CodecError::Styles)
    }

    pub fn encode(&self) -> String {
        let quoted = self
            .0
            .iter()
            .map(|style| format!("'{}'", style))
            .collect::<Vec<_>>();
        format!("[{}]", quoted.join(", "))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for Styles {
    fn from(styles: Vec<String>) -> Self {
        Self(styles)
    }
}

impl Serialize for Styles {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Styles {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::decode(&raw).map_err(de::Error::custom)
    }
}

/// LoRA stored as a positional `[name, weight, hash]` array.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Lora {
    pub name: String,
    pub weight: f32,
    pub hash: String,
}

impl Lora {
    pub fn new(name: impl Into<String>, weight: f32, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight,
            hash: hash.into(),
        }
    }

    pub fn decode(values: &[Value]) -> Result<Self, CodecError> {
        if values.len() < 3 {
            return Err(CodecError::LoraArity {
                expected: 3,
                found: values.len(),
            });
        }

        Ok(Self {
            name: string_element(values, 0)?,
            weight: float_element(values, 1)?,
            hash: string_element(values, 2)?,
        })
    }

    pub fn encode(&self) -> Value {
        Value::Array(vec![
            Value::from(self.name.clone()),
            Value::from(self.weight),
            Value::from(self.hash.clone()),
        ])
    }
}

impl From<LoraCombined> for Lora {
    fn from(combined: LoraCombined) -> Self {
        Self {
            name: combined.name,
            weight: combined.weight,
            hash: String::new(),
        }
    }
}

impl Serialize for Lora {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.name, self.weight, &self.hash).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Lora {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<Value>::deserialize(deserializer)?;
        Self::decode(&values).map_err(de::Error::custom)
    }
}

/// LoRA stored as a single `"name : weight"` string.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoraCombined {
    pub name: String,
    pub weight: f32,
}

impl LoraCombined {
    pub fn new(name: impl Into<String>, weight: f32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }

    /// Splits on the first `" : "`. A missing weight decodes as zero.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let mut parts = raw.splitn(2, " : ");
        let name = parts.next().unwrap_or_default().to_string();
        let weight = match parts.next() {
            Some(weight) => parse_weight(weight, "combined LoRA")?,
            None => 0.0,
        };
        Ok(Self { name, weight })
    }

    pub fn encode(&self) -> String {
        format!("{} : {}", self.name, self.weight)
    }
}

impl Serialize for LoraCombined {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for LoraCombined {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::decode(&raw).map_err(de::Error::custom)
    }
}

/// RuinedFooocus LoRA: `[hash, "weight - name"]`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuinedLora {
    pub name: String,
    pub weight: f32,
    pub hash: String,
}

impl RuinedLora {
    pub fn decode(values: &[Value]) -> Result<Self, CodecError> {
        if values.len() < 2 {
            return Err(CodecError::LoraArity {
                expected: 2,
                found: values.len(),
            });
        }

        let hash = string_element(values, 0)?;
        let details = string_element(values, 1)?;
        let (weight, name) = details
            .split_once(" - ")
            .ok_or_else(|| CodecError::LoraSeparator(details.clone()))?;

        Ok(Self {
            name: name.to_string(),
            weight: parse_weight(weight, "RuinedFooocus LoRA")?,
            hash,
        })
    }

    pub fn encode(&self) -> Value {
        Value::Array(vec![
            Value::from(self.hash.clone()),
            Value::from(format!("{} - {}", self.weight, self.name)),
        ])
    }
}

impl Serialize for RuinedLora {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let details = format!("{} - {}", self.weight, self.name);
        (&self.hash, details).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RuinedLora {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<Value>::deserialize(deserializer)?;
        Self::decode(&values).map_err(de::Error::custom)
    }
}

/// A seed as it appears on the wire: quoted, or a bare integer.
///
/// Seeds routinely exceed 2^53, so they are kept as integers or text and
/// never pass through a float.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SeedValue {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

impl fmt::Display for SeedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedValue::Text(text) => f.write_str(text),
            SeedValue::Unsigned(value) => write!(f, "{}", value),
            SeedValue::Signed(value) => write!(f, "{}", value),
        }
    }
}

/// Reads either seed encoding into its canonical string form.
pub fn deserialize_seed<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    SeedValue::deserialize(deserializer).map(|seed| seed.to_string())
}

/// Writes a canonical seed back as a bare integer when it is one.
pub fn serialize_seed_as_number<S: Serializer>(
    seed: &str,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    if let Ok(value) = seed.parse::<u64>() {
        serializer.serialize_u64(value)
    } else if let Ok(value) = seed.parse::<i64>() {
        serializer.serialize_i64(value)
    } else {
        serializer.serialize_str(seed)
    }
}

/// A metadata scheme field: the scheme name, or a bare "was embedded" flag
/// written by older releases.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SchemeValue {
    Name(String),
    Flag(bool),
}

impl SchemeValue {
    pub fn name_or(self, default: &str) -> String {
        match self {
            SchemeValue::Name(name) => name,
            SchemeValue::Flag(_) => default.to_string(),
        }
    }
}

/// A number quoted the way parsed captions carry it, or written bare the
/// way serialized records do.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(serde_json::Number),
    Text(String),
}

/// Reads a `"Steps: 20"`-style string-encoded number. A bare JSON number is
/// accepted too, so records survive a serialize/deserialize round trip.
pub fn deserialize_string_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(number) => number.to_string(),
        NumberOrText::Text(text) => text,
    };
    raw.trim().parse::<T>().map_err(de::Error::custom)
}

/// Optional variant of [`deserialize_string_number`] for `#[serde(default)]`
/// fields.
pub fn deserialize_optional_string_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    deserialize_string_number(deserializer).map(Some)
}

fn string_element(values: &[Value], index: usize) -> Result<String, CodecError> {
    values
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(CodecError::LoraElement { index })
}

fn float_element(values: &[Value], index: usize) -> Result<f32, CodecError> {
    values
        .get(index)
        .and_then(Value::as_f64)
        .map(|weight| weight as f32)
        .ok_or(CodecError::LoraElement { index })
}

fn parse_weight(raw: &str, context: &'static str) -> Result<f32, CodecError> {
    raw.trim()
        .parse::<f32>()
        .map_err(|_| CodecError::InvalidNumber {
            value: raw.to_string(),
            context,
        })
}
