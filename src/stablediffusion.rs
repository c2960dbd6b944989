//! AUTOMATIC1111-style plaintext parameters, as written by the SD web UI,
//! stable-diffusion.cpp and Fooocus in its `a1111` scheme.
//!
//! The caption is first flattened into a key/value map by
//! [`crate::parser::parse_a1111_fields`]; this module types that map.

use crate::codec;
use crate::error::DecodeError;
use crate::parser::parse_a1111_fields;
use crate::types::{
    FileMetadataExtractor, GenerationParameters, ImageMetadataContext, LoraEntry, MetadataReader,
    Parameters, Source, StructuredMetadata,
};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const SOFTWARE: &str = "StableDiffusion";

/// `Size: 512x512`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn decode(raw: &str) -> Option<Self> {
        let (width, height) = raw.trim().split_once('x')?;
        Some(Self {
            width: width.trim().parse().ok()?,
            height: height.trim().parse().ok()?,
        })
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl Serialize for Size {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::decode(&raw).ok_or_else(|| de::Error::custom(format!("invalid size {:?}", raw)))
    }
}

/// An inline `<lora:name:weight>` prompt tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lora {
    pub name: String,
    pub weight: f32,
}

impl Lora {
    /// The weight defaults to 1.0 when the tag has none.
    pub fn decode(tag: &str) -> Result<Self, String> {
        let inner = tag.trim();
        let inner = inner.strip_prefix("<lora:").unwrap_or(inner);
        let inner = inner.strip_suffix('>').unwrap_or(inner);

        match inner.split_once(':') {
            Some((name, weight)) => Ok(Self {
                name: name.to_string(),
                weight: weight
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid LoRA weight {:?}", weight))?,
            }),
            None => Ok(Self {
                name: inner.to_string(),
                weight: 1.0,
            }),
        }
    }
}

fn deserialize_loras<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Lora>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.split(", ")
        .map(|tag| Lora::decode(tag).map_err(de::Error::custom))
        .collect()
}

/// Writes LoRAs back in the comma-joined tag form [`deserialize_loras`] reads.
fn serialize_loras<S: Serializer>(loras: &[Lora], serializer: S) -> Result<S::Ok, S::Error> {
    let tags = loras
        .iter()
        .map(|lora| format!("<lora:{}:{}>", lora.name, lora.weight))
        .collect::<Vec<_>>();
    serializer.serialize_str(&tags.join(", "))
}

/// One typed A1111 caption. Keys the schema does not know end up in
/// `extra`, already normalised (`"Lora hashes"` -> `lora_hashes`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(
        default,
        deserialize_with = "codec::deserialize_optional_string_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub batch_size: Option<u32>,
    #[serde(
        default,
        deserialize_with = "codec::deserialize_optional_string_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub batch_pos: Option<u32>,
    #[serde(default, deserialize_with = "codec::deserialize_string_number")]
    pub cfg_scale: f32,
    #[serde(
        default,
        deserialize_with = "codec::deserialize_optional_string_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub clip_skip: Option<u8>,
    #[serde(
        default,
        deserialize_with = "codec::deserialize_optional_string_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub denoising_strength: Option<f32>,
    #[serde(
        default,
        deserialize_with = "codec::deserialize_optional_string_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub eta: Option<f32>,
    #[serde(
        default,
        deserialize_with = "codec::deserialize_optional_string_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub hires_steps: Option<u32>,
    #[serde(
        default,
        deserialize_with = "codec::deserialize_optional_string_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub hires_upscale: Option<f32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hires_upscaler: String,
    #[serde(
        default,
        deserialize_with = "codec::deserialize_optional_string_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub guidance: Option<f32>,
    #[serde(
        default,
        deserialize_with = "codec::deserialize_optional_string_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub image_noise_multiplier: Option<f32>,
    #[serde(
        default,
        deserialize_with = "deserialize_loras",
        serialize_with = "serialize_loras",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub loras: Vec<Lora>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub negative_prompt: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rng: String,
    /// Sampler and scheduler in one, e.g. `DPM++ 2M Karras`.
    #[serde(default)]
    pub sampler: String,
    #[serde(default, deserialize_with = "codec::deserialize_string_number")]
    pub seed: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, deserialize_with = "codec::deserialize_string_number")]
    pub steps: u32,
    #[serde(rename = "te", default, skip_serializing_if = "String::is_empty")]
    pub text_encoder: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unet: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vae: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vae_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

/// Parses a plaintext caption into a typed record.
pub fn parse_parameters(raw: &str) -> Result<Metadata, DecodeError> {
    let fields = parse_a1111_fields(raw)?;
    let object = fields
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    Ok(serde_json::from_value(Value::Object(object))?)
}

impl Parameters for Metadata {
    fn version(&self) -> &str {
        &self.version
    }

    fn positive_prompt(&self) -> &str {
        &self.prompt
    }

    fn negative_prompt(&self) -> &str {
        &self.negative_prompt
    }

    fn model(&self) -> String {
        let model = if self.model.is_empty() {
            &self.unet
        } else {
            &self.model
        };
        crate::types::normalise_model_name(model)
    }

    fn seed(&self) -> String {
        self.seed.to_string()
    }

    fn loras(&self) -> Vec<LoraEntry> {
        self.loras
            .iter()
            .map(|lora| LoraEntry::new(&lora.name, lora.weight))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StableDiffusionExtractor {
    pub files: FileMetadataExtractor,
}

impl StableDiffusionExtractor {
    pub fn new(files: FileMetadataExtractor) -> Self {
        Self { files }
    }
}

impl MetadataReader for StableDiffusionExtractor {
    type Metadata = Metadata;

    fn decode(&self, ctx: &ImageMetadataContext) -> Result<Metadata, DecodeError> {
        let payload = ctx
            .first_tag(&["parameters", "UserComment"])
            .ok_or(DecodeError::MissingTag {
                software: SOFTWARE,
                tag: "parameters",
            })?;
        parse_parameters(payload)
    }

    fn extract(&self, ctx: &ImageMetadataContext) -> Result<StructuredMetadata, DecodeError> {
        let meta = self.decode(ctx).map_err(|err| {
            log::debug!("StableDiffusion: embedded metadata not usable: {}", err);
            DecodeError::NoMetadata
        })?;

        Ok(StructuredMetadata {
            source: Source::StableDiffusion,
            created: self.files.created(ctx),
            params: GenerationParameters::StableDiffusion(meta),
        })
    }
}
