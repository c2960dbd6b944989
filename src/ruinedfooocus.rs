//! RuinedFooocus metadata: a single JSON object in the PNG `parameters`
//! text chunk. There is no private log.

use crate::codec::{self, RuinedLora};
use crate::error::{DecodeError, WriteError};
use crate::types::{
    FileMetadataExtractor, GenerationParameters, ImageMetadataContext, LoraEntry, MetadataReader,
    Parameters, Source, StructuredMetadata,
};
use crate::writer::MetadataWriter;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SOFTWARE: &str = "RuinedFooocus";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "Prompt")]
    pub prompt: String,
    #[serde(rename = "Negative", default)]
    pub negative_prompt: String,
    #[serde(default)]
    pub steps: u8,
    #[serde(rename = "cfg", default)]
    pub cfg_scale: f32,
    #[serde(default)]
    pub width: u16,
    #[serde(default)]
    pub height: u16,
    #[serde(
        default,
        deserialize_with = "codec::deserialize_seed",
        serialize_with = "codec::serialize_seed_as_number"
    )]
    pub seed: String,
    #[serde(rename = "sampler_name", default)]
    pub sampler: String,
    #[serde(default)]
    pub scheduler: String,
    #[serde(rename = "base_model_name", default)]
    pub base_model: String,
    #[serde(default)]
    pub base_model_hash: String,
    #[serde(default)]
    pub loras: Vec<RuinedLora>,
    #[serde(default)]
    pub start_step: u8,
    /// Kept verbatim; usually `null`.
    #[serde(default)]
    pub denoise: Option<Value>,
    #[serde(default)]
    pub clip_skip: u8,
    /// Also the version string: RuinedFooocus writes only its name.
    #[serde(rename = "software")]
    pub version: String,
}

pub fn parse_metadata(payload: &str) -> Result<Metadata, DecodeError> {
    let meta: Metadata = serde_json::from_str(payload)?;
    if !meta.version.starts_with(SOFTWARE) {
        return Err(DecodeError::UnsupportedSoftware {
            software: SOFTWARE,
            found: meta.version,
        });
    }
    Ok(meta)
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
        crate::types::normalise_model_name(&self.base_model)
    }

    fn seed(&self) -> String {
        self.seed.clone()
    }

    fn loras(&self) -> Vec<LoraEntry> {
        self.loras
            .iter()
            .map(|lora| LoraEntry::new(&lora.name, lora.weight))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuinedFooocusExtractor {
    pub files: FileMetadataExtractor,
}

impl RuinedFooocusExtractor {
    pub fn new(files: FileMetadataExtractor) -> Self {
        Self { files }
    }
}

impl MetadataReader for RuinedFooocusExtractor {
    type Metadata = Metadata;

    fn decode(&self, ctx: &ImageMetadataContext) -> Result<Metadata, DecodeError> {
        let payload = ctx.tag("parameters").ok_or(DecodeError::MissingTag {
            software: SOFTWARE,
            tag: "parameters",
        })?;
        parse_metadata(payload)
    }

    fn extract(&self, ctx: &ImageMetadataContext) -> Result<StructuredMetadata, DecodeError> {
        let meta = self.decode(ctx).map_err(|err| {
            log::debug!("RuinedFooocus: embedded metadata not usable: {}", err);
            DecodeError::NoMetadata
        })?;

        Ok(StructuredMetadata {
            source: Source::RuinedFooocus,
            created: self.files.created(ctx),
            params: GenerationParameters::RuinedFooocus(meta),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuinedFooocusWriter;

impl MetadataWriter for RuinedFooocusWriter {
    type Metadata = Metadata;

    fn text_values(&self, metadata: &Metadata) -> Result<Vec<(&'static str, String)>, WriteError> {
        Ok(vec![("parameters", serde_json::to_string(metadata)?)])
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub(crate) const META_JSON: &str = r#"{
        "Prompt": "cinematic film still A sunflower field, shallow depth of field, vignette, highly detailed, ",
        "Negative": "anime, cartoon, graphic, text, painting, crayon, graphite, abstract, glitch, blur, bokeh , , ",
        "steps": 30,
        "cfg": 8.5,
        "width": 1152,
        "height": 896,
        "seed": 3864674281,
        "sampler_name": "dpmpp_2m_sde_gpu",
        "scheduler": "karras",
        "base_model_name": "sd_xl_base_1.0_0.9vae.safetensors",
        "base_model_hash": "be9edd61",
        "loras": [["4852686128", "0.1 - sd_xl_offset_example-lora_1.0.safetensors"]],
        "start_step": 0,
        "denoise": null,
        "clip_skip": 1,
        "software": "RuinedFooocus"
    }"#;
}
