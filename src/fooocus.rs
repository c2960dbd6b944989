//! Fooocus metadata: three schema generations, their migration into the
//! current shape, the embedded-tag decoder and the private log.
//!
//! | Version prefix | Generation | Found in |
//! |---|---|---|
//! | `v2.1` | [`MetadataV21`] (human-readable keys) | private log only |
//! | `Fooocus v2.2` | [`MetadataV22`] (numeric seed, boolean scheme) | private log |
//! | `Fooocus v2.3` .. `v2.5` | [`Metadata`] | embedded and private log |
//!
//! Embedded payloads from releases newer than v2.5 are read as [`Metadata`].

use crate::codec::{
    self, AdmGuidance, FreeU, Lora, LoraCombined, Resolution, SchemeValue, SeedValue, Styles,
};
use crate::error::{DecodeError, WriteError};
use crate::private_log::{self, LogDocument};
use crate::types::{
    FileMetadataExtractor, GenerationParameters, ImageMetadataContext, LoraEntry, MetadataReader,
    Parameters, Source, StructuredMetadata,
};
use crate::writer::MetadataWriter;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

pub const SOFTWARE: &str = "Fooocus";
pub const SOFTWARE_PREFIX: &str = "Fooocus ";
/// Native JSON scheme. The other scheme Fooocus can write, `a1111`, is the
/// plaintext caption handled by the StableDiffusion decoder.
pub const SCHEME: &str = "fooocus";
pub const LOG_BANNER: &str = "Fooocus Log";

/// Default step counts per performance preset.
const PERFORMANCE_STEPS: &[(&str, u8)] = &[
    ("Quality", 60),
    ("Speed", 30),
    ("Extreme Speed", 8),
    ("Lightning", 4),
    ("Hyper-SD", 4),
];

fn steps_for_performance(performance: &str) -> Option<u8> {
    PERFORMANCE_STEPS
        .iter()
        .find(|(name, _)| *name == performance)
        .map(|(_, steps)| *steps)
}

fn default_scheme() -> String {
    SCHEME.to_string()
}

fn deserialize_scheme<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    SchemeValue::deserialize(deserializer).map(|scheme| scheme.name_or(SCHEME))
}

fn is_zero(value: &f32) -> bool {
    *value == 0.0
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

/// Current (v2.3+) schema. Every older generation migrates into this.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub adaptive_cfg: f32,
    #[serde(default)]
    pub adm_guidance: Option<AdmGuidance>,
    pub base_model: String,
    #[serde(default)]
    pub base_model_hash: String,
    #[serde(default)]
    pub clip_skip: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeu: Option<FreeU>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub full_negative_prompt: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub full_prompt: Vec<String>,
    #[serde(default)]
    pub guidance_scale: f32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub image_number: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inpaint_engine_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inpaint_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_combined_1: Option<LoraCombined>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_combined_2: Option<LoraCombined>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_combined_3: Option<LoraCombined>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_combined_4: Option<LoraCombined>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_combined_5: Option<LoraCombined>,
    #[serde(default)]
    pub loras: Vec<Lora>,
    #[serde(default = "default_scheme", deserialize_with = "deserialize_scheme")]
    pub metadata_scheme: String,
    pub negative_prompt: String,
    #[serde(default)]
    pub performance: String,
    pub prompt: String,
    #[serde(default)]
    pub prompt_expansion: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refiner_model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refiner_model_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refiner_swap_method: String,
    #[serde(default)]
    pub refiner_switch: f32,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    pub sampler: String,
    pub scheduler: String,
    /// Canonical decimal string; seeds exceed 2^53.
    #[serde(default, deserialize_with = "codec::deserialize_seed")]
    pub seed: String,
    #[serde(default)]
    pub sharpness: f32,
    #[serde(default)]
    pub steps: u8,
    #[serde(default)]
    pub styles: Styles,
    #[serde(default)]
    pub vae: String,
    pub version: String,
}

impl Metadata {
    /// Back-fills derived fields. Idempotent on an already-normalised
    /// record.
    pub fn normalize(self) -> Self {
        self.fill_loras().fill_steps()
    }

    /// Builds `loras` from the combined slots, unless already populated.
    fn fill_loras(mut self) -> Self {
        if self.loras.is_empty() {
            self.loras = [
                &self.lora_combined_1,
                &self.lora_combined_2,
                &self.lora_combined_3,
                &self.lora_combined_4,
                &self.lora_combined_5,
            ]
            .into_iter()
            .flatten()
            .cloned()
            .map(Lora::from)
            .collect();
        }
        self
    }

    fn fill_steps(mut self) -> Self {
        if self.steps == 0 {
            if let Some(steps) = steps_for_performance(&self.performance) {
                self.steps = steps;
            }
        }
        self
    }
}

/// v2.2 private log schema: the current shape, except the seed is a bare
/// integer and the scheme a boolean.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetadataV22 {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub seed: SeedValue,
    pub metadata_scheme: SchemeValue,
}

impl MetadataV22 {
    pub fn into_current(self) -> Metadata {
        let mut current = self.metadata;
        if current.seed.is_empty() {
            current.seed = self.seed.to_string();
        }
        current.metadata_scheme = self.metadata_scheme.name_or(SCHEME);
        current.normalize()
    }
}

/// v2.1 and older private log schema.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct MetadataV21 {
    #[serde(rename = "ADM Guidance", default)]
    pub adm_guidance: Option<AdmGuidance>,
    #[serde(rename = "Base Model")]
    pub base_model: String,
    #[serde(rename = "CFG Mimicking from TSNR", default)]
    pub cfg_mimicking: f32,
    #[serde(rename = "CLIP Skip", default)]
    pub clip_skip: u8,
    #[serde(rename = "Fooocus V2 Expansion", default)]
    pub fooocus_v2_expansion: String,
    #[serde(rename = "FreeU", default)]
    pub freeu: Option<FreeU>,
    #[serde(rename = "Guidance Scale", default)]
    pub guidance_scale: f32,
    #[serde(rename = "Image Number", default)]
    pub image_number: u32,
    #[serde(rename = "Inpaint Engine Version", default)]
    pub inpaint_engine_version: String,
    #[serde(rename = "Inpaint Mode", default)]
    pub inpaint_mode: String,
    #[serde(rename = "LoRA 1", default)]
    pub lora_1: Option<LoraCombined>,
    #[serde(rename = "LoRA 2", default)]
    pub lora_2: Option<LoraCombined>,
    #[serde(rename = "LoRA 3", default)]
    pub lora_3: Option<LoraCombined>,
    #[serde(rename = "LoRA 4", default)]
    pub lora_4: Option<LoraCombined>,
    #[serde(rename = "LoRA 5", default)]
    pub lora_5: Option<LoraCombined>,
    #[serde(rename = "LoRA 6", default)]
    pub lora_6: Option<LoraCombined>,
    #[serde(rename = "Negative Prompt")]
    pub negative_prompt: String,
    #[serde(rename = "Overwrite Switch", default)]
    pub overwrite_switch: f32,
    #[serde(rename = "Performance", default)]
    pub performance: String,
    #[serde(rename = "Prompt")]
    pub prompt: String,
    #[serde(rename = "Refiner Model", default)]
    pub refiner_model: String,
    #[serde(rename = "Refiner Swap Method", default)]
    pub refiner_swap_method: String,
    #[serde(rename = "Refiner Switch", default)]
    pub refiner_switch: f32,
    #[serde(rename = "Resolution", default)]
    pub resolution: Option<Resolution>,
    #[serde(rename = "Sampler")]
    pub sampler: String,
    #[serde(rename = "Scheduler")]
    pub scheduler: String,
    #[serde(rename = "Seed", deserialize_with = "codec::deserialize_seed")]
    pub seed: String,
    #[serde(rename = "Sharpness", default)]
    pub sharpness: f32,
    #[serde(rename = "Steps", default)]
    pub steps: u8,
    #[serde(rename = "Styles", default)]
    pub styles: Styles,
    #[serde(rename = "VAE", default)]
    pub vae: String,
    #[serde(rename = "Version")]
    pub version: String,
}

impl MetadataV21 {
    /// Field-by-field rename. The six numbered LoRA slots collapse into
    /// `loras`; slots 1-5 also carry over as the combined fields.
    pub fn into_current(self) -> Metadata {
        let loras = [
            &self.lora_1,
            &self.lora_2,
            &self.lora_3,
            &self.lora_4,
            &self.lora_5,
            &self.lora_6,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .map(Lora::from)
        .collect();

        Metadata {
            adaptive_cfg: self.cfg_mimicking,
            adm_guidance: self.adm_guidance,
            base_model: self.base_model,
            clip_skip: self.clip_skip,
            freeu: self.freeu,
            guidance_scale: self.guidance_scale,
            image_number: self.image_number,
            inpaint_engine_version: self.inpaint_engine_version,
            inpaint_method: self.inpaint_mode,
            lora_combined_1: self.lora_1,
            lora_combined_2: self.lora_2,
            lora_combined_3: self.lora_3,
            lora_combined_4: self.lora_4,
            lora_combined_5: self.lora_5,
            loras,
            metadata_scheme: SCHEME.to_string(),
            negative_prompt: self.negative_prompt,
            performance: self.performance,
            prompt: self.prompt,
            prompt_expansion: self.fooocus_v2_expansion,
            refiner_model: self.refiner_model,
            refiner_swap_method: self.refiner_swap_method,
            refiner_switch: self.refiner_switch,
            resolution: self.resolution,
            sampler: self.sampler,
            scheduler: self.scheduler,
            seed: self.seed,
            sharpness: self.sharpness,
            steps: self.steps,
            styles: self.styles,
            vae: self.vae,
            version: self.version,
            ..Metadata::default()
        }
        .normalize()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    V21,
    V22,
    V23,
}

impl Generation {
    pub fn detect(version: &str) -> Result<Self, DecodeError> {
        if version.starts_with("v2.1") {
            Ok(Generation::V21)
        } else if version.starts_with("Fooocus v2.2") {
            Ok(Generation::V22)
        } else if ["Fooocus v2.3", "Fooocus v2.4", "Fooocus v2.5"]
            .iter()
            .any(|prefix| version.starts_with(prefix))
        {
            Ok(Generation::V23)
        } else {
            Err(DecodeError::UnknownVersion(version.to_string()))
        }
    }
}

/// A record in whichever generation it was written.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionedMetadata {
    V21(MetadataV21),
    V22(MetadataV22),
    V23(Metadata),
}

impl VersionedMetadata {
    /// Reads the `version` (or legacy `Version`) key first, then parses the
    /// whole payload with that generation's schema.
    pub fn from_json(payload: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(payload)?;
        let version = value
            .get("version")
            .or_else(|| value.get("Version"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let generation = Generation::detect(version)?;
        log::debug!("Fooocus metadata version {} ({:?})", version, generation);

        Ok(match generation {
            Generation::V21 => VersionedMetadata::V21(serde_json::from_value(value)?),
            Generation::V22 => VersionedMetadata::V22(serde_json::from_value(value)?),
            Generation::V23 => VersionedMetadata::V23(serde_json::from_value(value)?),
        })
    }

    pub fn generation(&self) -> Generation {
        match self {
            VersionedMetadata::V21(_) => Generation::V21,
            VersionedMetadata::V22(_) => Generation::V22,
            VersionedMetadata::V23(_) => Generation::V23,
        }
    }

    pub fn into_current(self) -> Metadata {
        match self {
            VersionedMetadata::V21(legacy) => legacy.into_current(),
            VersionedMetadata::V22(v22) => v22.into_current(),
            VersionedMetadata::V23(current) => current.normalize(),
        }
    }
}

/// Decodes a JSON payload of any known generation into the current shape.
pub fn decode_parameters(payload: &str) -> Result<Metadata, DecodeError> {
    VersionedMetadata::from_json(payload).map(VersionedMetadata::into_current)
}

/// Decodes an embedded payload after checking its scheme tag.
///
/// Only releases that embed metadata write this payload, so a version newer
/// than any known generation is read with the current schema.
pub fn parse_metadata(scheme: &str, payload: &str) -> Result<Metadata, DecodeError> {
    if scheme != SCHEME {
        return Err(DecodeError::UnsupportedScheme {
            software: SOFTWARE,
            found: scheme.to_string(),
        });
    }

    match decode_parameters(payload) {
        Err(DecodeError::UnknownVersion(version)) => {
            log::debug!("Fooocus: reading version {:?} with the current schema", version);
            Ok(serde_json::from_str::<Metadata>(payload)?.normalize())
        }
        decoded => decoded,
    }
}

pub fn parse_private_log<D: LogDocument + ?Sized>(
    doc: &D,
) -> Result<HashMap<String, Metadata>, DecodeError> {
    private_log::collect_entries(doc, LOG_BANNER, decode_parameters)
}

pub fn read_private_log(path: &Path) -> Result<HashMap<String, Metadata>, DecodeError> {
    let doc = private_log::HtmlLogDocument::open(path)?;
    parse_private_log(&doc)
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

/// Reads Fooocus metadata from EXIF/PNG tags, falling back to the private
/// log next to the image.
#[derive(Debug, Clone, Default)]
pub struct FooocusExtractor {
    pub files: FileMetadataExtractor,
}

impl FooocusExtractor {
    pub fn new(files: FileMetadataExtractor) -> Self {
        Self { files }
    }
}

impl MetadataReader for FooocusExtractor {
    type Metadata = Metadata;

    fn decode(&self, ctx: &ImageMetadataContext) -> Result<Metadata, DecodeError> {
        if let Some(software) = ctx.tag("Software") {
            if !software.starts_with(SOFTWARE_PREFIX) {
                return Err(DecodeError::UnsupportedSoftware {
                    software: SOFTWARE,
                    found: software.to_string(),
                });
            }
        }

        let scheme = ctx
            .first_tag(&["MakerNoteApple", "MakerNote", "fooocus_scheme"])
            .ok_or(DecodeError::MissingTag {
                software: SOFTWARE,
                tag: "scheme",
            })?;
        let payload = ctx
            .first_tag(&["UserComment", "parameters"])
            .ok_or(DecodeError::MissingTag {
                software: SOFTWARE,
                tag: "parameters",
            })?;

        parse_metadata(scheme, payload)
    }

    fn extract(&self, ctx: &ImageMetadataContext) -> Result<StructuredMetadata, DecodeError> {
        let created = self.files.created(ctx);
        let wrap = |meta: Metadata| StructuredMetadata {
            source: Source::Fooocus,
            created,
            params: GenerationParameters::Fooocus(meta),
        };

        match self.decode(ctx) {
            Ok(meta) => return Ok(wrap(meta)),
            Err(err) => log::debug!("Fooocus: embedded metadata not usable: {}", err),
        }

        ctx.filepath
            .as_deref()
            .and_then(|path| {
                private_log::lookup_image(&self.files, path, |doc| parse_private_log(doc))
            })
            .map(wrap)
            .ok_or(DecodeError::NoMetadata)
    }
}

/// Writes the `fooocus_scheme` and `parameters` chunks Fooocus embeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct FooocusWriter;

impl MetadataWriter for FooocusWriter {
    type Metadata = Metadata;

    fn text_values(&self, metadata: &Metadata) -> Result<Vec<(&'static str, String)>, WriteError> {
        Ok(vec![
            ("fooocus_scheme", SCHEME.to_string()),
            ("parameters", serde_json::to_string(metadata)?),
        ])
    }
}
