//! FooocusPlus metadata. Embedded records use human-readable keys; the
//! private log uses the Fooocus machine keys and is mapped across.

use crate::codec::{self, AdmGuidance, Lora, Resolution, Styles};
use crate::error::{DecodeError, WriteError};
use crate::private_log::{self, LogDocument};
use crate::types::{
    FileMetadataExtractor, GenerationParameters, ImageMetadataContext, LoraEntry, MetadataReader,
    Parameters, Source, StructuredMetadata,
};
use crate::writer::MetadataWriter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const SOFTWARE: &str = "FooocusPlus";
pub const SOFTWARE_PREFIX: &str = "FooocusPlus 1.";
/// Prefix of the `version` field of every FooocusPlus record.
pub const VERSION_PREFIX: &str = "FooocusPlus ";
/// FooocusPlus shares its private log layout with Fooocus.
pub const LOG_BANNER: &str = "Fooocus Log";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "ADM Guidance", default)]
    pub adm_guidance: Option<AdmGuidance>,
    #[serde(rename = "Backend Engine", default)]
    pub backend_engine: String,
    #[serde(rename = "Base Model")]
    pub base_model: String,
    #[serde(rename = "Base Model Hash", default)]
    pub base_model_hash: String,
    #[serde(rename = "CLIP Skip", default)]
    pub clip_skip: u8,
    #[serde(rename = "Fooocus V2 Expansion", default)]
    pub fooocus_v2_expansion: String,
    #[serde(rename = "Full Negative Prompt", default)]
    pub full_negative_prompt: Vec<String>,
    #[serde(rename = "Full Prompt", default)]
    pub full_prompt: Vec<String>,
    #[serde(rename = "Guidance Scale", default)]
    pub guidance_scale: f32,
    #[serde(rename = "LoRAs", default)]
    pub loras: Vec<Lora>,
    #[serde(rename = "Metadata Scheme", default)]
    pub metadata_scheme: String,
    #[serde(rename = "Negative Prompt")]
    pub negative_prompt: String,
    #[serde(rename = "Performance", default)]
    pub performance: String,
    #[serde(rename = "Prompt")]
    pub prompt: String,
    #[serde(rename = "Refiner Model", default, skip_serializing_if = "String::is_empty")]
    pub refiner_model: String,
    #[serde(rename = "Refiner Model Hash", default, skip_serializing_if = "String::is_empty")]
    pub refiner_model_hash: String,
    #[serde(rename = "Refiner Swap Method", default, skip_serializing_if = "String::is_empty")]
    pub refiner_swap_method: String,
    #[serde(rename = "Refiner Switch", default)]
    pub refiner_switch: f32,
    #[serde(rename = "Resolution", default)]
    pub resolution: Option<Resolution>,
    #[serde(rename = "Sampler")]
    pub sampler: String,
    #[serde(rename = "Scheduler")]
    pub scheduler: String,
    #[serde(rename = "Seed", default, deserialize_with = "codec::deserialize_seed")]
    pub seed: String,
    #[serde(rename = "Sharpness", default)]
    pub sharpness: f32,
    #[serde(rename = "Steps", default)]
    pub steps: u8,
    #[serde(rename = "Styles", default)]
    pub styles: Styles,
    #[serde(rename = "styles_definition", default)]
    pub styles_definition: String,
    #[serde(rename = "User", default)]
    pub user: String,
    #[serde(rename = "VAE", default)]
    pub vae: String,
    #[serde(rename = "Version")]
    pub version: String,
}

/// Private log record. Keys follow Fooocus, except for a handful the log
/// writer passes through unchanged.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct MetadataPrivateLog {
    #[serde(default)]
    pub adm_guidance: Option<AdmGuidance>,
    #[serde(default)]
    pub backend_engine: String,
    pub base_model: String,
    #[serde(rename = "Base Model Hash", default)]
    pub base_model_hash: String,
    #[serde(default)]
    pub clip_skip: u8,
    #[serde(default)]
    pub prompt_expansion: String,
    #[serde(rename = "Full Negative Prompt", default)]
    pub full_negative_prompt: Vec<String>,
    #[serde(rename = "Full Prompt", default)]
    pub full_prompt: Vec<String>,
    #[serde(default)]
    pub guidance_scale: f32,
    #[serde(rename = "LoRAs", default)]
    pub loras: Vec<Lora>,
    #[serde(default)]
    pub metadata_scheme: String,
    pub negative_prompt: String,
    #[serde(default)]
    pub performance: String,
    pub prompt: String,
    #[serde(default)]
    pub refiner_model: String,
    #[serde(rename = "Refiner Model Hash", default)]
    pub refiner_model_hash: String,
    #[serde(rename = "Refiner Swap Method", default)]
    pub refiner_swap_method: String,
    #[serde(default)]
    pub refiner_switch: f32,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    pub sampler: String,
    pub scheduler: String,
    #[serde(default, deserialize_with = "codec::deserialize_seed")]
    pub seed: String,
    #[serde(default)]
    pub sharpness: f32,
    #[serde(default)]
    pub steps: u8,
    #[serde(default)]
    pub styles: Styles,
    #[serde(default)]
    pub styles_definition: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub vae: String,
    pub version: String,
}

impl MetadataPrivateLog {
    /// The log does not record hashes, full prompts or the user; those stay
    /// empty in the mapped record.
    pub fn to_metadata(&self) -> Metadata {
        Metadata {
            adm_guidance: self.adm_guidance.clone(),
            backend_engine: self.backend_engine.clone(),
            base_model: self.base_model.clone(),
            clip_skip: self.clip_skip,
            fooocus_v2_expansion: self.prompt_expansion.clone(),
            guidance_scale: self.guidance_scale,
            loras: self.loras.clone(),
            metadata_scheme: self.metadata_scheme.clone(),
            negative_prompt: self.negative_prompt.clone(),
            performance: self.performance.clone(),
            prompt: self.prompt.clone(),
            refiner_model: self.refiner_model.clone(),
            refiner_swap_method: self.refiner_swap_method.clone(),
            refiner_switch: self.refiner_switch,
            resolution: self.resolution.clone(),
            sampler: self.sampler.clone(),
            scheduler: self.scheduler.clone(),
            seed: self.seed.clone(),
            sharpness: self.sharpness,
            steps: self.steps,
            styles: self.styles.clone(),
            vae: self.vae.clone(),
            version: self.version.clone(),
            ..Metadata::default()
        }
    }
}

fn check_version(version: &str) -> Result<(), DecodeError> {
    if version.starts_with(VERSION_PREFIX) {
        Ok(())
    } else {
        Err(DecodeError::UnknownVersion(version.to_string()))
    }
}

/// Decodes an embedded (human-keyed) payload.
pub fn parse_metadata(payload: &str) -> Result<Metadata, DecodeError> {
    let meta: Metadata = serde_json::from_str(payload)?;
    check_version(&meta.version)?;
    Ok(meta)
}

/// Decodes one private log payload. Records written by other Fooocus
/// variants into the same log are rejected by version.
pub fn parse_log_entry(payload: &str) -> Result<Metadata, DecodeError> {
    let entry: MetadataPrivateLog = serde_json::from_str(payload)?;
    check_version(&entry.version)?;
    Ok(entry.to_metadata())
}

pub fn parse_private_log<D: LogDocument + ?Sized>(
    doc: &D,
) -> Result<HashMap<String, Metadata>, DecodeError> {
    private_log::collect_entries(doc, LOG_BANNER, parse_log_entry)
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

#[derive(Debug, Clone, Default)]
pub struct FooocusPlusExtractor {
    pub files: FileMetadataExtractor,
}

impl FooocusPlusExtractor {
    pub fn new(files: FileMetadataExtractor) -> Self {
        Self { files }
    }
}

impl MetadataReader for FooocusPlusExtractor {
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

        let payload = ctx
            .first_tag(&["UserComment", "Comment"])
            .ok_or(DecodeError::MissingTag {
                software: SOFTWARE,
                tag: "parameters",
            })?;

        parse_metadata(payload)
    }

    fn extract(&self, ctx: &ImageMetadataContext) -> Result<StructuredMetadata, DecodeError> {
        let created = self.files.created(ctx);
        let wrap = |meta: Metadata| StructuredMetadata {
            source: Source::FooocusPlus,
            created,
            params: GenerationParameters::FooocusPlus(meta),
        };

        match self.decode(ctx) {
            Ok(meta) => return Ok(wrap(meta)),
            Err(err) => log::debug!("FooocusPlus: embedded metadata not usable: {}", err),
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

/// Writes the single `Comment` chunk FooocusPlus embeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct FooocusPlusWriter;

impl MetadataWriter for FooocusPlusWriter {
    type Metadata = Metadata;

    fn text_values(&self, metadata: &Metadata) -> Result<Vec<(&'static str, String)>, WriteError> {
        Ok(vec![("Comment", serde_json::to_string(metadata)?)])
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::codec::Tuple;
    use crate::fooocus;
    use crate::private_log::testing::render_log;
    use crate::types::{TagInfo, TagMap};
    use pretty_assertions::assert_eq;

    fn expected() -> Metadata {
        Metadata {
            adm_guidance: Some(Tuple::new(vec![1.5, 0.8, 0.3])),
            backend_engine: "SDXL-Fooocus".to_string(),
            base_model: "elsewhereXL_v10".to_string(),
            base_model_hash: "79fd29ab43".to_string(),
            clip_skip: 2,
            fooocus_v2_expansion:
                "A sunflower field, beautiful dynamic dramatic bright shining atmosphere".to_string(),
            full_negative_prompt: vec![
                "(worst quality, low quality, normal quality, lowres:1.4), (blur, blurry, grainy)"
                    .to_string(),
            ],
            full_prompt: vec![
                "A sunflower field".to_string(),
                "A sunflower field, beautiful dynamic dramatic bright shining atmosphere".to_string(),
            ],
            guidance_scale: 4.5,
            loras: Vec::new(),
            metadata_scheme: "Fooocus".to_string(),
            negative_prompt: String::new(),
            performance: "Speed".to_string(),
            prompt: "A sunflower field".to_string(),
            refiner_model: "None".to_string(),
            refiner_switch: 0.6,
            resolution: Some(Tuple::new(vec![1024, 1024])),
            sampler: "dpmpp_2m_sde_gpu".to_string(),
            scheduler: "karras".to_string(),
            seed: "5256010854089202552".to_string(),
            sharpness: 6.0,
            steps: 30,
            styles: Styles(vec!["Fooocus V2".to_string(), "Fooocus Enhance".to_string()]),
            user: "FooocusPlus".to_string(),
            vae: "Default (model)".to_string(),
            version: "FooocusPlus 1.0.0".to_string(),
            ..Metadata::default()
        }
    }

    fn embedded(tags: &[(&str, &str)]) -> ImageMetadataContext {
        let map: TagMap = tags
            .iter()
            .map(|(name, value)| (name.to_string(), TagInfo::png_text(*value)))
            .collect();
        ImageMetadataContext::new(map)
    }

    #[test]
    fn test_decode_from_png_comment() {
        let ctx = embedded(&[("Comment", META_JSON)]);
        let meta = FooocusPlusExtractor::default().decode(&ctx).unwrap();
        assert_eq!(meta, expected());
    }

    #[test]
    fn test_decode_from_exif() {
        let ctx = embedded(&[("Software", "FooocusPlus 1.0.0"), ("UserComment", META_JSON)]);
        let meta = FooocusPlusExtractor::default().decode(&ctx).unwrap();
        assert_eq!(meta, expected());
    }

    #[test]
    fn test_decode_rejects_other_software() {
        let ctx = embedded(&[("Software", "Fooocus v2.5.5"), ("UserComment", META_JSON)]);
        assert!(matches!(
            FooocusPlusExtractor::default().decode(&ctx),
            Err(DecodeError::UnsupportedSoftware { .. })
        ));

        let future = embedded(&[("Software", "FooocusPlus 2.0.0"), ("UserComment", META_JSON)]);
        assert!(FooocusPlusExtractor::default().decode(&future).is_err());
    }

    #[test]
    fn test_decode_rejects_fooocus_payload() {
        let ctx = embedded(&[("Comment", fooocus::fixtures::META_V23_JSON)]);
        assert!(FooocusPlusExtractor::default().decode(&ctx).is_err());
    }

    #[test]
    fn test_decode_requires_payload() {
        let ctx = embedded(&[("Software", "FooocusPlus 1.0.0")]);
        assert!(matches!(
            FooocusPlusExtractor::default().decode(&ctx),
            Err(DecodeError::MissingTag { .. })
        ));
    }

    #[test]
    fn test_accessors() {
        let meta = expected();
        assert_eq!(meta.model(), "elsewhereXL_v10");
        assert_eq!(meta.positive_prompt(), "A sunflower field");
        assert!(meta.loras().is_empty());
    }

    #[test]
    fn test_round_trip() {
        let mut record = expected();
        record.loras = vec![Lora::new("sd_xl_offset_example-lora_1.0", 0.1, "4852686128")];
        record.refiner_swap_method = "joint".to_string();

        let encoded = serde_json::to_string(&record).unwrap();
        assert_eq!(parse_metadata(&encoded).unwrap(), record);
    }

    #[test]
    fn test_writer_values() {
        let values = FooocusPlusWriter.text_values(&expected()).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, "Comment");

        let ctx = embedded(&[("Comment", values[0].1.as_str())]);
        assert_eq!(FooocusPlusExtractor::default().decode(&ctx).unwrap(), expected());
    }

    #[test]
    fn test_log_entry_maps_machine_keys() {
        let meta = parse_log_entry(LOG_JSON).unwrap();
        assert_eq!(meta.base_model, "elsewhereXL_v10.safetensors");
        assert_eq!(
            meta.fooocus_v2_expansion,
            "A sunflower field, beautiful dynamic dramatic bright shining atmosphere"
        );
        assert_eq!(meta.metadata_scheme, "simple");
        assert_eq!(meta.backend_engine, "SDXL-Fooocus");
        assert_eq!(meta.seed, "5256010854089202552");
        assert_eq!(meta.base_model_hash, "");
        assert!(meta.full_prompt.is_empty());
        assert_eq!(meta.model(), "elsewhereXL_v10");
    }

    #[test]
    fn test_private_log_skips_other_variants() {
        let html = render_log(
            "Fooocus Log 2025-01-02 (private)",
            &[
                ("plus.png", LOG_JSON),
                ("plain.png", fooocus::fixtures::META_V23_JSON),
            ],
        );
        let images = parse_private_log(&private_log::HtmlLogDocument::parse(&html)).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images["plus.png"].version, "FooocusPlus 1.0.0");
    }

    #[test]
    fn test_extract_falls_back_to_private_log() {
        let dir = tempfile::tempdir().unwrap();
        let html = render_log("Fooocus Log", &[("2025-01-02_10-11-12_0001.png", LOG_JSON)]);
        std::fs::write(dir.path().join("log.html"), html).unwrap();

        let ctx = ImageMetadataContext::default()
            .with_filepath(dir.path().join("2025-01-02_10-11-12_0001.png"));
        let meta = FooocusPlusExtractor::default().extract(&ctx).unwrap();
        assert_eq!(meta.source, Source::FooocusPlus);
        assert!(meta.created.is_some());
        assert_eq!(meta.params.model(), "elsewhereXL_v10");

        let missing = ImageMetadataContext::default().with_filepath(dir.path().join("other.png"));
        assert!(matches!(
            FooocusPlusExtractor::default().extract(&missing),
            Err(DecodeError::NoMetadata)
        ));
    }
}
