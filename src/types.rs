//! Shared data model: the tag map handed in by the image layer, the
//! per-image context, and the tool-independent result types.

use crate::error::DecodeError;
use crate::{fooocus, fooocusplus, ruinedfooocus, stablediffusion};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where a tag was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagSource {
    Exif,
    PngText,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagInfo {
    pub source: TagSource,
    pub namespace: String,
    pub value: String,
}

impl TagInfo {
    pub fn png_text(value: impl Into<String>) -> Self {
        Self {
            source: TagSource::PngText,
            namespace: "PNG/tEXt".to_string(),
            value: value.into(),
        }
    }

    pub fn exif(namespace: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            source: TagSource::Exif,
            namespace: namespace.into(),
            value: value.into(),
        }
    }
}

/// Flattened embedded metadata keyed by tag name (`Software`,
/// `UserComment`, `parameters`, ...).
pub type TagMap = HashMap<String, TagInfo>;

/// Everything a source decoder may look at for one image.
#[derive(Debug, Clone, Default)]
pub struct ImageMetadataContext {
    /// Location on disk, when known. Needed for the private-log fallback.
    pub filepath: Option<PathBuf>,
    pub mime: Option<String>,
    pub embedded: TagMap,
}

impl ImageMetadataContext {
    pub fn new(embedded: TagMap) -> Self {
        Self {
            embedded,
            ..Self::default()
        }
    }

    pub fn with_filepath(mut self, path: impl Into<PathBuf>) -> Self {
        self.filepath = Some(path.into());
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.embedded.get(name).map(|tag| tag.value.as_str())
    }

    /// Value of the first tag present, in the order given.
    pub fn first_tag(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| self.tag(name))
    }

    pub fn file_name(&self) -> Option<&str> {
        self.filepath
            .as_deref()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
    }
}

/// The tools this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Fooocus,
    FooocusPlus,
    RuinedFooocus,
    StableDiffusion,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::Fooocus,
        Source::FooocusPlus,
        Source::RuinedFooocus,
        Source::StableDiffusion,
    ];

    pub fn software_name(self) -> &'static str {
        match self {
            Source::Fooocus => "Fooocus",
            Source::FooocusPlus => "FooocusPlus",
            Source::RuinedFooocus => "RuinedFooocus",
            Source::StableDiffusion => "StableDiffusion",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.software_name())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().to_ascii_lowercase();
        Source::ALL
            .into_iter()
            .find(|source| source.software_name().to_ascii_lowercase() == wanted)
            .ok_or_else(|| raw.to_string())
    }
}

/// A LoRA reference as exposed to callers: normalised name and weight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoraEntry {
    pub name: String,
    pub weight: f32,
}

impl LoraEntry {
    pub fn new(name: &str, weight: f32) -> Self {
        Self {
            name: normalise_model_name(name),
            weight,
        }
    }
}

/// Tool-independent view over a tool-specific record.
pub trait Parameters {
    fn version(&self) -> &str;
    fn positive_prompt(&self) -> &str;
    fn negative_prompt(&self) -> &str;
    /// Model name without directories or a known model extension.
    fn model(&self) -> String;
    /// Decimal seed. Kept as text since seeds exceed 2^53.
    fn seed(&self) -> String;
    fn loras(&self) -> Vec<LoraEntry>;
}

/// The canonical record of whichever tool produced the image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GenerationParameters {
    Fooocus(fooocus::Metadata),
    FooocusPlus(fooocusplus::Metadata),
    RuinedFooocus(ruinedfooocus::Metadata),
    StableDiffusion(stablediffusion::Metadata),
}

impl GenerationParameters {
    pub fn source(&self) -> Source {
        match self {
            GenerationParameters::Fooocus(_) => Source::Fooocus,
            GenerationParameters::FooocusPlus(_) => Source::FooocusPlus,
            GenerationParameters::RuinedFooocus(_) => Source::RuinedFooocus,
            GenerationParameters::StableDiffusion(_) => Source::StableDiffusion,
        }
    }

    fn as_parameters(&self) -> &dyn Parameters {
        match self {
            GenerationParameters::Fooocus(meta) => meta,
            GenerationParameters::FooocusPlus(meta) => meta,
            GenerationParameters::RuinedFooocus(meta) => meta,
            GenerationParameters::StableDiffusion(meta) => meta,
        }
    }

    pub fn version(&self) -> &str {
        self.as_parameters().version()
    }

    pub fn positive_prompt(&self) -> &str {
        self.as_parameters().positive_prompt()
    }

    pub fn negative_prompt(&self) -> &str {
        self.as_parameters().negative_prompt()
    }

    pub fn model(&self) -> String {
        self.as_parameters().model()
    }

    pub fn seed(&self) -> String {
        self.as_parameters().seed()
    }

    pub fn loras(&self) -> Vec<LoraEntry> {
        self.as_parameters().loras()
    }

    /// The underlying record as JSON, with the tool's own field names.
    pub fn raw(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredMetadata {
    pub source: Source,
    pub created: Option<DateTime<Utc>>,
    pub params: GenerationParameters,
}

impl StructuredMetadata {
    pub fn summary(&self) -> MetadataSummary {
        MetadataSummary {
            source: self.source,
            created: self.created,
            version: self.params.version().to_string(),
            model: self.params.model(),
            seed: self.params.seed(),
            positive_prompt: self.params.positive_prompt().to_string(),
            negative_prompt: self.params.negative_prompt().to_string(),
            loras: self.params.loras(),
        }
    }
}

/// Flat, tool-independent rendering of a [`StructuredMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataSummary {
    pub source: Source,
    pub created: Option<DateTime<Utc>>,
    pub version: String,
    pub model: String,
    pub seed: String,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub loras: Vec<LoraEntry>,
}

/// A source decoder: reads its tool's record out of a context and wraps it
/// as [`StructuredMetadata`].
pub trait MetadataReader: Send + Sync {
    type Metadata;

    /// Decodes the tool-specific record from embedded tags only.
    fn decode(&self, ctx: &ImageMetadataContext) -> Result<Self::Metadata, DecodeError>;

    /// Embedded tags first, then any external source the tool supports.
    fn extract(&self, ctx: &ImageMetadataContext) -> Result<StructuredMetadata, DecodeError>;
}

/// `2024-05-01_12-30-45-1234.png` style names.
pub const FILENAME_DATE_LAYOUT: &str = "%Y-%m-%d_%H-%M-%S";
const FILENAME_DATE_LEN: usize = "YYYY-MM-DD_HH-MM-SS".len();

pub const DEFAULT_LOGFILE_NAME: &str = "log.html";

/// File-level settings shared by the source decoders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadataExtractor {
    pub date_layout: &'static str,
    /// Private log file name, resolved next to the image.
    pub logfile_name: String,
    /// Explicit private log, overriding `logfile_name`.
    pub log_file: Option<PathBuf>,
}

impl Default for FileMetadataExtractor {
    fn default() -> Self {
        Self {
            date_layout: FILENAME_DATE_LAYOUT,
            logfile_name: DEFAULT_LOGFILE_NAME.to_string(),
            log_file: None,
        }
    }
}

impl FileMetadataExtractor {
    pub fn created_from_filename(&self, filename: &str) -> Option<DateTime<Utc>> {
        let prefix = filename.get(..FILENAME_DATE_LEN)?;
        NaiveDateTime::parse_from_str(prefix, self.date_layout)
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn created(&self, ctx: &ImageMetadataContext) -> Option<DateTime<Utc>> {
        ctx.file_name()
            .and_then(|name| self.created_from_filename(name))
    }

    /// Private log that would describe `image_path`.
    pub fn logfile_for(&self, image_path: &Path) -> PathBuf {
        match &self.log_file {
            Some(explicit) => explicit.clone(),
            None => image_path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join(&self.logfile_name),
        }
    }
}

const MODEL_EXTENSIONS: &[&str] = &[
    "safetensors",
    "ckpt",
    "gguf",
    "pt",
    "pth",
    "onnx",
    "bin",
    "sft",
];

/// Strips directories (either separator) and a known model extension.
pub fn normalise_model_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && MODEL_EXTENSIONS.contains(&ext) => {
            stem.to_string()
        }
        _ => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_normalise_model_name() {
        let cases = [
            ("model.safetensors", "model"),
            ("/path/to/model.safetensors", "model"),
            ("another_model.gguf", "another_model"),
            ("models/model.pt", "model"),
            ("models/model.pth", "model"),
            ("relative/path/model.onnx", "model"),
            ("C:\\models\\sdxl\\juggernaut.ckpt", "juggernaut"),
            ("simplemodel", "simplemodel"),
            ("model.txt", "model.txt"),
            ("sd_xl_base_1.0_0.9vae.safetensors", "sd_xl_base_1.0_0.9vae"),
            ("sd_xl_offset_example-lora_1.0", "sd_xl_offset_example-lora_1.0"),
        ];

        for (input, expected) in cases {
            assert_eq!(normalise_model_name(input), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_created_from_filename() {
        let files = FileMetadataExtractor::default();
        let created = files
            .created_from_filename("2024-03-18_21-05-09_6789.png")
            .expect("timestamped filename");
        assert_eq!(created.year(), 2024);
        assert_eq!(created.month(), 3);
        assert_eq!(created.day(), 18);
        assert_eq!(created.hour(), 21);
        assert_eq!(created.minute(), 5);
        assert_eq!(created.second(), 9);
    }

    #[test]
    fn test_created_from_filename_mismatch() {
        let files = FileMetadataExtractor::default();
        assert!(files.created_from_filename("image.png").is_none());
        assert!(files.created_from_filename("2024-13-18_21-05-09.png").is_none());
        assert!(files.created_from_filename("20240318_210509_extra_chars.png").is_none());
    }

    #[test]
    fn test_logfile_for_uses_image_directory() {
        let files = FileMetadataExtractor::default();
        assert_eq!(
            files.logfile_for(Path::new("/outputs/2024-03-18/image.png")),
            PathBuf::from("/outputs/2024-03-18/log.html")
        );

        let explicit = FileMetadataExtractor {
            log_file: Some(PathBuf::from("/tmp/custom.html")),
            ..FileMetadataExtractor::default()
        };
        assert_eq!(
            explicit.logfile_for(Path::new("/outputs/image.png")),
            PathBuf::from("/tmp/custom.html")
        );
    }

    #[test]
    fn test_context_tag_lookup() {
        let mut embedded = TagMap::new();
        embedded.insert("parameters".to_string(), TagInfo::png_text("payload"));
        let ctx = ImageMetadataContext::new(embedded).with_filepath("/a/b/2024-01-01_00-00-00.png");

        assert_eq!(ctx.first_tag(&["UserComment", "parameters"]), Some("payload"));
        assert_eq!(ctx.tag("Software"), None);
        assert_eq!(ctx.file_name(), Some("2024-01-01_00-00-00.png"));
    }

    #[test]
    fn test_seed_accessor_for_every_source() {
        let records = [
            GenerationParameters::Fooocus(
                fooocus::parse_metadata("fooocus", fooocus::fixtures::META_V23_JSON).unwrap(),
            ),
            GenerationParameters::FooocusPlus(
                fooocusplus::parse_metadata(fooocusplus::fixtures::META_JSON).unwrap(),
            ),
            GenerationParameters::RuinedFooocus(
                ruinedfooocus::parse_metadata(ruinedfooocus::fixtures::META_JSON).unwrap(),
            ),
            GenerationParameters::StableDiffusion(
                stablediffusion::parse_parameters("a cat\nSteps: 20, Seed: -1").unwrap(),
            ),
        ];
        let seeds = records.iter().map(GenerationParameters::seed).collect::<Vec<_>>();
        assert_eq!(
            seeds,
            vec!["127589946317439009", "5256010854089202552", "3864674281", "-1"]
        );

        let summary = StructuredMetadata {
            source: Source::RuinedFooocus,
            created: None,
            params: records[2].clone(),
        }
        .summary();
        assert_eq!(summary.seed, "3864674281");
    }

    #[test]
    fn test_source_from_str() {
        assert_eq!("fooocusplus".parse::<Source>(), Ok(Source::FooocusPlus));
        assert_eq!(" StableDiffusion ".parse::<Source>(), Ok(Source::StableDiffusion));
        assert!("comfyui".parse::<Source>().is_err());
    }
}
