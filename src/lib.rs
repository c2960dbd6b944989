//! Reads the generation parameters that Fooocus, FooocusPlus,
//! RuinedFooocus and AUTOMATIC1111-compatible tools embed in their images.
//!
//! ```no_run
//! use fooocus_metadata::{config::ExtractorConfig, default_decoder, extract_from_file};
//!
//! let decoder = default_decoder(&ExtractorConfig::default());
//! let meta = extract_from_file("outputs/2024-03-18_21-05-09_6789.png".as_ref(), &decoder)?;
//! println!("{} {}", meta.source, meta.params.positive_prompt());
//! # Ok::<(), fooocus_metadata::error::ExtractError>(())
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod fooocus;
pub mod fooocusplus;
pub mod parser;
pub mod private_log;
pub mod registry;
pub mod ruinedfooocus;
pub mod scanner;
pub mod stablediffusion;
pub mod types;
pub mod writer;

use config::ExtractorConfig;
use error::{DecodeError, ExtractError};
use registry::{Decoder, Registry};
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use types::{ImageMetadataContext, MetadataReader, Source};

pub use types::{
    GenerationParameters, LoraEntry, MetadataSummary, Parameters, StructuredMetadata, TagInfo,
    TagMap,
};
pub use writer::MetadataWriter;

/// Registers `reader` under `name`.
pub fn register_reader<R>(registry: &Registry, name: &str, reader: R)
where
    R: MetadataReader + 'static,
{
    registry.register(name, move |ctx| reader.extract(ctx));
}

/// A decoder with one reader per configured source, tried in the
/// configured order.
pub fn default_decoder(config: &ExtractorConfig) -> Decoder {
    let registry = Registry::new();
    let files = config.files();

    for source in &config.sources {
        let name = source.software_name();
        match source {
            Source::Fooocus => {
                register_reader(&registry, name, fooocus::FooocusExtractor::new(files.clone()))
            }
            Source::FooocusPlus => register_reader(
                &registry,
                name,
                fooocusplus::FooocusPlusExtractor::new(files.clone()),
            ),
            Source::RuinedFooocus => register_reader(
                &registry,
                name,
                ruinedfooocus::RuinedFooocusExtractor::new(files.clone()),
            ),
            Source::StableDiffusion => register_reader(
                &registry,
                name,
                stablediffusion::StableDiffusionExtractor::new(files.clone()),
            ),
        }
    }

    registry.build()
}

pub fn extract_from_context(
    ctx: &ImageMetadataContext,
    decoder: &Decoder,
) -> Result<StructuredMetadata, DecodeError> {
    decoder.decode(ctx)
}

/// Reads the image's embedded tags and runs them through `decoder`.
pub fn extract_from_file(path: &Path, decoder: &Decoder) -> Result<StructuredMetadata, ExtractError> {
    let ctx = scanner::context_from_file(path)?;
    Ok(extract_from_context(&ctx, decoder)?)
}

/// Like [`extract_from_file`], for an image held in memory or on any
/// seekable stream. `path` is where the image lives, if known: it feeds the
/// filename timestamp and the private-log fallback.
pub fn extract_from_reader<R: Read + Seek>(
    reader: R,
    path: Option<&Path>,
    decoder: &Decoder,
) -> Result<StructuredMetadata, ExtractError> {
    let mut reader = BufReader::new(reader);
    let mut ctx = scanner::context_from_reader(&mut reader)?;
    if let Some(path) = path {
        ctx = ctx.with_filepath(path);
    }
    Ok(extract_from_context(&ctx, decoder)?)
}
