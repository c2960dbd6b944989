use crate::error::DecodeError;
use crate::types::{ImageMetadataContext, StructuredMetadata};
use std::fmt;
use std::sync::{Mutex, PoisonError};

pub type DecodeFn =
    Box<dyn Fn(&ImageMetadataContext) -> Result<StructuredMetadata, DecodeError> + Send + Sync>;

struct Format {
    name: String,
    decode: DecodeFn,
}

/// Ordered table of decoders under construction.
///
/// Registration takes a lock so several initialisation paths may append
/// concurrently. Call [`Registry::build`] once everything is registered;
/// the resulting [`Decoder`] is immutable and needs no locking.
#[derive(Default)]
pub struct Registry {
    formats: Mutex<Vec<Format>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, decode: F)
    where
        F: Fn(&ImageMetadataContext) -> Result<StructuredMetadata, DecodeError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        log::debug!("Registering metadata reader: {}", name);
        self.formats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Format {
                name,
                decode: Box::new(decode),
            });
    }

    pub fn build(self) -> Decoder {
        Decoder {
            formats: self
                .formats
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Tries each registered decoder in registration order.
pub struct Decoder {
    formats: Vec<Format>,
}

impl Decoder {
    /// First successful result wins. Individual failures are only logged;
    /// callers see [`DecodeError::NoMetadata`] when nothing matched.
    pub fn decode(&self, ctx: &ImageMetadataContext) -> Result<StructuredMetadata, DecodeError> {
        log::debug!(
            "Decoding metadata (mime: {}, tags: {})",
            ctx.mime.as_deref().unwrap_or("unknown"),
            ctx.embedded.len()
        );

        for format in &self.formats {
            log::debug!("Trying to decode with {}", format.name);
            match (format.decode)(ctx) {
                Ok(meta) => {
                    log::debug!("Found {} metadata", format.name);
                    return Ok(meta);
                }
                Err(err) => log::debug!("{} did not match: {}", format.name, err),
            }
        }

        Err(DecodeError::NoMetadata)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formats.iter().map(|format| format.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
