use thiserror::Error;

/// Failure of a single scalar codec (tuple, styles, LoRA strings).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("tuple is not wrapped in parentheses: {0:?}")]
    MissingParentheses(String),

    #[error("invalid number {value:?} in {context}")]
    InvalidNumber { value: String, context: &'static str },

    #[error("styles are not a valid list: {0}")]
    Styles(#[source] serde_json::Error),

    #[error("expected at least {expected} LoRA elements, found {found}")]
    LoraArity { expected: usize, found: usize },

    #[error("LoRA element {index} has the wrong type")]
    LoraElement { index: usize },

    #[error("LoRA details lack the \" - \" separator: {0:?}")]
    LoraSeparator(String),
}

/// Failure of one decode attempt. Only [`DecodeError::NoMetadata`] ever
/// reaches callers of the dispatcher; the rest are logged and discarded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{software}: unsupported software: {found}")]
    UnsupportedSoftware {
        software: &'static str,
        found: String,
    },

    #[error("{software}: unsupported metadata scheme: {found}")]
    UnsupportedScheme {
        software: &'static str,
        found: String,
    },

    #[error("{software}: {tag} not found")]
    MissingTag {
        software: &'static str,
        tag: &'static str,
    },

    #[error("unknown metadata version: {0:?}")]
    UnknownVersion(String),

    #[error("input is JSON, not plaintext")]
    StructuredInput,

    #[error("failed to read parameters: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("not a {banner:?} private log")]
    NotAPrivateLog { banner: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no metadata found")]
    NoMetadata,
}

/// Failure of the file adapter that turns an image on disk into a tag map.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("not a valid PNG file: {0}")]
    InvalidPng(String),

    #[error("EXIF error: {0}")]
    Exif(#[from] exif::Error),
}

/// Failure of the end-to-end file extraction path.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Failure to embed metadata into a PNG.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a valid PNG file: {0}")]
    InvalidPng(String),

    #[error("invalid PNG text keyword {0:?}")]
    InvalidKeyword(String),

    #[error("metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure to load an [`crate::config::ExtractorConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("unknown source {0:?}")]
    UnknownSource(String),
}
