//! Reader for the HTML "private log" some tools write next to their
//! outputs. Each image gets a `div.image-container` holding the image and a
//! copy-to-clipboard button whose `onclick` carries the URL-encoded
//! parameters.

use crate::error::DecodeError;
use crate::types::FileMetadataExtractor;
use percent_encoding::percent_decode_str;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

pub const CLIPBOARD_PREFIX: &str = "to_clipboard(";
pub const CLIPBOARD_SUFFIX: &str = "')";

/// One per-image entry as found in the document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogEntry {
    pub image_src: Option<String>,
    pub onclick: Option<String>,
}

/// The two queries the log reader needs from an HTML tree.
pub trait LogDocument {
    fn title(&self) -> Option<String>;
    fn entries(&self) -> Vec<LogEntry>;
}

pub struct HtmlLogDocument {
    html: Html,
}

impl HtmlLogDocument {
    pub fn parse(source: &str) -> Self {
        Self {
            html: Html::parse_document(source),
        }
    }

    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        let source = fs::read_to_string(path)?;
        Ok(Self::parse(&source))
    }
}

fn title_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| Selector::parse("title").expect("valid title selector"))
}

fn container_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| {
        Selector::parse(r#"div[class="image-container"]"#).expect("valid container selector")
    })
}

fn image_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| Selector::parse("img").expect("valid image selector"))
}

fn button_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| Selector::parse("button").expect("valid button selector"))
}

impl LogDocument for HtmlLogDocument {
    fn title(&self) -> Option<String> {
        self.html
            .select(title_selector())
            .next()
            .map(|title| title.text().collect())
    }

    fn entries(&self) -> Vec<LogEntry> {
        self.html
            .select(container_selector())
            .map(|container| LogEntry {
                image_src: container
                    .select(image_selector())
                    .next()
                    .and_then(|img| img.value().attr("src"))
                    .map(str::to_string),
                onclick: container
                    .select(button_selector())
                    .next()
                    .and_then(|button| button.value().attr("onclick"))
                    .map(str::to_string),
            })
            .collect()
    }
}

/// Unwraps `to_clipboard('...')` and URL-decodes the payload
/// (`+` is a space).
pub fn clipboard_payload(onclick: &str) -> Option<String> {
    let quoted = onclick.strip_prefix(CLIPBOARD_PREFIX)?;
    let mut chars = quoted.chars();
    chars.next()?;
    let encoded = chars.as_str().strip_suffix(CLIPBOARD_SUFFIX)?;
    let spaced = encoded.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Maps image file name to decoded record.
///
/// Fails only when the title does not start with `banner`. Entries without
/// an image, without a payload, or whose payload does not decode are
/// skipped.
pub fn collect_entries<T, D, F>(
    doc: &D,
    banner: &'static str,
    decode: F,
) -> Result<HashMap<String, T>, DecodeError>
where
    D: LogDocument + ?Sized,
    F: Fn(&str) -> Result<T, DecodeError>,
{
    let title = doc.title().unwrap_or_default();
    if !title.trim_start().starts_with(banner) {
        return Err(DecodeError::NotAPrivateLog { banner });
    }

    let entries = doc.entries();
    let mut images = HashMap::with_capacity(entries.len());

    for entry in entries {
        let Some(image) = entry.image_src else {
            log::debug!("Skipping private log entry without image");
            continue;
        };
        let Some(payload) = entry.onclick.as_deref().and_then(clipboard_payload) else {
            log::debug!("Skipping private log entry without payload: {}", image);
            continue;
        };

        match decode(&payload) {
            Ok(record) => {
                images.insert(image, record);
            }
            Err(err) => log::debug!("Skipping private log entry {}: {}", image, err),
        }
    }

    Ok(images)
}

/// Looks `image_path` up in the private log that sits next to it (or the
/// explicitly configured one).
pub fn lookup_image<T, F>(files: &FileMetadataExtractor, image_path: &Path, parse: F) -> Option<T>
where
    F: Fn(&HtmlLogDocument) -> Result<HashMap<String, T>, DecodeError>,
{
    let filename = image_path.file_name()?.to_str()?;
    let logfile = files.logfile_for(image_path);
    log::debug!("Checking private log {}", logfile.display());

    let doc = match HtmlLogDocument::open(&logfile) {
        Ok(doc) => doc,
        Err(err) => {
            log::debug!("Private log {} unavailable: {}", logfile.display(), err);
            return None;
        }
    };

    match parse(&doc) {
        Ok(mut images) => {
            log::debug!("Private log {} has {} images", logfile.display(), images.len());
            images.remove(filename)
        }
        Err(err) => {
            log::debug!("Private log {} rejected: {}", logfile.display(), err);
            None
        }
    }
}
