//! Turns an image on disk into an [`ImageMetadataContext`].
//!
//! PNG text chunks are read directly: chunk headers only, pixel data is
//! skipped. Everything else (JPEG, WebP, TIFF) goes through the EXIF
//! reader.

use crate::error::ScanError;
use crate::types::{ImageMetadataContext, TagInfo, TagMap};
use byteorder::{BigEndian, ReadBytesExt};
use exif::{In, Tag};
use flate2::read::ZlibDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// PNG file signature (first 8 bytes of any valid PNG)
pub(crate) const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];
const READER_CAPACITY: usize = 128 * 1024;
const SNIFF_LEN: usize = 12;

pub const EXIF_NAMESPACE: &str = "EXIF";

/// Container formats recognised by their leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    Tiff,
}

impl ImageFormat {
    pub fn sniff(head: &[u8]) -> Option<Self> {
        if head.starts_with(&PNG_SIGNATURE) {
            Some(ImageFormat::Png)
        } else if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
            Some(ImageFormat::Tiff)
        } else {
            None
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Tiff => "image/tiff",
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ScanError {
    ScanError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Reads the embedded tags of one image file.
pub fn context_from_file(path: &Path) -> Result<ImageMetadataContext, ScanError> {
    let file = File::open(path).map_err(|err| io_error(path, err))?;
    let mut reader = BufReader::with_capacity(READER_CAPACITY, file);

    let ctx = context_from_reader(&mut reader).map_err(|err| match err {
        ScanError::Io { source, .. } => io_error(path, source),
        ScanError::UnsupportedFormat(_) => ScanError::UnsupportedFormat(path.display().to_string()),
        other => other,
    })?;
    log::debug!("Scanned {}", path.display());

    Ok(ctx.with_filepath(path))
}

/// Reads the embedded tags of an image stream. The context has no file
/// path; callers that know one attach it with
/// [`ImageMetadataContext::with_filepath`].
pub fn context_from_reader<R: BufRead + Seek>(
    reader: &mut R,
) -> Result<ImageMetadataContext, ScanError> {
    let head = reader.fill_buf().map_err(|source| ScanError::Io {
        path: "image stream".to_string(),
        source,
    })?;
    let format = ImageFormat::sniff(&head[..head.len().min(SNIFF_LEN)])
        .ok_or_else(|| ScanError::UnsupportedFormat("image stream".to_string()))?;

    let embedded = match format {
        ImageFormat::Png => read_png_tags(reader)?,
        _ => read_exif_tags(reader)?,
    };
    log::debug!("Read {} tags ({})", embedded.len(), format.mime());

    Ok(ImageMetadataContext::new(embedded).with_mime(format.mime()))
}

/// Text chunks become `PNG/tEXt` tags; an `eXIf` chunk contributes EXIF
/// tags that do not clash with a text key.
pub fn read_png_tags<R: Read + Seek>(reader: &mut R) -> Result<TagMap, ScanError> {
    let io = |source| ScanError::Io {
        path: "PNG stream".to_string(),
        source,
    };

    let mut sig = [0u8; 8];
    reader.read_exact(&mut sig).map_err(io)?;
    if sig != PNG_SIGNATURE {
        return Err(ScanError::InvalidPng("bad signature".to_string()));
    }

    let mut tags = TagMap::new();
    let mut exif_tags = TagMap::new();

    loop {
        let length = match reader.read_u32::<BigEndian>() {
            Ok(len) => len,
            Err(_) => break, // EOF
        };

        let mut chunk_type = [0u8; 4];
        if reader.read_exact(&mut chunk_type).is_err() {
            break;
        }

        match &chunk_type {
            b"tEXt" | b"zTXt" | b"iTXt" | b"eXIf" => {
                // The declared length is untrusted; read no more than the stream holds.
                let mut data = Vec::new();
                reader
                    .by_ref()
                    .take(u64::from(length))
                    .read_to_end(&mut data)
                    .map_err(io)?;
                if data.len() != length as usize {
                    return Err(ScanError::InvalidPng(format!(
                        "truncated {} chunk: {} of {} bytes",
                        String::from_utf8_lossy(&chunk_type),
                        data.len(),
                        length
                    )));
                }
                reader.seek(SeekFrom::Current(4)).map_err(io)?; // Skip CRC

                let maybe_pair = match &chunk_type {
                    b"tEXt" => parse_text_chunk_pair(&data),
                    b"zTXt" => parse_ztxt_chunk_pair(&data),
                    b"iTXt" => parse_itxt_chunk_pair(&data),
                    _ => {
                        match exif::Reader::new().read_raw(data) {
                            Ok(exif) => exif_tags = exif_to_tags(&exif),
                            Err(err) => log::debug!("Ignoring unreadable eXIf chunk: {}", err),
                        }
                        None
                    }
                };

                if let Some((key, value)) = maybe_pair {
                    tags.insert(key, TagInfo::png_text(value));
                }
            }
            b"IEND" => {
                break;
            }
            _ => {
                reader
                    .seek(SeekFrom::Current(length as i64 + 4))
                    .map_err(io)?;
            }
        }
    }

    for (key, tag) in exif_tags {
        tags.entry(key).or_insert(tag);
    }
    Ok(tags)
}

fn parse_text_chunk_pair(data: &[u8]) -> Option<(String, String)> {
    let null_pos = data.iter().position(|&b| b == 0)?;
    let keyword = String::from_utf8(data[..null_pos].to_vec()).ok()?;
    // tEXt is Latin-1; tools writing JSON stay within ASCII/UTF-8 in practice.
    let value = String::from_utf8_lossy(&data[null_pos + 1..]).into_owned();
    Some((keyword, value))
}

fn parse_ztxt_chunk_pair(data: &[u8]) -> Option<(String, String)> {
    let null_pos = data.iter().position(|&b| b == 0)?;
    let keyword = String::from_utf8(data[..null_pos].to_vec()).ok()?;

    let cursor = null_pos + 1;
    let compression_method = *data.get(cursor)?;
    if compression_method != 0 {
        return None;
    }

    let value = decompress_zlib_to_string(&data[cursor + 1..])?;
    Some((keyword, value))
}

fn parse_itxt_chunk_pair(data: &[u8]) -> Option<(String, String)> {
    let null_pos = data.iter().position(|&b| b == 0)?;
    let keyword = String::from_utf8(data[..null_pos].to_vec()).ok()?;

    let rest = &data[null_pos + 1..];
    if rest.len() < 2 {
        return None;
    }

    let compression_flag = rest[0];
    let compression_method = rest[1];
    if compression_flag > 1 {
        return None;
    }

    let after_compression = &rest[2..];
    let lang_end = after_compression.iter().position(|&b| b == 0)?;
    let after_lang = &after_compression[lang_end + 1..];
    let translated_end = after_lang.iter().position(|&b| b == 0)?;
    let text = &after_lang[translated_end + 1..];

    if compression_flag == 1 {
        if compression_method != 0 {
            return None;
        }
        let value = decompress_zlib_to_string(text)?;
        return Some((keyword, value));
    }

    let value = String::from_utf8(text.to_vec()).ok()?;
    Some((keyword, value))
}

fn decompress_zlib_to_string(data: &[u8]) -> Option<String> {
    let mut decoder = ZlibDecoder::new(data);
    let mut output = String::new();
    decoder.read_to_string(&mut output).ok()?;
    Some(output)
}

/// EXIF fields of JPEG, WebP and TIFF containers. A file without an EXIF
/// block yields an empty map.
pub fn read_exif_tags<R: BufRead + Seek>(reader: &mut R) -> Result<TagMap, ScanError> {
    match exif::Reader::new().read_from_container(reader) {
        Ok(exif) => Ok(exif_to_tags(&exif)),
        Err(exif::Error::NotFound(_)) => Ok(TagMap::new()),
        Err(err) => Err(err.into()),
    }
}

/// Primary-image fields keyed by tag name (`Software`, `UserComment`,
/// `MakerNote`, ...).
fn exif_to_tags(exif: &exif::Exif) -> TagMap {
    let mut tags = TagMap::new();
    for field in exif.fields().filter(|field| field.ifd_num == In::PRIMARY) {
        let value = match &field.value {
            exif::Value::Ascii(parts) => parts
                .iter()
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(""),
            exif::Value::Undefined(bytes, _) if field.tag == Tag::UserComment => {
                decode_user_comment(bytes, exif.little_endian())
            }
            exif::Value::Undefined(bytes, _) => String::from_utf8_lossy(bytes)
                .trim_end_matches('\0')
                .to_string(),
            _ => field.display_value().to_string(),
        };
        tags.entry(field.tag.to_string())
            .or_insert_with(|| TagInfo::exif(EXIF_NAMESPACE, value));
    }
    tags
}

/// Decodes a `UserComment` through its 8-byte character code. Comments
/// without a recognised code are read as UTF-8.
pub fn decode_user_comment(bytes: &[u8], little_endian: bool) -> String {
    let (code, body) = if bytes.len() >= 8 {
        bytes.split_at(8)
    } else {
        (&[][..], bytes)
    };

    let text = match code {
        b"ASCII\0\0\0" | b"\0\0\0\0\0\0\0\0" => String::from_utf8_lossy(body).into_owned(),
        b"UNICODE\0" => decode_utf16(body, little_endian),
        b"JIS\0\0\0\0\0" => String::from_utf8_lossy(body).into_owned(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    };
    text.trim_end_matches('\0').to_string()
}

/// A byte order mark wins over the container's byte order.
fn decode_utf16(body: &[u8], little_endian: bool) -> String {
    let (body, little_endian) = match body {
        [0xFF, 0xFE, rest @ ..] => (rest, true),
        [0xFE, 0xFF, rest @ ..] => (rest, false),
        _ => (body, little_endian),
    };
    let units = body.chunks_exact(2).map(|pair| {
        if little_endian {
            u16::from_le_bytes([pair[0], pair[1]])
        } else {
            u16::from_be_bytes([pair[0], pair[1]])
        }
    });
    char::decode_utf16(units)
        .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Supported image extensions for scanning.
const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "tif", "tiff"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Recursively scans a directory for supported image files, sorted by
/// path.
pub fn scan_directory(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .max_open(32)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_supported_image(path))
        .collect();
    paths.sort();
    paths
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::types::TagSource;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::{Cursor, Write};

    fn zlib(payload: &str) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(payload.as_bytes())
            .expect("failed to write zlib payload");
        encoder.finish().expect("failed to finish zlib payload")
    }

    fn value<'a>(tags: &'a TagMap, key: &str) -> Option<&'a str> {
        tags.get(key).map(|tag| tag.value.as_str())
    }

    #[test]
    fn test_sniff_formats() {
        assert_eq!(ImageFormat::sniff(&PNG_SIGNATURE), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE1]), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::sniff(b"RIFF\x10\0\0\0WEBPVP8 "), Some(ImageFormat::Webp));
        assert_eq!(ImageFormat::sniff(b"II*\0\x08\0\0\0"), Some(ImageFormat::Tiff));
        assert_eq!(ImageFormat::sniff(b"GIF89a"), None);
        assert_eq!(ImageFormat::Webp.mime(), "image/webp");
    }

    #[test]
    fn test_read_png_tags_all_chunk_types() {
        let mut ztxt_data = b"comment\0".to_vec();
        ztxt_data.push(0);
        ztxt_data.extend_from_slice(&zlib("from ztxt"));

        let mut itxt_data = b"description\0".to_vec();
        itxt_data.extend_from_slice(&[1, 0, 0, 0]);
        itxt_data.extend_from_slice(&zlib("from itxt"));

        let mut plain_itxt = b"fooocus_scheme\0".to_vec();
        plain_itxt.extend_from_slice(&[0, 0, 0, 0]);
        plain_itxt.extend_from_slice(b"fooocus");

        let png = build_test_png(vec![
            text_chunk("parameters", "from text"),
            (*b"zTXt", ztxt_data),
            (*b"iTXt", itxt_data),
            (*b"iTXt", plain_itxt),
        ]);

        let tags = read_png_tags(&mut Cursor::new(png)).unwrap();
        assert_eq!(value(&tags, "parameters"), Some("from text"));
        assert_eq!(value(&tags, "comment"), Some("from ztxt"));
        assert_eq!(value(&tags, "description"), Some("from itxt"));
        assert_eq!(value(&tags, "fooocus_scheme"), Some("fooocus"));

        let tag = &tags["parameters"];
        assert_eq!(tag.source, TagSource::PngText);
        assert_eq!(tag.namespace, "PNG/tEXt");
    }

    #[test]
    fn test_read_png_tags_rejects_bad_signature() {
        let err = read_png_tags(&mut Cursor::new(b"not a png at all".to_vec())).unwrap_err();
        assert!(matches!(err, ScanError::InvalidPng(_)));
    }

    #[test]
    fn test_read_png_tags_rejects_oversized_chunk_length() {
        let mut png = build_test_png(Vec::new());
        png.truncate(png.len() - 12); // drop IEND
        png.extend_from_slice(&u32::MAX.to_be_bytes());
        png.extend_from_slice(b"tEXt");
        png.extend_from_slice(b"parameters\0short");

        let err = read_png_tags(&mut Cursor::new(png)).unwrap_err();
        match err {
            ScanError::InvalidPng(message) => {
                assert!(message.contains("truncated tEXt chunk"), "{}", message)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_read_png_tags_with_exif_chunk() {
        let tiff = build_test_tiff(&[(0x0131, 2, b"Fooocus v2.5.5\0")], &[]);
        let png = build_test_png(vec![
            text_chunk("parameters", "{}"),
            (*b"eXIf", tiff),
        ]);

        let tags = read_png_tags(&mut Cursor::new(png)).unwrap();
        assert_eq!(value(&tags, "parameters"), Some("{}"));
        assert_eq!(value(&tags, "Software"), Some("Fooocus v2.5.5"));
        assert_eq!(tags["Software"].source, TagSource::Exif);
    }

    #[test]
    fn test_decode_user_comment() {
        assert_eq!(decode_user_comment(b"ASCII\0\0\0{\"a\": 1}", false), "{\"a\": 1}");
        assert_eq!(decode_user_comment(b"\0\0\0\0\0\0\0\0plain", false), "plain");
        assert_eq!(decode_user_comment(b"no header here", false), "no header here");
        assert_eq!(decode_user_comment(b"tiny", true), "tiny");

        let mut utf16_be = b"UNICODE\0".to_vec();
        utf16_be.extend("Prompt".encode_utf16().flat_map(u16::to_be_bytes));
        assert_eq!(decode_user_comment(&utf16_be, false), "Prompt");

        let mut utf16_le = b"UNICODE\0".to_vec();
        utf16_le.extend("Prompt".encode_utf16().flat_map(u16::to_le_bytes));
        assert_eq!(decode_user_comment(&utf16_le, true), "Prompt");

        let mut with_bom = b"UNICODE\0\xFF\xFE".to_vec();
        with_bom.extend("Prompt".encode_utf16().flat_map(u16::to_le_bytes));
        assert_eq!(decode_user_comment(&with_bom, false), "Prompt");
    }

    #[test]
    fn test_context_from_png_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-03-18_21-05-09_6789.png");
        let png = build_test_png(vec![
            text_chunk("fooocus_scheme", "fooocus"),
            text_chunk("parameters", "{\"version\": \"Fooocus v2.5.5\"}"),
        ]);
        fs::write(&path, png).unwrap();

        let ctx = context_from_file(&path).unwrap();
        assert_eq!(ctx.mime.as_deref(), Some("image/png"));
        assert_eq!(ctx.filepath.as_deref(), Some(path.as_path()));
        assert_eq!(ctx.tag("fooocus_scheme"), Some("fooocus"));
    }

    #[test]
    fn test_context_from_reader_has_no_path() {
        let png = build_test_png(vec![text_chunk("Comment", "{}")]);
        let mut reader = std::io::BufReader::new(Cursor::new(png));

        let ctx = context_from_reader(&mut reader).unwrap();
        assert_eq!(ctx.mime.as_deref(), Some("image/png"));
        assert_eq!(ctx.filepath, None);
        assert_eq!(ctx.tag("Comment"), Some("{}"));

        assert!(matches!(
            context_from_reader(&mut Cursor::new(b"GIF89a....".to_vec())),
            Err(ScanError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_context_from_tiff_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.tif");
        let tiff = build_test_tiff(
            &[(0x0131, 2, b"FooocusPlus 1.0.0\0")],
            &[
                (0x927C, 7, b"fooocus"),
                (0x9286, 7, b"ASCII\0\0\0{\"Prompt\": \"A sunflower field\"}"),
            ],
        );
        fs::write(&path, tiff).unwrap();

        let ctx = context_from_file(&path).unwrap();
        assert_eq!(ctx.mime.as_deref(), Some("image/tiff"));
        assert_eq!(ctx.tag("Software"), Some("FooocusPlus 1.0.0"));
        assert_eq!(ctx.tag("MakerNote"), Some("fooocus"));
        assert_eq!(ctx.tag("UserComment"), Some("{\"Prompt\": \"A sunflower field\"}"));
        assert_eq!(ctx.embedded["UserComment"].namespace, EXIF_NAMESPACE);
    }

    #[test]
    fn test_context_from_unsupported_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.png");
        fs::write(&path, "just text").unwrap();
        assert!(matches!(
            context_from_file(&path),
            Err(ScanError::UnsupportedFormat(_))
        ));

        assert!(matches!(
            context_from_file(&dir.path().join("missing.png")),
            Err(ScanError::Io { .. })
        ));
    }

    #[test]
    fn test_scan_directory_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        for name in ["b.png", "a.JPG", "log.html", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::write(nested.join("c.webp"), b"x").unwrap();

        let found = scan_directory(dir.path());
        assert_eq!(
            found,
            vec![
                dir.path().join("a.JPG"),
                dir.path().join("b.png"),
                nested.join("c.webp"),
            ]
        );
    }
}
