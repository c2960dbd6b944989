//! Embeds generation metadata into PNG text chunks, in the layout each tool
//! writes and [`crate::scanner::read_png_tags`] reads back.
//!
//! New chunks go right after `IHDR`. Existing text chunks with the same
//! keyword are dropped; every other chunk is copied through untouched.

use crate::error::WriteError;
use crate::scanner::PNG_SIGNATURE;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use std::io::{Cursor, Read, Write};

const MAX_KEYWORD_LEN: usize = 79;

/// Writes one tool's record as PNG text chunks.
pub trait MetadataWriter {
    type Metadata;

    /// Keyword/value pairs that carry `metadata`, in write order.
    fn text_values(
        &self,
        metadata: &Self::Metadata,
    ) -> Result<Vec<(&'static str, String)>, WriteError>;

    /// Writes a blank 1x1 PNG carrying `metadata`.
    fn write<W: Write>(&self, target: W, metadata: &Self::Metadata) -> Result<(), WriteError> {
        let template = blank_png()?;
        self.copy_write(template.as_slice(), target, metadata)
    }

    /// Copies the PNG read from `source` to `target` with `metadata`
    /// embedded.
    fn copy_write<R: Read, W: Write>(
        &self,
        mut source: R,
        mut target: W,
        metadata: &Self::Metadata,
    ) -> Result<(), WriteError> {
        let values = self.text_values(metadata)?;
        let mut png = Vec::new();
        source.read_to_end(&mut png)?;

        let embedded = embed_text_chunks(&png, &values)?;
        log::debug!(
            "Embedded {} text chunks ({} bytes)",
            values.len(),
            embedded.len()
        );
        target.write_all(&embedded)?;
        Ok(())
    }
}

struct Chunk {
    kind: [u8; 4],
    data: Vec<u8>,
}

impl Chunk {
    fn is_text(&self) -> bool {
        matches!(&self.kind, b"tEXt" | b"zTXt" | b"iTXt")
    }

    fn keyword(&self) -> &[u8] {
        self.data.split(|byte| *byte == 0).next().unwrap_or_default()
    }

    fn write_to(&self, out: &mut Vec<u8>) -> Result<(), WriteError> {
        let mut crc = Crc::new();
        crc.update(&self.kind);
        crc.update(&self.data);

        out.write_u32::<BigEndian>(self.data.len() as u32)?;
        out.extend_from_slice(&self.kind);
        out.extend_from_slice(&self.data);
        out.write_u32::<BigEndian>(crc.sum())?;
        Ok(())
    }
}

/// ASCII values become `tEXt`; anything else goes into an uncompressed
/// `iTXt`, which is defined as UTF-8.
fn text_chunk(keyword: &str, value: &str) -> Result<Chunk, WriteError> {
    let printable = keyword.bytes().all(|byte| (32..=126).contains(&byte));
    if keyword.is_empty() || keyword.len() > MAX_KEYWORD_LEN || !printable {
        return Err(WriteError::InvalidKeyword(keyword.to_string()));
    }

    let mut data = keyword.as_bytes().to_vec();
    data.push(0);
    if value.is_ascii() {
        data.extend_from_slice(value.as_bytes());
        return Ok(Chunk {
            kind: *b"tEXt",
            data,
        });
    }

    // compression flag, compression method, empty language, empty translation
    data.extend_from_slice(&[0, 0, 0, 0]);
    data.extend_from_slice(value.as_bytes());
    Ok(Chunk {
        kind: *b"iTXt",
        data,
    })
}

fn read_chunks(png: &[u8]) -> Result<Vec<Chunk>, WriteError> {
    let body = png
        .strip_prefix(&PNG_SIGNATURE[..])
        .ok_or_else(|| WriteError::InvalidPng("bad signature".to_string()))?;
    let truncated = || WriteError::InvalidPng("truncated chunk".to_string());

    let mut cursor = Cursor::new(body);
    let mut chunks = Vec::new();
    while (cursor.position() as usize) < body.len() {
        let length = cursor.read_u32::<BigEndian>().map_err(|_| truncated())? as usize;
        let mut kind = [0u8; 4];
        cursor.read_exact(&mut kind).map_err(|_| truncated())?;

        let start = cursor.position() as usize;
        let end = start
            .checked_add(length)
            .filter(|end| end.saturating_add(4) <= body.len())
            .ok_or_else(truncated)?;
        cursor.set_position((end + 4) as u64); // skip CRC

        let is_end = &kind == b"IEND";
        chunks.push(Chunk {
            kind,
            data: body[start..end].to_vec(),
        });
        if is_end {
            break;
        }
    }
    Ok(chunks)
}

/// Returns `png` with one text chunk per `(keyword, value)` pair.
pub fn embed_text_chunks(png: &[u8], values: &[(&str, String)]) -> Result<Vec<u8>, WriteError> {
    let new_chunks = values
        .iter()
        .map(|(keyword, value)| text_chunk(keyword, value))
        .collect::<Result<Vec<_>, _>>()?;

    let chunks = read_chunks(png)?;
    if chunks.first().map(|chunk| &chunk.kind) != Some(b"IHDR") {
        return Err(WriteError::InvalidPng("IHDR is not the first chunk".to_string()));
    }

    let mut out = PNG_SIGNATURE.to_vec();
    for chunk in &chunks {
        let replaced = values
            .iter()
            .any(|(keyword, _)| keyword.as_bytes() == chunk.keyword());
        if chunk.is_text() && replaced {
            log::debug!(
                "Replacing text chunk {}",
                String::from_utf8_lossy(chunk.keyword())
            );
            continue;
        }

        chunk.write_to(&mut out)?;
        if &chunk.kind == b"IHDR" {
            for text in &new_chunks {
                text.write_to(&mut out)?;
            }
        }
    }
    Ok(out)
}

/// A 1x1 black RGB image, the canvas used when there is no source PNG.
pub fn blank_png() -> Result<Vec<u8>, WriteError> {
    let mut header = Vec::with_capacity(13);
    header.write_u32::<BigEndian>(1)?; // width
    header.write_u32::<BigEndian>(1)?; // height
    header.extend_from_slice(&[8, 2, 0, 0, 0]); // 8-bit RGB, deflate, no interlace

    // One scanline: filter byte, then one RGB pixel.
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&[0, 0, 0, 0])?;
    let pixels = encoder.finish()?;

    let mut out = PNG_SIGNATURE.to_vec();
    for (kind, data) in [(*b"IHDR", header), (*b"IDAT", pixels), (*b"IEND", Vec::new())] {
        Chunk { kind, data }.write_to(&mut out)?;
    }
    Ok(out)
}
