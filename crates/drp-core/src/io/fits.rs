//! Minimal FITS codec for single-HDU 2-D images.
//!
//! Reads `BITPIX` 8/16/32/-32/-64 with `BZERO`/`BSCALE` scaling and always
//! writes `BITPIX = -32`. Keys longer than eight characters use the
//! `HIERARCH` convention, long strings use `CONTINUE` cards.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use memmap2::Mmap;
use ndarray::Array2;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::consts::{BASE_NAME_KEY, FITS_BLOCK_SIZE, FITS_CARD_SIZE, RAW_IMG_KEY};
use crate::data::{Header, HeaderValue, Image};
use crate::error::{DrpError, Result};

/// Keys describing the data layout. They are derived from the payload on
/// write and never stored in a [`Header`].
const STRUCTURAL_KEYS: &[&str] = &[
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "EXTEND", "BZERO", "BSCALE", "PCOUNT",
    "GCOUNT", "END",
];

/// Layout of the primary HDU.
#[derive(Clone, Debug)]
pub struct FitsLayout {
    pub bitpix: i64,
    pub width: usize,
    pub height: usize,
    pub bzero: f64,
    pub bscale: f64,
    /// Byte offset of the data unit.
    pub data_offset: usize,
}

impl FitsLayout {
    pub fn bytes_per_value(&self) -> usize {
        (self.bitpix.unsigned_abs() / 8) as usize
    }

    /// Offset one past the last data byte (without padding). Fails when a
    /// corrupt NAXIS header makes the size unrepresentable.
    pub fn data_end(&self) -> Result<usize> {
        self.width
            .checked_mul(self.height)
            .and_then(|n| n.checked_mul(self.bytes_per_value()))
            .and_then(|n| n.checked_add(self.data_offset))
            .ok_or_else(|| {
                DrpError::Fits(format!(
                    "data unit of {}x{} values at BITPIX {} overflows",
                    self.width, self.height, self.bitpix
                ))
            })
    }
}

enum Card {
    End,
    Value(String, HeaderValue),
    Continue(String),
    Skip,
}

/// Read the primary header and image data of a FITS file.
pub fn read_fits(path: &Path) -> Result<(Header, Array2<f32>)> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let (header, layout) = parse_primary(&mmap)?;

    let data_end = layout.data_end()?;
    if mmap.len() < data_end {
        return Err(DrpError::Fits(format!(
            "{}: data truncated, expected {} bytes, got {}",
            path.display(),
            data_end,
            mmap.len()
        )));
    }
    let raw = &mmap[layout.data_offset..data_end];
    let values = decode(raw, &layout)?;
    let data = Array2::from_shape_vec((layout.height, layout.width), values)
        .map_err(|e| DrpError::Fits(e.to_string()))?;
    debug!(path = %path.display(), width = layout.width, height = layout.height, "Read FITS image");
    Ok((header, data))
}

/// Read only the header and layout, e.g. for inspection.
pub fn read_header(path: &Path) -> Result<(Header, FitsLayout)> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    parse_primary(&mmap)
}

/// Load an [`Image`], filling `BASENAME` with the file name and `RAWPATH`
/// with the source path when the header lacks them.
pub fn open_image(path: &Path) -> Result<Image> {
    let (mut header, data) = read_fits(path)?;
    if !header.contains_key(BASE_NAME_KEY) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DrpError::Fits(format!("{} has no file name", path.display())))?;
        header.insert(BASE_NAME_KEY, name);
    }
    if !header.contains_key(RAW_IMG_KEY) {
        header.insert(RAW_IMG_KEY, path.display().to_string());
    }
    Image::new(data, header)
}

/// Whether the file holds a complete header and data unit. Files still
/// being written report `false`.
pub fn is_complete(path: &Path) -> Result<bool> {
    let len = fs::metadata(path)?.len() as usize;
    if len < FITS_BLOCK_SIZE {
        return Ok(false);
    }
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    if find_end_card(&mmap).is_none() {
        return Ok(false);
    }
    let (_, layout) = parse_primary(&mmap)?;
    Ok(mmap.len() >= layout.data_end()?)
}

/// Write `image` as a single-HDU FITS file with `BITPIX = -32`.
pub fn write_image(image: &Image, path: &Path) -> Result<()> {
    let data = image.data()?;
    let header = image.header_for_write();
    let (h, w) = data.dim();

    let mut cards = vec![
        fixed_card("SIMPLE", &HeaderValue::Bool(true)),
        fixed_card("BITPIX", &HeaderValue::Int(-32)),
        fixed_card("NAXIS", &HeaderValue::Int(2)),
        fixed_card("NAXIS1", &HeaderValue::Int(w as i64)),
        fixed_card("NAXIS2", &HeaderValue::Int(h as i64)),
        fixed_card("EXTEND", &HeaderValue::Bool(true)),
    ];
    for (key, value) in header.iter() {
        if STRUCTURAL_KEYS.contains(&key.as_str()) {
            continue;
        }
        cards.extend(format_cards(key, value));
    }
    cards.push(pad_card("END".to_string()));

    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    for card in &cards {
        out.write_all(card.as_bytes())?;
    }
    let header_len = cards.len() * FITS_CARD_SIZE;
    write_padding(&mut out, header_len, b' ')?;

    for v in data.iter() {
        out.write_f32::<BigEndian>(*v)?;
    }
    write_padding(&mut out, h * w * 4, 0)?;
    out.flush()?;
    Ok(())
}

/// Write through a temporary sibling then rename, so readers never observe
/// a partially written file.
pub fn write_image_atomic(image: &Image, path: &Path) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp: PathBuf = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    if let Err(e) = write_image(image, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_padding(out: &mut impl Write, written: usize, byte: u8) -> Result<()> {
    let rem = written % FITS_BLOCK_SIZE;
    if rem != 0 {
        out.write_all(&vec![byte; FITS_BLOCK_SIZE - rem])?;
    }
    Ok(())
}

fn find_end_card(bytes: &[u8]) -> Option<usize> {
    bytes
        .chunks_exact(FITS_CARD_SIZE)
        .position(|c| c.starts_with(b"END") && c[3..].iter().all(|b| *b == b' '))
}

fn parse_primary(bytes: &[u8]) -> Result<(Header, FitsLayout)> {
    if !bytes.starts_with(b"SIMPLE") {
        return Err(DrpError::Fits("missing SIMPLE card".into()));
    }
    let end = find_end_card(bytes).ok_or_else(|| DrpError::Fits("header has no END card".into()))?;

    let mut all: Vec<(String, HeaderValue)> = Vec::new();
    for chunk in bytes.chunks_exact(FITS_CARD_SIZE).take(end + 1) {
        let text = String::from_utf8_lossy(chunk);
        match parse_card(&text) {
            Card::End => break,
            Card::Value(k, v) => all.push((k, v)),
            Card::Continue(more) => match all.last_mut() {
                Some((_, HeaderValue::Str(s))) if s.ends_with('&') => {
                    s.pop();
                    s.push_str(&more);
                }
                _ => warn!("CONTINUE card without a preceding long string"),
            },
            Card::Skip => {}
        }
    }

    let int = |key: &str| -> Result<i64> {
        all.iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_i64())
            .ok_or_else(|| DrpError::Fits(format!("missing or invalid {key}")))
    };
    let float = |key: &str, default: f64| -> f64 {
        all.iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_f64())
            .unwrap_or(default)
    };

    let bitpix = int("BITPIX")?;
    if !matches!(bitpix, 8 | 16 | 32 | -32 | -64) {
        return Err(DrpError::Fits(format!("unsupported BITPIX {bitpix}")));
    }
    let naxis = int("NAXIS")?;
    if naxis != 2 {
        return Err(DrpError::Fits(format!(
            "expected a 2-D primary image, found NAXIS = {naxis}"
        )));
    }
    let width = usize::try_from(int("NAXIS1")?).map_err(|e| DrpError::Fits(e.to_string()))?;
    let height = usize::try_from(int("NAXIS2")?).map_err(|e| DrpError::Fits(e.to_string()))?;

    let header_bytes = (end + 1) * FITS_CARD_SIZE;
    let data_offset = header_bytes.div_ceil(FITS_BLOCK_SIZE) * FITS_BLOCK_SIZE;
    let layout = FitsLayout {
        bitpix,
        width,
        height,
        bzero: float("BZERO", 0.0),
        bscale: float("BSCALE", 1.0),
        data_offset,
    };

    let header = all
        .into_iter()
        .filter(|(k, _)| !STRUCTURAL_KEYS.contains(&k.as_str()))
        .collect();
    Ok((header, layout))
}

fn decode(raw: &[u8], layout: &FitsLayout) -> Result<Vec<f32>> {
    let (zero, scale) = (layout.bzero, layout.bscale);
    let scaled = |v: f64| (v * scale + zero) as f32;
    let values = match layout.bitpix {
        8 => raw.iter().map(|b| scaled(f64::from(*b))).collect(),
        16 => raw
            .chunks_exact(2)
            .map(|c| scaled(f64::from(BigEndian::read_i16(c))))
            .collect(),
        32 => raw
            .chunks_exact(4)
            .map(|c| scaled(f64::from(BigEndian::read_i32(c))))
            .collect(),
        -32 => raw
            .chunks_exact(4)
            .map(|c| scaled(f64::from(BigEndian::read_f32(c))))
            .collect(),
        -64 => raw
            .chunks_exact(8)
            .map(|c| scaled(BigEndian::read_f64(c)))
            .collect(),
        other => return Err(DrpError::Fits(format!("unsupported BITPIX {other}"))),
    };
    Ok(values)
}

fn parse_card(card: &str) -> Card {
    let keyword = card.get(..8).unwrap_or(card).trim_end();
    match keyword {
        "END" => Card::End,
        "" | "COMMENT" | "HISTORY" => Card::Skip,
        "CONTINUE" => match parse_value(card.get(8..).unwrap_or("")) {
            HeaderValue::Str(s) => Card::Continue(s),
            _ => Card::Skip,
        },
        "HIERARCH" => match card.get(9..).and_then(|rest| rest.split_once('=')) {
            Some((key, value)) => Card::Value(key.trim().to_string(), parse_value(value)),
            None => Card::Skip,
        },
        _ if card.get(8..10) == Some("= ") => {
            Card::Value(keyword.to_string(), parse_value(card.get(10..).unwrap_or("")))
        }
        _ => Card::Skip,
    }
}

fn parse_value(text: &str) -> HeaderValue {
    let text = text.trim_start();
    if let Some(rest) = text.strip_prefix('\'') {
        let mut out = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push('\'');
                } else {
                    break;
                }
            } else {
                out.push(c);
            }
        }
        return HeaderValue::Str(out.trim_end().to_string());
    }

    let value = text.split('/').next().unwrap_or("").trim();
    match value {
        "T" => HeaderValue::Bool(true),
        "F" => HeaderValue::Bool(false),
        _ => {
            if let Ok(i) = value.parse::<i64>() {
                HeaderValue::Int(i)
            } else if let Ok(f) = value.replace('D', "E").parse::<f64>() {
                HeaderValue::Float(f)
            } else {
                HeaderValue::Str(value.to_string())
            }
        }
    }
}

fn is_standard_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 8
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn pad_card(mut card: String) -> String {
    if card.len() > FITS_CARD_SIZE {
        card.truncate(FITS_CARD_SIZE);
    }
    format!("{card:<width$}", width = FITS_CARD_SIZE)
}

fn fixed_card(key: &str, value: &HeaderValue) -> String {
    pad_card(format!("{key:<8}= {}", format_scalar(value)))
}

fn format_scalar(value: &HeaderValue) -> String {
    match value {
        HeaderValue::Bool(b) => format!("{:>20}", if *b { "T" } else { "F" }),
        HeaderValue::Int(i) => format!("{i:>20}"),
        HeaderValue::Float(f) => format!("{:>20}", format!("{f:?}").to_uppercase()),
        HeaderValue::Str(s) => format!("'{:<8}'", s.replace('\'', "''")),
    }
}

/// Format one header entry as one or more 80-character cards.
fn format_cards(key: &str, value: &HeaderValue) -> Vec<String> {
    let prefix = if is_standard_key(key) {
        format!("{key:<8}= ")
    } else {
        format!("HIERARCH {key} = ")
    };

    if let HeaderValue::Float(f) = value {
        if !f.is_finite() {
            warn!(key, "Skipping non-finite header value");
            return Vec::new();
        }
    }

    let HeaderValue::Str(s) = value else {
        return vec![pad_card(format!("{prefix}{}", format_scalar(value)))];
    };

    let escaped_len = s.len() + s.matches('\'').count();
    if prefix.len() + escaped_len + 2 <= FITS_CARD_SIZE {
        return vec![pad_card(format!("{prefix}{}", format_scalar(value)))];
    }

    // Long string: first card plus CONTINUE cards, each chunk ending in '&'
    // except the last.
    let first_room = FITS_CARD_SIZE.saturating_sub(prefix.len() + 3);
    let continue_room = FITS_CARD_SIZE - "CONTINUE  ''&".len();
    if first_room < 2 {
        warn!(key, "Header key too long for a string value, skipping");
        return Vec::new();
    }

    let chars: Vec<char> = s.chars().collect();
    let mut chunks: Vec<String> = Vec::new();
    let mut start = 0;
    let mut room = first_room;
    while start < chars.len() {
        let mut taken = 0;
        let mut chunk = String::new();
        while start + taken < chars.len() {
            let c = chars[start + taken];
            let cost = if c == '\'' { 2 } else { 1 };
            if chunk.len() + cost > room {
                break;
            }
            if c == '\'' {
                chunk.push_str("''");
            } else {
                chunk.push(c);
            }
            taken += 1;
        }
        chunks.push(chunk);
        start += taken.max(1);
        room = continue_room;
    }

    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let amp = if i == last { "" } else { "&" };
            if i == 0 {
                pad_card(format!("{prefix}'{chunk}{amp}'"))
            } else {
                pad_card(format!("CONTINUE  '{chunk}{amp}'"))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_cards() {
        assert!(matches!(
            parse_card(&pad_card("EXPTIME =                 30.5 / seconds".into())),
            Card::Value(ref k, HeaderValue::Float(v)) if k == "EXPTIME" && v == 30.5
        ));
        assert!(matches!(
            parse_card(&pad_card("OBJECT  = 'M31 ''core'''".into())),
            Card::Value(_, HeaderValue::Str(ref s)) if s == "M31 'core'"
        ));
        assert!(matches!(
            parse_card(&pad_card("HIERARCH lowercase key = 7".into())),
            Card::Value(ref k, HeaderValue::Int(7)) if k == "lowercase key"
        ));
        assert!(matches!(parse_card(&pad_card("COMMENT hi".into())), Card::Skip));
    }

    #[test]
    fn long_strings_use_continue_cards() {
        let long = "x".repeat(150);
        let cards = format_cards("RAWPATH", &HeaderValue::Str(long));
        assert!(cards.len() > 2);
        assert!(cards.iter().all(|c| c.len() == FITS_CARD_SIZE));
        assert!(cards[1].starts_with("CONTINUE"));
    }

    #[test]
    fn short_keys_are_standard() {
        assert!(is_standard_key("NAXIS1"));
        assert!(!is_standard_key("exptime"));
        assert!(!is_standard_key("LONGERKEY9"));
    }
}
