// src/pnm.rs - Binary PNM raster codec for pattern transfer
use thiserror::Error;

use crate::pattern::{Pattern, PatternError, Rgb};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("not a binary PNM file (expected P4, P5 or P6 magic)")]
    BadMagic,
    #[error("malformed PNM header: {0}")]
    BadHeader(&'static str),
    #[error("unsupported PNM variant: {0}")]
    Unsupported(&'static str),
    #[error("pixel data shorter than the header promises")]
    Truncated,
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Bitmap,
    Graymap,
    Pixmap,
}

struct Header {
    format: Format,
    width: u32,
    height: u32,
    maxval: u32,
    data_start: usize,
}

/// Decodes a binary PNM image into a pattern, placing the image at
/// `(offset_x, offset_y)` inside the new raster. White pixels (and
/// zero bits of a P4 bitmap) become the transparent background.
pub fn decode(data: &[u8], offset_x: u32, offset_y: u32) -> Result<Pattern, CodecError> {
    let header = parse_header(data)?;
    let width = offset_x
        .checked_add(header.width)
        .ok_or(CodecError::BadHeader("image width overflows"))?;
    let height = offset_y
        .checked_add(header.height)
        .ok_or(CodecError::BadHeader("image height overflows"))?;
    let mut pattern = Pattern::new(width, height)?;
    let data = &data[header.data_start..];

    match header.format {
        Format::Bitmap => decode_bitmap(&header, data, &mut pattern, offset_x, offset_y)?,
        Format::Graymap => decode_graymap(&header, data, &mut pattern, offset_x, offset_y)?,
        Format::Pixmap => decode_pixmap(&header, data, &mut pattern, offset_x, offset_y)?,
    }

    pattern.update_min_max();
    Ok(pattern)
}

/// Encodes a pattern back to PNM. Raw mode emits a P5 graymap of the
/// palette indices themselves; display mode emits a P6 pixmap through
/// the palette with index 0 rendered white.
pub fn encode(pattern: &Pattern, raw: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if raw {
        out.extend_from_slice(format!("P5\n{} {}\n255\n", pattern.width(), pattern.height()).as_bytes());
        for y in 0..pattern.height() as i32 {
            for x in 0..pattern.width() as i32 {
                out.push(pattern.color_at(x, y));
            }
        }
    } else {
        out.extend_from_slice(format!("P6\n{} {}\n255\n", pattern.width(), pattern.height()).as_bytes());
        for y in 0..pattern.height() as i32 {
            for x in 0..pattern.width() as i32 {
                let color = match pattern.palette_color(pattern.color_at(x, y)) {
                    Some(color) => color,
                    None => Rgb::WHITE,
                };
                out.extend_from_slice(&[color.r, color.g, color.b]);
            }
        }
    }
    out
}

fn decode_bitmap(
    header: &Header,
    data: &[u8],
    pattern: &mut Pattern,
    offset_x: u32,
    offset_y: u32,
) -> Result<(), CodecError> {
    let row_bytes = header.width.div_ceil(8) as usize;
    if data.len() < row_bytes * header.height as usize {
        return Err(CodecError::Truncated);
    }
    let index = pattern.index_for_color(Rgb::BLACK)?;
    for y in 0..header.height {
        let row = &data[y as usize * row_bytes..];
        for x in 0..header.width {
            let byte = row[(x / 8) as usize];
            // P4 stores the leftmost pixel in the most significant bit;
            // a set bit is black.
            if byte & (0x80 >> (x % 8)) != 0 {
                pattern.set_index(offset_x + x, offset_y + y, index);
            }
        }
    }
    Ok(())
}

fn decode_graymap(
    header: &Header,
    data: &[u8],
    pattern: &mut Pattern,
    offset_x: u32,
    offset_y: u32,
) -> Result<(), CodecError> {
    let pixel_count = (header.width * header.height) as usize;
    if data.len() < pixel_count {
        return Err(CodecError::Truncated);
    }
    for y in 0..header.height {
        for x in 0..header.width {
            let value = data[(y * header.width + x) as usize] as u32;
            if value >= header.maxval {
                continue;
            }
            let level = (value * 255 / header.maxval) as u8;
            let index = pattern.index_for_color(Rgb {
                r: level,
                g: level,
                b: level,
            })?;
            pattern.set_index(offset_x + x, offset_y + y, index);
        }
    }
    Ok(())
}

fn decode_pixmap(
    header: &Header,
    data: &[u8],
    pattern: &mut Pattern,
    offset_x: u32,
    offset_y: u32,
) -> Result<(), CodecError> {
    let pixel_count = (header.width * header.height) as usize;
    if data.len() < pixel_count * 3 {
        return Err(CodecError::Truncated);
    }
    for y in 0..header.height {
        for x in 0..header.width {
            let base = ((y * header.width + x) * 3) as usize;
            let scale = |v: u8| (v as u32 * 255 / header.maxval) as u8;
            let color = Rgb {
                r: scale(data[base]),
                g: scale(data[base + 1]),
                b: scale(data[base + 2]),
            };
            if color == Rgb::WHITE {
                continue;
            }
            let index = pattern.index_for_color(color)?;
            pattern.set_index(offset_x + x, offset_y + y, index);
        }
    }
    Ok(())
}

fn parse_header(data: &[u8]) -> Result<Header, CodecError> {
    if data.len() < 2 || data[0] != b'P' {
        return Err(CodecError::BadMagic);
    }
    let format = match data[1] {
        b'4' => Format::Bitmap,
        b'5' => Format::Graymap,
        b'6' => Format::Pixmap,
        b'1' | b'2' | b'3' => return Err(CodecError::Unsupported("ASCII PNM variants")),
        _ => return Err(CodecError::BadMagic),
    };

    let mut pos = 2;
    let width = read_value(data, &mut pos)?;
    let height = read_value(data, &mut pos)?;
    let maxval = if format == Format::Bitmap {
        1
    } else {
        let maxval = read_value(data, &mut pos)?;
        if maxval == 0 || maxval > 255 {
            return Err(CodecError::Unsupported("maxval outside 1..=255"));
        }
        maxval
    };
    if width == 0 || height == 0 {
        return Err(CodecError::BadHeader("zero image dimension"));
    }

    // Exactly one whitespace byte separates the header from the data.
    if pos >= data.len() || !data[pos].is_ascii_whitespace() {
        return Err(CodecError::BadHeader("missing data separator"));
    }
    pos += 1;

    Ok(Header {
        format,
        width,
        height,
        maxval,
        data_start: pos,
    })
}

fn read_value(data: &[u8], pos: &mut usize) -> Result<u32, CodecError> {
    // Skip whitespace and '#' comments running to end of line.
    loop {
        match data.get(*pos) {
            Some(b) if b.is_ascii_whitespace() => *pos += 1,
            Some(b'#') => {
                while let Some(&b) = data.get(*pos) {
                    *pos += 1;
                    if b == b'\n' {
                        break;
                    }
                }
            }
            Some(_) => break,
            None => return Err(CodecError::BadHeader("unexpected end of header")),
        }
    }
    let start = *pos;
    while let Some(b) = data.get(*pos) {
        if !b.is_ascii_digit() {
            break;
        }
        *pos += 1;
    }
    if *pos == start || *pos - start > 7 {
        return Err(CodecError::BadHeader("expected a decimal value"));
    }
    let text = std::str::from_utf8(&data[start..*pos])
        .map_err(|_| CodecError::BadHeader("expected a decimal value"))?;
    text.parse()
        .map_err(|_| CodecError::BadHeader("expected a decimal value"))
}
