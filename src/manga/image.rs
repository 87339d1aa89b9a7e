//! Image header decoding
//!
//! Reads just enough of an image to learn its format and dimensions.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("unknown image format")]
    UnknownFormat,

    #[error("truncated {0} header")]
    Truncated(ImageFormat),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Tiff,
    Webp,
}

impl ImageFormat {
    /// File extension used for downloaded pages
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Tiff => "tiff",
            ImageFormat::Webp => "webp",
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

fn be_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(buf.get(at..at + 2)?.try_into().ok()?))
}

fn le_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(at..at + 2)?.try_into().ok()?))
}

fn be_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn le_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn le_u24(buf: &[u8], at: usize) -> Option<u32> {
    let b = buf.get(at..at + 3)?;
    Some(u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16)
}

pub fn detect_format(buf: &[u8]) -> Option<ImageFormat> {
    if buf.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageFormat::Jpeg)
    } else if buf.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(ImageFormat::Png)
    } else if buf.starts_with(b"GIF87a") || buf.starts_with(b"GIF89a") {
        Some(ImageFormat::Gif)
    } else if buf.starts_with(b"BM") {
        Some(ImageFormat::Bmp)
    } else if buf.starts_with(b"II*\0") || buf.starts_with(b"MM\0*") {
        Some(ImageFormat::Tiff)
    } else if buf.len() >= 12 && &buf[..4] == b"RIFF" && &buf[8..12] == b"WEBP" {
        Some(ImageFormat::Webp)
    } else {
        None
    }
}

/// Decode the format and dimensions of an encoded image.
pub fn decode_config(buf: &[u8]) -> Result<ImageInfo, ImageError> {
    let format = detect_format(buf).ok_or(ImageError::UnknownFormat)?;
    let dims = match format {
        ImageFormat::Jpeg => jpeg_size(buf),
        ImageFormat::Png => png_size(buf),
        ImageFormat::Gif => gif_size(buf),
        ImageFormat::Bmp => bmp_size(buf),
        ImageFormat::Tiff => tiff_size(buf),
        ImageFormat::Webp => webp_size(buf),
    };
    let (width, height) = dims.ok_or(ImageError::Truncated(format))?;
    Ok(ImageInfo {
        format,
        width,
        height,
    })
}

fn png_size(buf: &[u8]) -> Option<(u32, u32)> {
    if buf.get(12..16)? != b"IHDR" {
        return None;
    }
    Some((be_u32(buf, 16)?, be_u32(buf, 20)?))
}

fn gif_size(buf: &[u8]) -> Option<(u32, u32)> {
    Some((le_u16(buf, 6)?.into(), le_u16(buf, 8)?.into()))
}

fn bmp_size(buf: &[u8]) -> Option<(u32, u32)> {
    let header_size = le_u32(buf, 14)?;
    if header_size == 12 {
        return Some((le_u16(buf, 18)?.into(), le_u16(buf, 20)?.into()));
    }
    let width = le_u32(buf, 18)? as i32;
    // Negative height marks a top-down bitmap
    let height = le_u32(buf, 22)? as i32;
    Some((width.unsigned_abs(), height.unsigned_abs()))
}

fn jpeg_size(buf: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    loop {
        while *buf.get(i)? != 0xFF {
            i += 1;
        }
        while *buf.get(i)? == 0xFF {
            i += 1;
        }
        let marker = *buf.get(i)?;
        i += 1;

        match marker {
            0xD0..=0xD9 | 0x01 => continue,
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                let height = be_u16(buf, i + 3)?;
                let width = be_u16(buf, i + 5)?;
                return Some((width.into(), height.into()));
            }
            _ => {
                let len = be_u16(buf, i)? as usize;
                i += len;
            }
        }
    }
}

fn webp_size(buf: &[u8]) -> Option<(u32, u32)> {
    match buf.get(12..16)? {
        b"VP8 " => {
            if buf.get(23..26)? != [0x9D, 0x01, 0x2A] {
                return None;
            }
            let width = le_u16(buf, 26)? & 0x3FFF;
            let height = le_u16(buf, 28)? & 0x3FFF;
            Some((width.into(), height.into()))
        }
        b"VP8L" => {
            if *buf.get(20)? != 0x2F {
                return None;
            }
            let bits = le_u32(buf, 21)?;
            Some(((bits & 0x3FFF) + 1, ((bits >> 14) & 0x3FFF) + 1))
        }
        b"VP8X" => Some((le_u24(buf, 24)? + 1, le_u24(buf, 27)? + 1)),
        _ => None,
    }
}

fn tiff_size(buf: &[u8]) -> Option<(u32, u32)> {
    let little = buf.starts_with(b"II");
    let u16_at = |at| if little { le_u16(buf, at) } else { be_u16(buf, at) };
    let u32_at = |at| if little { le_u32(buf, at) } else { be_u32(buf, at) };

    let ifd = u32_at(4)? as usize;
    let count = u16_at(ifd)? as usize;
    let mut width = None;
    let mut height = None;

    for n in 0..count {
        let entry = ifd + 2 + n * 12;
        let tag = u16_at(entry)?;
        let kind = u16_at(entry + 2)?;
        let value = match kind {
            3 => u32::from(u16_at(entry + 8)?),
            4 => u32_at(entry + 8)?,
            _ => continue,
        };
        match tag {
            256 => width = Some(value),
            257 => height = Some(value),
            _ => {}
        }
        if width.is_some() && height.is_some() {
            break;
        }
    }

    Some((width?, height?))
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Minimal PNG header for a `width` x `height` image
    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = b"\x89PNG\r\n\x1a\n".to_vec();
        buf.extend_from_slice(&13u32.to_be_bytes());
        buf.extend_from_slice(b"IHDR");
        buf.extend_from_slice(&width.to_be_bytes());
        buf.extend_from_slice(&height.to_be_bytes());
        buf.extend_from_slice(&[8, 6, 0, 0, 0]);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_png() {
        let info = decode_config(&fixtures::png(800, 1200)).unwrap();
        assert_eq!(info.format, ImageFormat::Png);
        assert_eq!((info.width, info.height), (800, 1200));
    }

    #[test]
    fn test_gif() {
        let mut buf = b"GIF89a".to_vec();
        buf.extend_from_slice(&320u16.to_le_bytes());
        buf.extend_from_slice(&240u16.to_le_bytes());
        let info = decode_config(&buf).unwrap();
        assert_eq!(info.format, ImageFormat::Gif);
        assert_eq!((info.width, info.height), (320, 240));
    }

    #[test]
    fn test_jpeg_skips_segments() {
        let mut buf = vec![0xFF, 0xD8];
        // APP0 segment, length 16
        buf.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        buf.extend_from_slice(&[0; 14]);
        // SOF0: length, precision, height, width
        buf.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        buf.extend_from_slice(&1080u16.to_be_bytes());
        buf.extend_from_slice(&720u16.to_be_bytes());

        let info = decode_config(&buf).unwrap();
        assert_eq!(info.format, ImageFormat::Jpeg);
        assert_eq!((info.width, info.height), (720, 1080));
        assert_eq!(info.format.extension(), "jpeg");
    }

    #[test]
    fn test_bmp_top_down() {
        let mut buf = b"BM".to_vec();
        buf.extend_from_slice(&[0; 12]);
        buf.extend_from_slice(&40u32.to_le_bytes());
        buf.extend_from_slice(&640i32.to_le_bytes());
        buf.extend_from_slice(&(-480i32).to_le_bytes());
        let info = decode_config(&buf).unwrap();
        assert_eq!((info.width, info.height), (640, 480));
    }

    #[test]
    fn test_webp_lossless() {
        let mut buf = b"RIFF".to_vec();
        buf.extend_from_slice(&[0; 4]);
        buf.extend_from_slice(b"WEBPVP8L");
        buf.extend_from_slice(&[0; 4]);
        buf.push(0x2F);
        let bits: u32 = (100 - 1) | ((50 - 1) << 14);
        buf.extend_from_slice(&bits.to_le_bytes());

        let info = decode_config(&buf).unwrap();
        assert_eq!(info.format, ImageFormat::Webp);
        assert_eq!((info.width, info.height), (100, 50));
    }

    #[test]
    fn test_tiff() {
        let mut buf = b"II*\0".to_vec();
        buf.extend_from_slice(&8u32.to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        // width, SHORT
        buf.extend_from_slice(&256u16.to_le_bytes());
        buf.extend_from_slice(&3u16.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&[0x20, 0x03, 0, 0]);
        // height, LONG
        buf.extend_from_slice(&257u16.to_le_bytes());
        buf.extend_from_slice(&4u16.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&600u32.to_le_bytes());

        let info = decode_config(&buf).unwrap();
        assert_eq!(info.format, ImageFormat::Tiff);
        assert_eq!((info.width, info.height), (800, 600));
    }

    #[test]
    fn test_unknown_and_truncated() {
        assert_eq!(decode_config(b"hello"), Err(ImageError::UnknownFormat));
        assert_eq!(
            decode_config(b"\x89PNG\r\n\x1a\n"),
            Err(ImageError::Truncated(ImageFormat::Png))
        );
    }
}
