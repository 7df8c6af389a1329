//! Image encoding: `DynamicImage` → PNG bytes, PNG bytes → base64.
//!
//! PNG is lossless. JPEG artefacts around glyphs confuse vision models, and
//! text crispness matters far more than file size for OCR accuracy.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// MIME type of every page image this crate writes.
pub const PNG_MIME: &str = "image/png";

/// Encode a rasterised page as PNG bytes, ready to be written to disk.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} page → {} bytes PNG",
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(buf)
}

/// Base64-encode image bytes for inline (data-URI style) API payloads.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let png = encode_png(&img).expect("encode should succeed");
        assert_eq!(&png[1..4], b"PNG");

        let b64 = to_base64(&png);
        let decoded = STANDARD.decode(&b64).expect("valid base64");
        assert_eq!(decoded, png);
    }
}
