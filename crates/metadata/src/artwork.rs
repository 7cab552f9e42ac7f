use std::io::Cursor;

use image::ImageReader;

pub fn guess_mime(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg".to_string())
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some("image/png".to_string())
    } else {
        None
    }
}

pub fn mime_extension(mime: Option<&str>) -> &'static str {
    match mime {
        Some("image/png") => "png",
        _ => "jpg",
    }
}

/// Pixel dimensions from the image header. Only the header is decoded.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
