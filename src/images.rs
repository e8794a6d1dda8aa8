//! Image helpers: upload sniffing, decode validation and display conversion
//!
//! Display images are flattened onto white, scaled down to a maximum
//! dimension and encoded as JPEG.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, RgbImage};

/// Result of converting an image for display
#[derive(Debug)]
pub struct DisplayImage {
    /// JPEG bytes
    pub data: Vec<u8>,
    /// Original image dimensions (width, height)
    pub original_dimensions: (u32, u32),
    /// Dimensions after resize (width, height)
    pub new_dimensions: (u32, u32),
    pub was_resized: bool,
}

/// True when the bytes look like an image (by magic number, not extension)
pub fn is_image(data: &[u8]) -> bool {
    infer::is_image(data)
}

/// MIME type sniffed from the content, if known
pub fn mime_type(data: &[u8]) -> Option<&'static str> {
    infer::get(data).map(|kind| kind.mime_type())
}

/// Decode an image in any format supported by the `image` crate
pub fn decode(data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(data).context("Failed to decode image")
}

/// Scale so that neither side exceeds `max_dimension`, keeping aspect ratio.
fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32, bool) {
    if width <= max_dimension && height <= max_dimension {
        return (width, height, false);
    }
    let scale = (max_dimension as f64) / (width.max(height) as f64);
    let new_w = ((width as f64) * scale).round() as u32;
    let new_h = ((height as f64) * scale).round() as u32;
    (new_w.max(1), new_h.max(1), true)
}

/// Composite onto a white background, dropping the alpha channel.
fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();

    RgbImage::from_fn(width, height, |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Convert any decodable image into a display JPEG.
///
/// # Arguments
/// * `data` - Raw image bytes
/// * `max_dimension` - Maximum width or height; larger images are scaled down
/// * `quality` - JPEG quality (1-100)
pub fn to_display_jpeg(data: &[u8], max_dimension: u32, quality: u8) -> Result<DisplayImage> {
    let img = decode(data)?;
    let (orig_w, orig_h) = img.dimensions();

    let (new_w, new_h, was_resized) = fit_within(orig_w, orig_h, max_dimension.max(1));

    let processed = if was_resized {
        img.resize_exact(new_w, new_h, image::imageops::FilterType::Lanczos3)
    } else {
        img
    };

    let rgb = flatten_onto_white(&processed);

    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder
        .encode_image(&rgb)
        .context("Failed to encode JPEG")?;

    Ok(DisplayImage {
        data: buf,
        original_dimensions: (orig_w, orig_h),
        new_dimensions: (new_w, new_h),
        was_resized,
    })
}
