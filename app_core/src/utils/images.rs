use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat, RgbImage};

use crate::contracts::{JobError, JobResult};

/// Ad-platform optimal pin size (2:3 ratio).
pub const PIN_WIDTH: u32 = 1000;
pub const PIN_HEIGHT: u32 = 1500;

/// Normalizes a downloaded product image into pin format: white-matte any
/// transparency, centre-crop to 2:3, resize to 1000x1500, JPEG quality 90.
pub fn normalize_to_pin_jpeg(bytes: &[u8]) -> JobResult<Vec<u8>> {
    let normalized = crop_and_resize(decode(bytes)?);
    encode(normalized, ImageOutputFormat::Jpeg(90))
}

/// Same pipeline for generated creatives, which are stored as PNG.
pub fn normalize_to_pin_png(bytes: &[u8]) -> JobResult<Vec<u8>> {
    let normalized = crop_and_resize(decode(bytes)?);
    encode(normalized, ImageOutputFormat::Png)
}

fn decode(bytes: &[u8]) -> JobResult<DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| JobError::validation(format!("could not decode image: {}", e)))
}

fn encode(img: RgbImage, format: ImageOutputFormat) -> JobResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buffer, format)
        .map_err(|e| JobError::validation(format!("could not encode image: {}", e)))?;
    Ok(buffer.into_inner())
}

fn crop_and_resize(img: DynamicImage) -> RgbImage {
    let flattened = flatten_onto_white(img);
    let (orig_width, orig_height) = flattened.dimensions();

    // Compare orig_width/orig_height against 2/3 without floats.
    let cropped = if orig_width * PIN_HEIGHT > orig_height * PIN_WIDTH {
        // Image is wider - crop sides
        let new_width = orig_height * PIN_WIDTH / PIN_HEIGHT;
        let offset = (orig_width - new_width) / 2;
        image::imageops::crop_imm(&flattened, offset, 0, new_width, orig_height).to_image()
    } else if orig_width * PIN_HEIGHT < orig_height * PIN_WIDTH {
        // Image is taller - crop top/bottom
        let new_height = orig_width * PIN_HEIGHT / PIN_WIDTH;
        let offset = (orig_height - new_height) / 2;
        image::imageops::crop_imm(&flattened, 0, offset, orig_width, new_height).to_image()
    } else {
        flattened
    };

    image::imageops::resize(&cropped, PIN_WIDTH, PIN_HEIGHT, FilterType::Lanczos3)
}

fn flatten_onto_white(img: DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = pixel[3] as u32;
        let blend = |channel: u8| ((channel as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    out
}
