use image::{ImageError, imageops::FilterType};
use thiserror::Error;
use tract_onnx::prelude::tract_ndarray::Array4;

/// Side length of the square model input.
pub const INPUT_SIZE: u32 = 224;
pub const INPUT_CHANNELS: usize = 3;

/// One image as a `[1, INPUT_SIZE, INPUT_SIZE, 3]` channels-last batch.
pub type InputBatch = Array4<f32>;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("The image could not be decoded: {0}")]
    Decode(#[from] ImageError),
}

/// Decodes, resizes and normalizes an uploaded image into a model batch.
pub fn preprocess(image_bytes: &[u8]) -> Result<InputBatch, PreprocessError> {
    let image = image::load_from_memory(image_bytes)?;
    let resized = image
        .resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom)
        .to_rgb8();

    let side = INPUT_SIZE as usize;
    let batch = Array4::from_shape_fn((1, side, side, INPUT_CHANNELS), |(_, y, x, channel)| {
        #[allow(clippy::cast_possible_truncation)]
        let pixel = resized.get_pixel(x as u32, y as u32);
        normalize_channel(pixel[channel])
    });

    Ok(batch)
}

/// MIME type of the image format detected from the leading bytes.
///
/// `None` when the bytes don't start like any image format the decoder knows.
#[must_use]
pub fn sniff_mime_type(image_bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(image_bytes)
        .ok()
        .map(|format| format.to_mime_type())
}

/// Xception-family scaling of one channel value into `[-1, 1]`.
#[must_use]
pub fn normalize_channel(value: u8) -> f32 {
    f32::from(value) / 127.5 - 1.0
}

#[cfg(test)]
mod tests {
    use crate::preprocess::{INPUT_SIZE, normalize_channel, preprocess, sniff_mime_type};
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb, Rgba};
    use std::io::Cursor;

    fn encode_png(image: DynamicImage) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn normalization_range() {
        assert!((normalize_channel(0) + 1.0).abs() < f32::EPSILON);
        assert!((normalize_channel(255) - 1.0).abs() < f32::EPSILON);
        assert!(normalize_channel(128).abs() < 0.01);
    }

    #[test]
    fn batch_shape_and_channel_order() {
        let red = ImageBuffer::from_pixel(17, 5, Rgb([255_u8, 0, 0]));
        let batch = preprocess(&encode_png(DynamicImage::ImageRgb8(red))).unwrap();

        let side = INPUT_SIZE as usize;
        assert_eq!(batch.shape(), [1, side, side, 3]);
        assert!((batch[[0, 0, 0, 0]] - 1.0).abs() < 0.01);
        assert!((batch[[0, side - 1, side - 1, 1]] + 1.0).abs() < 0.01);
        assert!((batch[[0, 100, 37, 2]] + 1.0).abs() < 0.01);
    }

    #[test]
    fn alpha_channel_is_dropped() {
        let translucent = ImageBuffer::from_pixel(8, 8, Rgba([0_u8, 0, 255, 10]));
        let batch = preprocess(&encode_png(DynamicImage::ImageRgba8(translucent))).unwrap();

        assert_eq!(batch.shape()[3], 3);
        assert!((batch[[0, 3, 3, 2]] - 1.0).abs() < 0.01);
    }

    #[test]
    fn undecodable_bytes_fail() {
        assert!(preprocess(b"definitely not an image").is_err());
        assert!(preprocess(&[]).is_err());
    }

    #[test]
    fn mime_type_comes_from_the_bytes() {
        let png = encode_png(DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
            2,
            2,
            Rgb([1_u8, 2, 3]),
        )));

        assert_eq!(sniff_mime_type(&png), Some("image/png"));
        assert_eq!(sniff_mime_type(b"<script>alert(1)</script>"), None);
        assert_eq!(sniff_mime_type(&[]), None);
    }
}
