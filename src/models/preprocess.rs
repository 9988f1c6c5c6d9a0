//! Image preprocessing for classifier input.
//!
//! Turns decoded images into the tensor layout the ONNX model was exported
//! with: RGB, fixed square resolution, ImageNet normalization, CHW order.

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, ImageFormat};

/// ImageNet normalization mean values (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet normalization std values (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Converts images into normalized CHW tensors
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    image_size: u32,
}

impl Preprocessor {
    pub fn new(image_size: u32) -> Self {
        Self { image_size }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Number of `f32` values in one preprocessed image
    pub fn tensor_len(&self) -> usize {
        3 * (self.image_size * self.image_size) as usize
    }

    /// Preprocess one image into a flat CHW tensor
    pub fn tensor(&self, image: &DynamicImage) -> Vec<f32> {
        let resized = image.resize_exact(self.image_size, self.image_size, FilterType::Triangle);
        normalize(&resized)
    }

    /// Preprocess several images into one contiguous `[N, 3, H, W]` buffer
    pub fn batch_tensor(&self, images: &[&DynamicImage]) -> Vec<f32> {
        let mut batch = Vec::with_capacity(images.len() * self.tensor_len());
        for image in images {
            batch.extend(self.tensor(image));
        }
        batch
    }
}

/// Normalize an RGB image into CHW layout
fn normalize(image: &DynamicImage) -> Vec<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let num_pixels = (width * height) as usize;

    let mut normalized = vec![0.0f32; 3 * num_pixels];

    for (i, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            normalized[c * num_pixels + i] =
                (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    normalized
}

/// Decode uploaded bytes into an image
pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("Failed to decode image")
}

/// Best-effort format name for uploaded bytes, e.g. "jpeg"
pub fn detect_format(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes)
        .ok()
        .map(ImageFormat::extensions_str)
        .and_then(|exts| exts.first().copied())
        .map(|ext| if ext == "jpg" { "jpeg" } else { ext })
}

/// File extension to store an upload under
pub fn extension_for(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(format) => format.extensions_str().first().copied().unwrap_or("bin"),
        Err(_) => "bin",
    }
}
