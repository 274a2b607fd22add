//! Application of image transform chains.
//!
//! Transforms are stateless functions over the decoded image; the chain
//! order from the configuration is the application order. Geometric
//! steps (crop, scale) operate in image space; the mean subtraction
//! leaves image space, which is why configuration validation forbids
//! geometric steps after a `Mean`.

use crate::config::{CropType, ImageTransform, Interpolation, JitterType};
use crate::error::{DataError, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::Rng;
use std::path::Path;

/// A transform chain with its mean file (when present) resolved at
/// reader construction, so read-time application never touches disk
/// beyond the image itself.
pub(crate) struct PreparedChain {
    steps: Vec<PreparedStep>,
}

enum PreparedStep {
    Crop {
        crop_type: CropType,
        crop_ratio: f64,
        jitter_type: JitterType,
    },
    Scale {
        width: u32,
        height: u32,
        channels: u32,
        filter: FilterType,
    },
    /// Mean values, either one per output component or a single
    /// broadcast value.
    Mean(Vec<f32>),
}

impl PreparedChain {
    /// Resolves a validated chain: loads the mean file and checks its
    /// element count against the scale target.
    pub(crate) fn prepare(chain: &[ImageTransform]) -> Result<Self> {
        let mut output_len = 0usize;
        let mut steps = Vec::with_capacity(chain.len());
        for transform in chain {
            steps.push(match transform {
                ImageTransform::Crop {
                    crop_type,
                    crop_ratio,
                    jitter_type,
                } => PreparedStep::Crop {
                    crop_type: *crop_type,
                    crop_ratio: *crop_ratio,
                    jitter_type: *jitter_type,
                },
                ImageTransform::Scale {
                    width,
                    height,
                    channels,
                    interpolations,
                } => {
                    output_len = (*channels as usize) * (*height as usize) * (*width as usize);
                    PreparedStep::Scale {
                        width: *width,
                        height: *height,
                        channels: *channels,
                        filter: filter_for(*interpolations),
                    }
                }
                ImageTransform::Mean { mean_file } => {
                    PreparedStep::Mean(load_mean_file(mean_file, output_len)?)
                }
            });
        }
        Ok(Self { steps })
    }

    /// Runs the chain over a decoded image, producing one dense element
    /// in channel-major (CHW) layout.
    pub(crate) fn apply(&self, image: DynamicImage, rng: &mut StdRng) -> Result<Vec<f32>> {
        let mut image = image;
        let mut planes: Option<Vec<f32>> = None;
        for step in &self.steps {
            match step {
                PreparedStep::Crop {
                    crop_type,
                    crop_ratio,
                    jitter_type,
                } => {
                    image = apply_crop(image, *crop_type, *crop_ratio, *jitter_type, rng);
                }
                PreparedStep::Scale {
                    width,
                    height,
                    channels,
                    filter,
                } => {
                    image = apply_scale(&image, *width, *height, *channels, *filter);
                }
                PreparedStep::Mean(mean) => {
                    let mut data = planes.take().unwrap_or_else(|| image_to_planes(&image));
                    for (i, value) in data.iter_mut().enumerate() {
                        *value -= mean[i % mean.len()];
                    }
                    planes = Some(data);
                }
            }
        }
        Ok(planes.unwrap_or_else(|| image_to_planes(&image)))
    }
}

fn filter_for(interpolation: Interpolation) -> FilterType {
    match interpolation {
        Interpolation::Nearest => FilterType::Nearest,
        Interpolation::Linear => FilterType::Triangle,
        Interpolation::Cubic => FilterType::CatmullRom,
    }
}

fn apply_crop(
    image: DynamicImage,
    crop_type: CropType,
    crop_ratio: f64,
    jitter_type: JitterType,
    rng: &mut StdRng,
) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let ratio = match jitter_type {
        JitterType::None => crop_ratio,
        JitterType::UniRatio => rng.random_range(crop_ratio..=1.0),
    };
    let crop_width = ((width as f64 * ratio).round() as u32).clamp(1, width);
    let crop_height = ((height as f64 * ratio).round() as u32).clamp(1, height);

    let (x, y) = match crop_type {
        CropType::Center => ((width - crop_width) / 2, (height - crop_height) / 2),
        CropType::Random => (
            rng.random_range(0..=width - crop_width),
            rng.random_range(0..=height - crop_height),
        ),
    };
    image.crop_imm(x, y, crop_width, crop_height)
}

fn apply_scale(
    image: &DynamicImage,
    width: u32,
    height: u32,
    channels: u32,
    filter: FilterType,
) -> DynamicImage {
    let resized = image.resize_exact(width, height, filter);
    // Channel count was validated to 1 or 3 at configuration time.
    if channels == 1 {
        DynamicImage::ImageLuma8(resized.to_luma8())
    } else {
        DynamicImage::ImageRgb8(resized.to_rgb8())
    }
}

/// Flattens an image to channel-major f32 planes (raw 0..=255 values).
fn image_to_planes(image: &DynamicImage) -> Vec<f32> {
    match image {
        DynamicImage::ImageLuma8(gray) => gray.pixels().map(|p| p.0[0] as f32).collect(),
        _ => {
            let rgb = image.to_rgb8();
            let (width, height) = rgb.dimensions();
            let mut planes = vec![0.0; 3 * (width as usize) * (height as usize)];
            let plane = (width as usize) * (height as usize);
            for (x, y, pixel) in rgb.enumerate_pixels() {
                let offset = (y as usize) * (width as usize) + x as usize;
                for channel in 0..3 {
                    planes[channel * plane + offset] = pixel.0[channel] as f32;
                }
            }
            planes
        }
    }
}

/// Reads a whitespace-separated mean file: either one value per output
/// component or a single value broadcast over all of them.
fn load_mean_file(path: &Path, expected_len: usize) -> Result<Vec<f32>> {
    let text = std::fs::read_to_string(path)?;
    let values: std::result::Result<Vec<f32>, _> =
        text.split_whitespace().map(str::parse).collect();
    let values = values.map_err(|_| {
        DataError::Configuration(format!(
            "Mean file {} contains non-numeric entries",
            path.display()
        ))
    })?;
    if values.len() != expected_len && values.len() != 1 {
        return Err(DataError::Configuration(format!(
            "Mean file {} has {} entries, expected {} (or a single broadcast value)",
            path.display(),
            values.len(),
            expected_len
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use image::{Rgb, RgbImage};
    use rand::SeedableRng;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn gradient_image(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                img.put_pixel(
                    x,
                    y,
                    Rgb([(x % 256) as u8, (y % 256) as u8, 128]),
                );
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_scale_fixes_output_shape() -> Result<()> {
        let chain = PreparedChain::prepare(&[ImageTransform::scale(
            10,
            20,
            3,
            Interpolation::Nearest,
        )])?;
        let mut rng = StdRng::seed_from_u64(0);
        let out = chain.apply(gradient_image(64, 48), &mut rng)?;
        assert_eq!(out.len(), 3 * 20 * 10);
        Ok(())
    }

    #[test]
    fn test_grayscale_scale() -> Result<()> {
        let chain = PreparedChain::prepare(&[ImageTransform::scale(
            8,
            8,
            1,
            Interpolation::Linear,
        )])?;
        let mut rng = StdRng::seed_from_u64(0);
        let out = chain.apply(gradient_image(16, 16), &mut rng)?;
        assert_eq!(out.len(), 64);
        Ok(())
    }

    #[test]
    fn test_crop_then_scale_preserves_order() -> Result<()> {
        let chain = PreparedChain::prepare(&[
            ImageTransform::crop(CropType::Center, 0.5, JitterType::None),
            ImageTransform::scale(4, 4, 3, Interpolation::Nearest),
        ])?;
        let mut rng = StdRng::seed_from_u64(0);
        let out = chain.apply(gradient_image(32, 32), &mut rng)?;
        assert_eq!(out.len(), 48);
        Ok(())
    }

    #[test]
    fn test_mean_subtraction_broadcast() -> Result<()> {
        let mut mean_file = NamedTempFile::new()?;
        writeln!(mean_file, "128.0")?;

        let chain = PreparedChain::prepare(&[
            ImageTransform::scale(2, 2, 3, Interpolation::Nearest),
            ImageTransform::mean(mean_file.path()),
        ])?;
        let mut rng = StdRng::seed_from_u64(0);

        // Uniform gray input: every output component is 128 - 128 = 0.
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([128, 128, 128])));
        let out = chain.apply(img, &mut rng)?;
        assert!(out.iter().all(|&v| v == 0.0));
        Ok(())
    }

    #[test]
    fn test_mean_file_wrong_length_rejected() -> Result<()> {
        let mut mean_file = NamedTempFile::new()?;
        writeln!(mean_file, "1.0 2.0 3.0")?;

        let result = PreparedChain::prepare(&[
            ImageTransform::scale(2, 2, 3, Interpolation::Nearest),
            ImageTransform::mean(mean_file.path()),
        ]);
        assert!(matches!(result, Err(DataError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn test_random_crop_is_seed_deterministic() -> Result<()> {
        let chain = PreparedChain::prepare(&[
            ImageTransform::crop(CropType::Random, 0.6, JitterType::UniRatio),
            ImageTransform::scale(8, 8, 3, Interpolation::Nearest),
        ])?;
        let mut rng_a = StdRng::seed_from_u64(11);
        let mut rng_b = StdRng::seed_from_u64(11);
        let a = chain.apply(gradient_image(40, 40), &mut rng_a)?;
        let b = chain.apply(gradient_image(40, 40), &mut rng_b)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_chw_plane_layout() -> Result<()> {
        let chain = PreparedChain::prepare(&[ImageTransform::scale(
            2,
            1,
            3,
            Interpolation::Nearest,
        )])?;
        let mut rng = StdRng::seed_from_u64(0);

        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([10, 20, 30]));
        img.put_pixel(1, 0, Rgb([40, 50, 60]));
        let out = chain.apply(DynamicImage::ImageRgb8(img), &mut rng)?;

        // Red plane, then green, then blue.
        assert_eq!(out, vec![10.0, 40.0, 20.0, 50.0, 30.0, 60.0]);
        Ok(())
    }
}
