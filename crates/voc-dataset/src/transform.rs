//! Per-visit input transformation.
//!
//! Every pass over an example samples a fresh transform: optional
//! pre-resize, random scale, random crop to the network's input size,
//! random mirroring, mean subtraction, and a final scale factor.

use image::{imageops::FilterType, DynamicImage};
use rand::Rng;
use voc_core::{ImageTensor, TransformParams};

/// Samples crop augmentations for a fixed network input size.
pub struct CropSampler {
    crop_size: u32,
    params: TransformParams,
}

impl CropSampler {
    /// Creates a sampler producing `crop_size` x `crop_size` inputs.
    pub fn new(crop_size: u32, params: TransformParams) -> Self {
        Self { crop_size, params }
    }

    /// Edge length of the produced inputs.
    pub fn crop_size(&self) -> u32 {
        self.crop_size
    }

    /// Applies one sampled transform to an image.
    pub fn sample<R: Rng>(&self, image: &DynamicImage, rng: &mut R) -> ImageTensor {
        let mut working = match self.params.resize {
            Some(edge) => image.resize_exact(edge, edge, FilterType::Triangle),
            None => image.clone(),
        };

        // Random scale, then enforce that both edges cover the crop.
        let factor = rng.gen_range(self.params.min_scale..=self.params.max_scale);
        let scaled_w = ((working.width() as f32 * factor).round() as u32).max(1);
        let scaled_h = ((working.height() as f32 * factor).round() as u32).max(1);
        working = working.resize_exact(scaled_w, scaled_h, FilterType::Triangle);
        if working.width() < self.crop_size || working.height() < self.crop_size {
            let up = (self.crop_size as f32
                / working.width().min(working.height()) as f32)
                .max(1.0);
            let w = ((working.width() as f32 * up).ceil() as u32).max(self.crop_size);
            let h = ((working.height() as f32 * up).ceil() as u32).max(self.crop_size);
            working = working.resize_exact(w, h, FilterType::Triangle);
        }

        let max_x = working.width() - self.crop_size;
        let max_y = working.height() - self.crop_size;
        let x = if max_x > 0 { rng.gen_range(0..=max_x) } else { 0 };
        let y = if max_y > 0 { rng.gen_range(0..=max_y) } else { 0 };
        let cropped = working.crop_imm(x, y, self.crop_size, self.crop_size);

        let mut rgb = cropped.to_rgb8();
        if self.params.mirror && rng.gen_bool(0.5) {
            rgb = image::imageops::flip_horizontal(&rgb);
        }

        let size = self.crop_size as usize;
        let mut tensor = ImageTensor::zeros(3, size, size);
        for (px, py, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                let value = (f32::from(pixel[c]) - self.params.mean[c]) * self.params.scale;
                tensor.data[c * size * size + py as usize * size + px as usize] = value;
            }
        }
        tensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn solid_image(width: u32, height: u32, value: u8) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = image::Rgb([value, value, value]);
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_output_dimensions() {
        let sampler = CropSampler::new(8, TransformParams::default());
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let tensor = sampler.sample(&solid_image(32, 24, 128), &mut rng);
        assert_eq!(tensor.channels, 3);
        assert_eq!(tensor.height, 8);
        assert_eq!(tensor.width, 8);
        assert_eq!(tensor.len(), 3 * 8 * 8);
    }

    #[test]
    fn test_small_images_are_upscaled_to_cover_crop() {
        let sampler = CropSampler::new(16, TransformParams::default());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        // 4x4 source scaled down still produces a full crop.
        let tensor = sampler.sample(&solid_image(4, 4, 50), &mut rng);
        assert_eq!(tensor.len(), 3 * 16 * 16);
    }

    #[test]
    fn test_mean_and_scale_are_applied() {
        let params = TransformParams {
            mean: [10.0, 20.0, 30.0],
            scale: 2.0,
            min_scale: 1.0,
            max_scale: 1.0,
            mirror: false,
            resize: None,
        };
        let sampler = CropSampler::new(4, params);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let tensor = sampler.sample(&solid_image(4, 4, 100), &mut rng);

        let size = 4 * 4;
        assert!((tensor.data[0] - 180.0).abs() < 1e-4); // (100 - 10) * 2
        assert!((tensor.data[size] - 160.0).abs() < 1e-4); // (100 - 20) * 2
        assert!((tensor.data[2 * size] - 140.0).abs() < 1e-4); // (100 - 30) * 2
    }

    #[test]
    fn test_resize_controls_source_dimensions() {
        let params = TransformParams {
            min_scale: 1.0,
            max_scale: 1.0,
            mirror: false,
            resize: Some(12),
            ..TransformParams::default()
        };
        let sampler = CropSampler::new(12, params);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        // With resize = crop and unit scale the crop origin is forced to 0.
        let tensor = sampler.sample(&solid_image(64, 48, 5), &mut rng);
        assert_eq!(tensor.len(), 3 * 12 * 12);
    }
}
