//! Image preprocessing for the vision tower.
//!
//! An input image is resized to patch-aligned dimensions inside the
//! configured pixel budget, normalized into CHW planes, and cut into flat
//! patch vectors the patch-embedding layer consumes directly.

use crate::core::errors::InferenceError;
use crate::vl::config::ImageProcessorConfig;
use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use image::imageops::FilterType;
use rayon::prelude::*;

/// Preprocessed pixels plus the patch grid they were cut into.
#[derive(Debug, Clone)]
pub struct ImageInputs {
    /// Flat patches, shape `(num_patches, channel * temporal * patch^2)`.
    pub pixel_values: Tensor,
    /// `(t, h, w)` patch grid.
    pub grid: (usize, usize, usize),
}

impl ImageInputs {
    /// Number of positions the image occupies in the language model after
    /// spatial merging.
    pub fn token_count(&self, merge_size: usize) -> usize {
        let (t, h, w) = self.grid;
        (t * h * w) / (merge_size * merge_size)
    }
}

/// Computes resize targets that are factor-aligned and inside the pixel
/// budget while approximately preserving aspect ratio.
pub fn smart_resize(
    height: u32,
    width: u32,
    factor: u32,
    min_pixels: u32,
    max_pixels: u32,
) -> Result<(u32, u32), InferenceError> {
    if factor == 0 {
        return Err(InferenceError::generation("smart_resize: factor must be > 0"));
    }

    let mut height = height as f64;
    let mut width = width as f64;
    let factor_f = factor as f64;

    if height < factor_f {
        width = ((width * factor_f) / height).round();
        height = factor_f;
    }
    if width < factor_f {
        height = ((height * factor_f) / width).round();
        width = factor_f;
    }

    let max_dim = height.max(width);
    let min_dim = height.min(width);
    if min_dim > 0.0 && (max_dim / min_dim) > 200.0 {
        return Err(InferenceError::generation(format!(
            "image aspect ratio must be <= 200, got {:.3}",
            max_dim / min_dim
        )));
    }

    let mut h_bar = (height / factor_f).round() * factor_f;
    let mut w_bar = (width / factor_f).round() * factor_f;

    let area = h_bar * w_bar;
    if area > max_pixels as f64 {
        let beta = ((height * width) / max_pixels as f64).sqrt();
        h_bar = ((height / beta) / factor_f).floor() * factor_f;
        w_bar = ((width / beta) / factor_f).floor() * factor_f;
    } else if area < min_pixels as f64 {
        let beta = (min_pixels as f64 / (height * width)).sqrt();
        h_bar = ((height * beta) / factor_f).ceil() * factor_f;
        w_bar = ((width * beta) / factor_f).ceil() * factor_f;
    }

    Ok((h_bar.max(factor_f) as u32, w_bar.max(factor_f) as u32))
}

/// Converts an RGB image into normalized CHW planes.
///
/// Output layout: `[R0..Rn, G0..Gn, B0..Bn]`. Pixels are processed in
/// parallel since formula scans routinely reach megapixel sizes.
fn image_to_chw(image: &RgbImage, cfg: &ImageProcessorConfig) -> Vec<f32> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let num_pixels = width * height;
    let raw = image.as_raw();
    let scale = cfg.rescale_factor;
    let (mean, std) = (&cfg.image_mean, &cfg.image_std);

    let mut output = vec![0f32; num_pixels * 3];
    let (r_plane, rest) = output.split_at_mut(num_pixels);
    let (g_plane, b_plane) = rest.split_at_mut(num_pixels);

    r_plane
        .par_iter_mut()
        .zip(g_plane.par_iter_mut())
        .zip(b_plane.par_iter_mut())
        .enumerate()
        .for_each(|(i, ((r_out, g_out), b_out))| {
            *r_out = (raw[3 * i] as f32 * scale - mean[0]) / std[0];
            *g_out = (raw[3 * i + 1] as f32 * scale - mean[1]) / std[1];
            *b_out = (raw[3 * i + 2] as f32 * scale - mean[2]) / std[2];
        });

    output
}

/// Preprocesses one image into patch vectors on the target device.
pub fn preprocess_image(
    image: &RgbImage,
    cfg: &ImageProcessorConfig,
    device: &Device,
    dtype: DType,
) -> Result<ImageInputs, InferenceError> {
    let factor = (cfg.patch_size * cfg.merge_size) as u32;
    let patch = cfg.patch_size as u32;
    let merge = cfg.merge_size;

    let (h, w) = (image.height(), image.width());
    if h == 0 || w == 0 {
        return Err(InferenceError::generation("image has zero dimensions"));
    }
    let (rh, rw) = smart_resize(h, w, factor, cfg.min_pixels, cfg.max_pixels)?;

    let resized = if rh != h || rw != w {
        image::imageops::resize(image, rw, rh, FilterType::CatmullRom)
    } else {
        image.clone()
    };

    if rh % patch != 0 || rw % patch != 0 {
        return Err(InferenceError::generation(format!(
            "resize produced non-divisible dims: {rh}x{rw} for patch_size {patch}"
        )));
    }

    let grid_h = (rh / patch) as usize;
    let grid_w = (rw / patch) as usize;
    if !grid_h.is_multiple_of(merge) || !grid_w.is_multiple_of(merge) {
        return Err(InferenceError::generation(format!(
            "patch grid {grid_h}x{grid_w} not divisible by merge_size {merge}"
        )));
    }

    let frame = image_to_chw(&resized, cfg);
    // A still image is replicated across the temporal patch dimension.
    let grid_t = 1usize;
    let channel = 3usize;
    let height = rh as usize;
    let width = rw as usize;
    let frame_area = height * width;
    let patch_dim = channel * cfg.temporal_patch_size * cfg.patch_size * cfg.patch_size;
    let num_patches = grid_t * grid_h * grid_w;

    let mut flat_patches: Vec<f32> = Vec::with_capacity(num_patches * patch_dim);
    for hb in 0..(grid_h / merge) {
        for wb in 0..(grid_w / merge) {
            for h_inner in 0..merge {
                for w_inner in 0..merge {
                    let base_y = (hb * merge + h_inner) * cfg.patch_size;
                    let base_x = (wb * merge + w_inner) * cfg.patch_size;
                    for c in 0..channel {
                        for _t in 0..cfg.temporal_patch_size {
                            for dy in 0..cfg.patch_size {
                                let row_base = c * frame_area + (base_y + dy) * width;
                                for dx in 0..cfg.patch_size {
                                    flat_patches.push(frame[row_base + base_x + dx]);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    debug_assert_eq!(flat_patches.len(), num_patches * patch_dim);

    let pixel_values = Tensor::from_vec(flat_patches, (num_patches, patch_dim), device)
        .and_then(|t| t.to_dtype(dtype))
        .map_err(|e| InferenceError::from_candle("build pixel_values tensor", e))?;

    Ok(ImageInputs {
        pixel_values,
        grid: (grid_t, grid_h, grid_w),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_resize_is_factor_aligned_and_within_budget() {
        let (h, w) = smart_resize(100, 200, 28, 56 * 56, 28 * 28 * 1280).unwrap();
        assert_eq!(h % 28, 0);
        assert_eq!(w % 28, 0);
        assert!((h * w) >= 56 * 56);
        assert!((h * w) <= 28 * 28 * 1280);
    }

    #[test]
    fn smart_resize_upscales_tiny_images() {
        let (h, w) = smart_resize(10, 10, 28, 56 * 56, 28 * 28 * 1280).unwrap();
        assert!(h >= 28 && w >= 28);
        assert!((h * w) >= 56 * 56);
    }

    #[test]
    fn smart_resize_rejects_extreme_aspect_ratios() {
        assert!(smart_resize(10_000, 28, 28, 56 * 56, 28 * 28 * 1280).is_err());
    }

    #[test]
    fn preprocess_produces_expected_patch_count() {
        let cfg = ImageProcessorConfig::default();
        let image = RgbImage::from_pixel(112, 112, image::Rgb([128, 128, 128]));
        let inputs =
            preprocess_image(&image, &cfg, &Device::Cpu, DType::F32).unwrap();
        let (t, h, w) = inputs.grid;
        assert_eq!(t, 1);
        assert_eq!(h % cfg.merge_size, 0);
        assert_eq!(w % cfg.merge_size, 0);
        assert_eq!(
            inputs.pixel_values.dims(),
            &[t * h * w, 3 * cfg.temporal_patch_size * cfg.patch_size * cfg.patch_size]
        );
        assert_eq!(inputs.token_count(cfg.merge_size), (t * h * w) / 4);
    }
}
