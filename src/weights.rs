//! Gaussian tile weighting and canvas normalization fields.
//!
//! Every tile's noise prediction is blended into the canvas under a smooth
//! 2-D Gaussian mask so that tile centers dominate and tile borders fade
//! out. Overlapping contributions are then normalized by the total weight
//! accumulated at each pixel:
//!
//! ```text
//! canvas_pred[p] = sum_over_tiles( tile_pred[p] * mask[p] ) / field[p]
//! field[p]       = sum_over_tiles( mask[p] )
//! ```
//!
//! Because the division is folded into each tile's contribution as a
//! precomputed rescale factor, a pixel covered by a single tile receives
//! exactly that tile's prediction, and a pixel covered by several tiles
//! receives their weighted average. Without this weighting, hard tile
//! borders show up as visible seams in the decoded image.
//!
//! # Centering conventions
//!
//! The horizontal axis centers its Gaussian on `(width - 1) / 2` while the
//! vertical axis centers on `height / 2`. The asymmetry is intentional and
//! load-bearing: downstream outputs are matched bit for bit against a
//! schedule that behaves exactly this way, so neither axis may be
//! "corrected" to the other convention. Both are pinned by tests.

use candle::{DType, Device, Result, Tensor};

use crate::config::BlendConfig;
use crate::region::{TileBox, TilingPlan};

/// Fixed variance of the per-tile Gaussian, expressed relative to the tile
/// side length. Not exposed for tuning.
const KERNEL_VAR: f64 = 0.01;

/// Synthesize the 2-D Gaussian weight mask for a `width`x`height` tile.
///
/// Returns the mask row-major (`height` rows of `width` values), strictly
/// positive everywhere. Each axis follows the 1-D normal density
/// `exp(-(i - mid)^2 / len^2 / (2 var)) / sqrt(2 pi var)` and the two axes
/// are combined as an outer product.
pub fn gaussian_weights(width: usize, height: usize) -> Vec<f32> {
    let norm = 1.0 / (2.0 * std::f64::consts::PI * KERNEL_VAR).sqrt();

    // -1 because indices run from 0 to width - 1.
    let x_mid = (width as f64 - 1.0) / 2.0;
    let x_probs: Vec<f64> = (0..width)
        .map(|x| {
            let d = x as f64 - x_mid;
            (-d * d / (width as f64 * width as f64) / (2.0 * KERNEL_VAR)).exp() * norm
        })
        .collect();

    // The vertical midpoint deliberately uses the other convention, see the
    // module docs.
    let y_mid = height as f64 / 2.0;
    let y_probs: Vec<f64> = (0..height)
        .map(|y| {
            let d = y as f64 - y_mid;
            (-d * d / (height as f64 * height as f64) / (2.0 * KERNEL_VAR)).exp() * norm
        })
        .collect();

    let mut mask = Vec::with_capacity(width * height);
    for yp in &y_probs {
        for xp in &x_probs {
            mask.push((yp * xp) as f32);
        }
    }
    mask
}

/// [`gaussian_weights`] uploaded as a `(1, 1, height, width)` tensor ready
/// to broadcast over a batch of latent tiles.
pub fn gaussian_weights_tensor(
    width: usize,
    height: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    Tensor::from_vec(gaussian_weights(width, height), (height, width), device)?
        .reshape((1, 1, height, width))?
        .to_dtype(dtype)
}

/// Weighting state precomputed once per session.
///
/// All grid tiles share one mask (they are equal-sized); each custom region
/// gets its own mask scaled by the region's blend multiplier. The rescale
/// field folds the per-pixel normalization into a single elementwise
/// multiply at blending time.
#[derive(Debug, Clone)]
pub struct SessionWeights {
    /// Shared Gaussian mask for grid tiles, `(1, 1, tile_h, tile_w)`.
    pub grid_mask: Tensor,
    /// Total accumulated weight per canvas pixel, `(1, 1, H, W)`.
    pub weight: Tensor,
    /// Elementwise reciprocal of `weight` wherever any tile covers the
    /// pixel, `(1, 1, H, W)`. Uncovered pixels hold zero and are never
    /// read.
    pub rescale: Tensor,
    /// Per-region Gaussian x multiplier masks, `(1, 1, h, w)` each, in
    /// plan order.
    pub region_masks: Vec<Tensor>,
}

impl SessionWeights {
    /// Accumulate the weight field over the whole plan and derive the
    /// rescale field. Runs once at session setup.
    pub fn build(
        config: &BlendConfig,
        plan: &TilingPlan,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let (canvas_h, canvas_w) = (plan.canvas_height, plan.canvas_width);
        let mut field = vec![0f32; canvas_h * canvas_w];
        let mut coverage = vec![0u32; canvas_h * canvas_w];

        // The grid mask is computed once and scattered at every grid box;
        // all grid tiles are equal-sized by construction.
        let grid_vec = gaussian_weights(config.tile_width, config.tile_height);
        for bbox in plan.grid_batches.iter().flatten() {
            if bbox.width() != config.tile_width || bbox.height() != config.tile_height {
                candle::bail!(
                    "grid tile {}x{} does not match the shared {}x{} mask",
                    bbox.height(),
                    bbox.width(),
                    config.tile_height,
                    config.tile_width
                );
            }
            accumulate(&mut field, &mut coverage, canvas_w, bbox, &grid_vec, 1.0);
        }

        // Custom regions fold their blend multiplier into the mask up
        // front; the weighted mask is retained for the blending phase.
        let mut region_masks = Vec::with_capacity(plan.custom_regions.len());
        for region in &plan.custom_regions {
            let (w, h) = (region.bbox.width(), region.bbox.height());
            let mask = gaussian_weights(w, h);
            accumulate(
                &mut field,
                &mut coverage,
                canvas_w,
                &region.bbox,
                &mask,
                region.weight as f32,
            );
            let weighted: Vec<f32> = mask.iter().map(|v| v * region.weight as f32).collect();
            region_masks.push(
                Tensor::from_vec(weighted, (h, w), device)?
                    .reshape((1, 1, h, w))?
                    .to_dtype(dtype)?,
            );
        }

        let mut rescale = vec![0f32; canvas_h * canvas_w];
        for (idx, r) in rescale.iter_mut().enumerate() {
            if coverage[idx] == 0 {
                continue;
            }
            if field[idx] <= 0.0 {
                candle::bail!(
                    "accumulated tile weight vanished at covered pixel ({}, {})",
                    idx / canvas_w,
                    idx % canvas_w
                );
            }
            *r = 1.0 / field[idx];
        }

        let weight = Tensor::from_vec(field, (canvas_h, canvas_w), device)?
            .reshape((1, 1, canvas_h, canvas_w))?
            .to_dtype(dtype)?;
        let rescale = Tensor::from_vec(rescale, (canvas_h, canvas_w), device)?
            .reshape((1, 1, canvas_h, canvas_w))?
            .to_dtype(dtype)?;
        let grid_mask =
            gaussian_weights_tensor(config.tile_width, config.tile_height, device, dtype)?;

        Ok(Self {
            grid_mask,
            weight,
            rescale,
            region_masks,
        })
    }

    /// Combined `mask * rescale` factor for one grid tile.
    pub fn grid_scale(&self, bbox: &TileBox) -> Result<Tensor> {
        self.grid_mask.broadcast_mul(&bbox.crop(&self.rescale)?)
    }

    /// Combined `mask * multiplier * rescale` factor for one custom region.
    pub fn region_scale(&self, region_id: usize, bbox: &TileBox) -> Result<Tensor> {
        self.region_masks[region_id].broadcast_mul(&bbox.crop(&self.rescale)?)
    }
}

fn accumulate(
    field: &mut [f32],
    coverage: &mut [u32],
    canvas_w: usize,
    bbox: &TileBox,
    mask: &[f32],
    scale: f32,
) {
    let bw = bbox.width();
    for (row, y) in (bbox.y0..bbox.y1).enumerate() {
        for (col, x) in (bbox.x0..bbox.x1).enumerate() {
            let idx = y * canvas_w + x;
            field[idx] += mask[row * bw + col] * scale;
            coverage[idx] += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{CustomRegion, TileBox, TilingPlan};

    #[test]
    fn test_gaussian_strictly_positive() {
        for &(w, h) in &[(4, 4), (5, 8), (96, 96)] {
            let mask = gaussian_weights(w, h);
            assert_eq!(mask.len(), w * h);
            assert!(mask.iter().all(|&v| v > 0.0), "{w}x{h} mask not positive");
        }
    }

    #[test]
    fn test_gaussian_sum_approaches_integral() {
        // With var = 0.01 the effective sigma is a tenth of the side
        // length, so the truncated sum of each normalized axis approaches
        // the side length itself and the 2-D sum approaches w * h.
        let (w, h) = (64, 64);
        let sum: f64 = gaussian_weights(w, h).iter().map(|&v| v as f64).sum();
        let expected = (w * h) as f64;
        assert!(
            (sum - expected).abs() / expected < 0.02,
            "sum {sum} too far from {expected}"
        );
    }

    #[test]
    fn test_horizontal_midpoint() {
        // Odd width: unique maximum at (w - 1) / 2.
        let mask = gaussian_weights(7, 1);
        let argmax = mask
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(argmax, 3);

        // Even width: the midpoint falls between two cells, which tie.
        let mask = gaussian_weights(8, 1);
        assert!((mask[3] - mask[4]).abs() < 1e-9);
        assert!(mask[3] > mask[2]);
    }

    #[test]
    fn test_vertical_midpoint() {
        // Even height: the vertical convention centers on h / 2, so the
        // maximum sits at index h / 2 rather than straddling the middle.
        let h = 8;
        let mask = gaussian_weights(1, h);
        let argmax = mask
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(argmax, h / 2);
        assert!(mask[h / 2 - 1] < mask[h / 2]);
    }

    #[test]
    fn test_axes_are_not_interchangeable() {
        // The two centering conventions make a square mask asymmetric
        // under transposition.
        let n = 4;
        let mask = gaussian_weights(n, n);
        let direct = mask[n + 2]; // (y = 1, x = 2)
        let transposed = mask[2 * n + 1]; // (y = 2, x = 1)
        assert!(
            (direct - transposed).abs() > 1e-6,
            "mask unexpectedly symmetric: {direct} vs {transposed}"
        );
    }

    #[test]
    fn test_weight_field_positive_under_full_coverage() -> Result<()> {
        let config = BlendConfig {
            tile_height: 8,
            tile_width: 5,
            ..Default::default()
        };
        let plan = TilingPlan {
            canvas_height: 8,
            canvas_width: 8,
            grid_batches: vec![vec![
                TileBox::new(0, 0, 5, 8)?,
                TileBox::new(3, 0, 8, 8)?,
            ]],
            custom_regions: vec![],
            global_multiplier: 1.0,
        };
        let weights = SessionWeights::build(&config, &plan, &Device::Cpu, DType::F32)?;
        let field = weights.weight.flatten_all()?.to_vec1::<f32>()?;
        assert!(field.iter().all(|&v| v > 0.0));

        // Rescale inverts the field wherever it is defined.
        let rescale = weights.rescale.flatten_all()?.to_vec1::<f32>()?;
        for (f, r) in field.iter().zip(rescale.iter()) {
            assert!((f * r - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_uncovered_pixels_hold_zero() -> Result<()> {
        let config = BlendConfig {
            tile_height: 4,
            tile_width: 4,
            ..Default::default()
        };
        let plan = TilingPlan {
            canvas_height: 8,
            canvas_width: 8,
            grid_batches: vec![vec![TileBox::new(0, 0, 4, 4)?]],
            custom_regions: vec![],
            global_multiplier: 1.0,
        };
        let weights = SessionWeights::build(&config, &plan, &Device::Cpu, DType::F32)?;
        let rescale = weights.rescale.flatten_all()?.to_vec1::<f32>()?;
        // Bottom-right quadrant is uncovered.
        assert_eq!(rescale[7 * 8 + 7], 0.0);
        assert!(rescale[0] > 0.0);
        Ok(())
    }

    #[test]
    fn test_zero_weight_region_violates_invariant() -> Result<()> {
        // A region whose multiplier is zero contributes coverage but no
        // weight; if nothing else covers those pixels the field cannot be
        // inverted and setup must fail.
        let device = Device::Cpu;
        let config = BlendConfig::default();
        let cond = Tensor::zeros((1, 4, 8), DType::F32, &device)?;
        let plan = TilingPlan {
            canvas_height: 8,
            canvas_width: 8,
            grid_batches: vec![],
            custom_regions: vec![CustomRegion {
                bbox: TileBox::new(0, 0, 8, 8)?,
                cond: cond.clone(),
                uncond: cond,
                weight: 0.0,
            }],
            global_multiplier: 0.0,
        };
        assert!(SessionWeights::build(&config, &plan, &device, DType::F32).is_err());
        Ok(())
    }
}
