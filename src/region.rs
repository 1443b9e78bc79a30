//! Region geometry for tiled denoising.
//!
//! The surrounding tiling pass decides where tiles go; this module only
//! represents that geometry and validates it against the session
//! configuration. Two kinds of unit exist:
//!
//! - **Grid tiles**: equal-sized boxes covering the whole canvas, grouped
//!   into batches so several tiles share one denoiser invocation. They all
//!   use the prompt conditioning of the surrounding generation.
//! - **Custom regions**: user-declared boxes carrying their own prompt
//!   conditioning and a blend multiplier. They are denoised one at a time,
//!   after the grid.

use candle::{IndexOp, Result, Tensor};

use crate::config::BlendConfig;

/// Axis-aligned rectangle in latent canvas coordinates, half-open on the
/// upper bounds (`x0..x1`, `y0..y1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBox {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl TileBox {
    pub fn new(x0: usize, y0: usize, x1: usize, y1: usize) -> Result<Self> {
        if x1 <= x0 || y1 <= y0 {
            candle::bail!("degenerate tile box ({x0}, {y0}, {x1}, {y1})");
        }
        Ok(Self { x0, y0, x1, y1 })
    }

    pub fn width(&self) -> usize {
        self.x1 - self.x0
    }

    pub fn height(&self) -> usize {
        self.y1 - self.y0
    }

    /// Slice this box out of a canvas-shaped NCHW tensor.
    ///
    /// The result is made contiguous: crops feed straight into `cat` and
    /// model calls, which expect packed layouts.
    pub fn crop(&self, canvas: &Tensor) -> Result<Tensor> {
        canvas
            .i((.., .., self.y0..self.y1, self.x0..self.x1))?
            .contiguous()
    }

    pub(crate) fn check_within(&self, canvas_height: usize, canvas_width: usize) -> Result<()> {
        if self.x1 > canvas_width || self.y1 > canvas_height {
            candle::bail!(
                "tile box ({}, {}, {}, {}) exceeds the {}x{} canvas",
                self.x0,
                self.y0,
                self.x1,
                self.y1,
                canvas_height,
                canvas_width
            );
        }
        Ok(())
    }
}

/// A user-declared region denoised with its own prompt.
///
/// `cond`/`uncond` are the region's cross-attention conditioning entries.
/// `weight` scales the region's Gaussian mask against the global grid
/// contribution; regions and grid share one normalization field, so a
/// heavier weight pulls covered pixels towards the region's prediction.
#[derive(Debug, Clone)]
pub struct CustomRegion {
    pub bbox: TileBox,
    pub cond: Tensor,
    pub uncond: Tensor,
    pub weight: f64,
}

/// Tile geometry for one generation session, supplied by the surrounding
/// tiling pass before the first denoising step. Immutable once built.
#[derive(Debug, Clone)]
pub struct TilingPlan {
    /// Latent canvas height.
    pub canvas_height: usize,
    /// Latent canvas width.
    pub canvas_width: usize,
    /// Grid tile boxes, pre-grouped into denoiser batches.
    pub grid_batches: Vec<Vec<TileBox>>,
    /// Regions with independent conditioning, processed after the grid.
    pub custom_regions: Vec<CustomRegion>,
    /// Blend factor for the grid contribution when custom regions are
    /// present; a value <= 0 disables the grid pass entirely.
    pub global_multiplier: f64,
}

impl TilingPlan {
    /// Check the plan against the session's configured tile geometry.
    pub fn validate(&self, config: &BlendConfig) -> Result<()> {
        config.validate()?;
        if self.canvas_height == 0 || self.canvas_width == 0 {
            candle::bail!(
                "empty latent canvas {}x{}",
                self.canvas_height,
                self.canvas_width
            );
        }
        for bbox in self.grid_batches.iter().flatten() {
            bbox.check_within(self.canvas_height, self.canvas_width)?;
            if bbox.width() != config.tile_width || bbox.height() != config.tile_height {
                candle::bail!(
                    "grid tile ({}, {}, {}, {}) is {}x{}, session expects {}x{}",
                    bbox.x0,
                    bbox.y0,
                    bbox.x1,
                    bbox.y1,
                    bbox.height(),
                    bbox.width(),
                    config.tile_height,
                    config.tile_width
                );
            }
        }
        for region in &self.custom_regions {
            region.bbox.check_within(self.canvas_height, self.canvas_width)?;
            if !region.weight.is_finite() {
                candle::bail!("non-finite region weight {}", region.weight);
            }
        }
        Ok(())
    }

    /// Total number of grid tiles across all batches.
    pub fn grid_tile_count(&self) -> usize {
        self.grid_batches.iter().map(|b| b.len()).sum()
    }

    /// Number of units a full pass will process, for progress reporting.
    pub fn unit_count(&self) -> usize {
        let grid = if self.global_multiplier > 0.0 {
            self.grid_tile_count()
        } else {
            0
        };
        grid + self.custom_regions.len()
    }
}
