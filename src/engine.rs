//! Canvas-wide noise prediction by tiled blending.
//!
//! [`TiledDenoiser`] wraps a fixed-capacity denoiser and answers the same
//! forward-noise-prediction call for a canvas larger than that capacity.
//! One prediction step runs as a linear pass:
//!
//! ```text
//! grid pass    -> every grid tile, batched, uniform conditioning
//! blend-down   -> buffer *= global multiplier (only with custom regions)
//! custom pass  -> every custom region, one by one, own conditioning
//! done         -> return the accumulated buffer
//! ```
//!
//! Each unit's prediction is multiplied by its Gaussian mask and the
//! canvas rescale field before being added into a zero-initialized output
//! buffer, so overlapping tiles average smoothly instead of seaming.
//!
//! Cancellation is cooperative: a [`CancelToken`] is polled at the start
//! of every grid batch and every region. Once it trips, no further model
//! calls are issued and the *input* latent is returned unchanged, so a
//! half-blended buffer is never presented as a valid prediction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle::{DType, Device, Result, Tensor};

use crate::adapter::{Conditioning, DenoiserAdapter, NoiseModel};
use crate::config::BlendConfig;
use crate::region::{TileBox, TilingPlan};
use crate::weights::SessionWeights;

/// Cooperative cancellation handle.
///
/// Clonable; the controller keeps one clone and trips it from wherever
/// interrupts surface. Polling happens only at documented checkpoints,
/// never preemptively.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag for a new generation.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Invoked once per processed tile or region as `(done, total)`.
pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// A denoiser that covers an oversized latent canvas by blending tiled
/// invocations of an inner model.
///
/// Implements [`NoiseModel`] itself, with the exact shape contract of the
/// model it wraps, so samplers drive it without knowing tiles exist.
pub struct TiledDenoiser {
    inner: Arc<dyn NoiseModel>,
    plan: TilingPlan,
    weights: SessionWeights,
    adapter: DenoiserAdapter,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
    span: tracing::Span,
}

impl TiledDenoiser {
    /// Validate the plan against the session configuration and precompute
    /// all weighting state. Fails fast on geometry mismatches.
    pub fn new(
        inner: Arc<dyn NoiseModel>,
        config: &BlendConfig,
        plan: TilingPlan,
        adapter: DenoiserAdapter,
        cancel: CancelToken,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        plan.validate(config)?;
        let weights = SessionWeights::build(config, &plan, device, dtype)?;
        tracing::debug!(
            canvas_h = plan.canvas_height,
            canvas_w = plan.canvas_width,
            tiles = plan.grid_tile_count(),
            regions = plan.custom_regions.len(),
            "tiled denoiser session ready"
        );
        Ok(Self {
            inner,
            plan,
            weights,
            adapter,
            cancel,
            progress: None,
            span: tracing::span!(tracing::Level::TRACE, "tiled-denoise"),
        })
    }

    /// Attach a per-unit progress callback.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn weights(&self) -> &SessionWeights {
        &self.weights
    }

    fn report_progress(&self, done: usize, total: usize) {
        if let Some(progress) = &self.progress {
            progress(done, total);
        }
    }

    /// One full noise-prediction pass over the canvas.
    ///
    /// Returns the blended prediction, or the input latent unchanged when
    /// cancellation is observed before any remaining model call.
    pub fn predict_noise(&self, x: &Tensor, t: &Tensor, cond: &Conditioning) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (batch, channels, height, width) = x.dims4()?;
        if height != self.plan.canvas_height || width != self.plan.canvas_width {
            candle::bail!(
                "canvas {}x{} does not match the session geometry {}x{}",
                height,
                width,
                self.plan.canvas_height,
                self.plan.canvas_width
            );
        }

        let mut buffer = Tensor::zeros((batch, channels, height, width), x.dtype(), x.device())?;
        let total = self.plan.unit_count();
        let mut done = 0usize;

        // Grid pass, skipped entirely when the global contribution is
        // disabled.
        if self.plan.global_multiplier > 0.0 {
            for (batch_index, boxes) in self.plan.grid_batches.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Ok(x.clone());
                }
                if boxes.is_empty() {
                    continue;
                }

                let mut x_tiles = Vec::with_capacity(boxes.len());
                let mut t_tiles = Vec::with_capacity(boxes.len());
                let mut attn_tiles = Vec::with_capacity(boxes.len());
                let mut image_tiles = Vec::with_capacity(boxes.len());
                for bbox in boxes {
                    x_tiles.push(bbox.crop(x)?);
                    t_tiles.push(t.clone());
                    attn_tiles.push(cond.cross_attn.clone());
                    if let Some(ic) = cond.crop_image_cond(bbox, height, width)? {
                        image_tiles.push(ic);
                    }
                }
                let x_tile = Tensor::cat(&x_tiles, 0)?;
                let t_tile = Tensor::cat(&t_tiles, 0)?;
                let c_tile = Conditioning {
                    cross_attn: Tensor::cat(&attn_tiles, 0)?,
                    image_cond: if image_tiles.is_empty() {
                        None
                    } else {
                        Some(Tensor::cat(&image_tiles, 0)?)
                    },
                };

                self.adapter
                    .notify_grid_batch(batch_index, batch, boxes.len());
                let out = self.inner.apply(&x_tile, &t_tile, &c_tile)?;

                for (i, bbox) in boxes.iter().enumerate() {
                    let tile_out = out.narrow(0, i * batch, batch)?;
                    let scaled = tile_out.broadcast_mul(&self.weights.grid_scale(bbox)?)?;
                    buffer = add_into(buffer, bbox, &scaled)?;
                    done += 1;
                    self.report_progress(done, total);
                }
            }
        }

        if !self.plan.custom_regions.is_empty() {
            // Scale the whole grid contribution down exactly once, so it is
            // not counted at full weight where regions override it.
            let multiplier = self.plan.global_multiplier;
            if multiplier > 0.0 && (multiplier - 1.0).abs() > 1e-6 {
                buffer = (buffer * multiplier)?;
            }

            for (region_id, region) in self.plan.custom_regions.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Ok(x.clone());
                }
                let x_tile = region.bbox.crop(x)?;
                let out = self.adapter.custom_forward(
                    self.inner.as_ref(),
                    &x_tile,
                    t,
                    region_id,
                    &region.bbox,
                    &region.cond,
                    &region.uncond,
                    cond,
                    height,
                    width,
                )?;
                let scaled =
                    out.broadcast_mul(&self.weights.region_scale(region_id, &region.bbox)?)?;
                buffer = add_into(buffer, &region.bbox, &scaled)?;
                done += 1;
                self.report_progress(done, total);
            }
        }

        Ok(buffer)
    }
}

impl NoiseModel for TiledDenoiser {
    fn apply(&self, x: &Tensor, t: &Tensor, cond: &Conditioning) -> Result<Tensor> {
        self.predict_noise(x, t, cond)
    }
}

fn add_into(buffer: Tensor, bbox: &TileBox, delta: &Tensor) -> Result<Tensor> {
    let (b, c, _h, _w) = buffer.dims4()?;
    let current = bbox.crop(&buffer)?;
    buffer.slice_assign(
        &[0..b, 0..c, bbox.y0..bbox.y1, bbox.x0..bbox.x1],
        &(current + delta)?,
    )
}
