//! Denoiser calling conventions and conditioning packaging.
//!
//! The denoiser itself is opaque: a function from (noisy latent batch,
//! timestep batch, conditioning) to a predicted noise batch of the same
//! shape. Samplers differ in how conditioning reaches that function:
//!
//! - **k-diffusion style** samplers hand over a single conditioning bundle
//!   and the model call is a straight pass-through.
//! - **DDIM style** samplers run classifier-free guidance by stacking the
//!   unconditional and conditional entries of every conditioning key along
//!   the batch axis before the call.
//!
//! The convention is fixed once per session; blending code goes through
//! [`DenoiserAdapter::custom_forward`] and never branches on it.

use std::sync::Arc;

use candle::{Result, Tensor};
use serde::Deserialize;

use crate::region::TileBox;

/// The forward-noise-prediction interface of the underlying model.
///
/// The tiled engine both consumes this trait (to call the real model per
/// tile) and implements it (so samplers cannot tell the blended entry
/// point apart from the model it replaces).
pub trait NoiseModel: Send + Sync {
    fn apply(&self, x: &Tensor, t: &Tensor, cond: &Conditioning) -> Result<Tensor>;
}

/// Conditioning bundle passed to the denoiser.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// Text-derived cross-attention entries, `(batch, seq, dim)`. Never
    /// sliced spatially; broadcast unchanged to every tile.
    pub cross_attn: Tensor,
    /// Optional image-shaped conditioning, `(batch, channel, h, w)`.
    /// Sliced to each tile's extent when sized to the canvas, passed
    /// through untouched otherwise.
    pub image_cond: Option<Tensor>,
}

impl Conditioning {
    pub fn new(cross_attn: Tensor) -> Self {
        Self {
            cross_attn,
            image_cond: None,
        }
    }

    pub fn with_image(cross_attn: Tensor, image_cond: Tensor) -> Self {
        Self {
            cross_attn,
            image_cond: Some(image_cond),
        }
    }

    /// Image conditioning for one tile: canvas-sized conditioning is
    /// cropped to the box, anything else is reused as-is.
    pub(crate) fn crop_image_cond(
        &self,
        bbox: &TileBox,
        canvas_height: usize,
        canvas_width: usize,
    ) -> Result<Option<Tensor>> {
        match &self.image_cond {
            None => Ok(None),
            Some(image_cond) => {
                let (_, _, h, w) = image_cond.dims4()?;
                if h == canvas_height && w == canvas_width {
                    Ok(Some(bbox.crop(image_cond)?))
                } else {
                    Ok(Some(image_cond.clone()))
                }
            }
        }
    }
}

/// Side-channel informed immediately before denoiser invocations, so
/// external region-control mechanisms (control networks and the like) can
/// scope their per-call auxiliary state to the unit being denoised.
pub trait ControlHook: Send + Sync {
    /// Before each batched grid invocation: the batch index, the latent
    /// batch size per tile, and the number of tiles stacked into the call.
    fn on_grid_batch(&self, batch_index: usize, latent_batch: usize, tiles_in_batch: usize);

    /// Before each concat-style custom-region invocation: the region's
    /// index and the total batch size of the call.
    fn on_region(&self, region_id: usize, batch_size: usize);
}

/// Sampler calling convention, selected once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerProtocol {
    /// Single-bundle conditioning, k-diffusion samplers.
    #[default]
    KDiffusion,
    /// Classifier-free-guidance concatenation, DDIM-family samplers.
    Ddim,
}

/// Packages per-region denoiser calls into whichever convention the
/// session's sampler expects.
pub struct DenoiserAdapter {
    protocol: SamplerProtocol,
    control: Option<Arc<dyn ControlHook>>,
}

impl DenoiserAdapter {
    pub fn new(protocol: SamplerProtocol) -> Self {
        Self {
            protocol,
            control: None,
        }
    }

    pub fn with_control(protocol: SamplerProtocol, control: Arc<dyn ControlHook>) -> Self {
        Self {
            protocol,
            control: Some(control),
        }
    }

    pub fn protocol(&self) -> SamplerProtocol {
        self.protocol
    }

    pub(crate) fn notify_grid_batch(
        &self,
        batch_index: usize,
        latent_batch: usize,
        tiles_in_batch: usize,
    ) {
        if let Some(control) = &self.control {
            control.on_grid_batch(batch_index, latent_batch, tiles_in_batch);
        }
    }

    /// Uniform entry point for custom-region denoising; hides which
    /// convention is active.
    ///
    /// `cond`/`uncond` are the region's own conditioning entries;
    /// `canvas_cond` is the surrounding generation's bundle, consulted only
    /// for its image-shaped conditioning.
    #[allow(clippy::too_many_arguments)]
    pub fn custom_forward(
        &self,
        model: &dyn NoiseModel,
        x_tile: &Tensor,
        t: &Tensor,
        region_id: usize,
        bbox: &TileBox,
        cond: &Tensor,
        uncond: &Tensor,
        canvas_cond: &Conditioning,
        canvas_height: usize,
        canvas_width: usize,
    ) -> Result<Tensor> {
        let image_cond = canvas_cond.crop_image_cond(bbox, canvas_height, canvas_width)?;
        match self.protocol {
            SamplerProtocol::KDiffusion => {
                let c = Conditioning {
                    cross_attn: cond.clone(),
                    image_cond,
                };
                model.apply(x_tile, t, &c)
            }
            SamplerProtocol::Ddim => {
                // Unconditional entries first, then conditional, stacked
                // along the batch axis; the image conditioning is shared by
                // both halves.
                let cross_attn = Tensor::cat(&[uncond, cond], 0)?;
                let image_cond = match image_cond {
                    Some(ic) => Some(Tensor::cat(&[&ic, &ic], 0)?),
                    None => None,
                };
                if let Some(control) = &self.control {
                    control.on_region(region_id, x_tile.dim(0)?);
                }
                let c = Conditioning {
                    cross_attn,
                    image_cond,
                };
                model.apply(x_tile, t, &c)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};
    use std::sync::Mutex;

    struct Probe {
        seen: Mutex<Vec<(usize, usize, usize)>>,
    }

    impl NoiseModel for Probe {
        fn apply(&self, x: &Tensor, _t: &Tensor, cond: &Conditioning) -> Result<Tensor> {
            let ic = match &cond.image_cond {
                Some(ic) => ic.dim(3)?,
                None => 0,
            };
            self.seen
                .lock()
                .unwrap()
                .push((x.dim(0)?, cond.cross_attn.dim(0)?, ic));
            x.zeros_like()
        }
    }

    #[test]
    fn test_ddim_concatenates_uncond_then_cond() -> Result<()> {
        let device = Device::Cpu;
        let adapter = DenoiserAdapter::new(SamplerProtocol::Ddim);
        let probe = Probe {
            seen: Mutex::new(vec![]),
        };

        let x = Tensor::zeros((2, 4, 8, 8), DType::F32, &device)?;
        let t = Tensor::zeros(2, DType::F32, &device)?;
        let cond = Tensor::ones((1, 3, 16), DType::F32, &device)?;
        let uncond = Tensor::zeros((1, 3, 16), DType::F32, &device)?;
        let bbox = TileBox::new(0, 0, 8, 8)?;
        let canvas = Conditioning::new(cond.clone());

        adapter.custom_forward(&probe, &x, &t, 0, &bbox, &cond, &uncond, &canvas, 16, 16)?;
        let seen = probe.seen.lock().unwrap();
        // Latent batch untouched, conditioning doubled by the concat.
        assert_eq!(seen[0], (2, 2, 0));
        Ok(())
    }

    #[test]
    fn test_image_cond_cropped_only_when_canvas_sized() -> Result<()> {
        let device = Device::Cpu;
        let cross = Tensor::zeros((1, 3, 16), DType::F32, &device)?;
        let bbox = TileBox::new(0, 0, 4, 4)?;

        let canvas_sized = Conditioning::with_image(
            cross.clone(),
            Tensor::zeros((1, 3, 8, 8), DType::F32, &device)?,
        );
        let cropped = canvas_sized.crop_image_cond(&bbox, 8, 8)?.unwrap();
        assert_eq!(cropped.dims(), &[1, 3, 4, 4]);

        let pre_sliced = Conditioning::with_image(
            cross,
            Tensor::zeros((1, 3, 2, 2), DType::F32, &device)?,
        );
        let passed = pre_sliced.crop_image_cond(&bbox, 8, 8)?.unwrap();
        assert_eq!(passed.dims(), &[1, 3, 2, 2]);
        Ok(())
    }
}
