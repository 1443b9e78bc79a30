//! Tiled latent blending for high-resolution diffusion inference.
//!
//! Denoising models have a fixed latent capacity; generating past it means
//! either running out of memory or degrading quality. This crate lets a
//! sampler drive an oversized latent canvas anyway: the canvas is split
//! into overlapping tiles, the model is invoked per tile, and the per-tile
//! noise predictions are fused back into one canvas-sized prediction under
//! smooth Gaussian weighting, so tile borders never show up as seams.
//!
//! # Pipeline
//!
//! ```text
//! canvas latent ──┬─> grid tiles (batched, shared conditioning) ──┐
//!                 │                                               ├─> x mask x rescale ─> Σ buffer
//!                 └─> custom regions (own conditioning, serial) ──┘
//! ```
//!
//! - [`weights`] synthesizes the per-tile Gaussian masks and the canvas
//!   normalization fields.
//! - [`region`] carries the tile/region geometry supplied by the
//!   surrounding tiling pass.
//! - [`adapter`] packages conditioning for the sampler family in use and
//!   notifies auxiliary control mechanisms before each model call.
//! - [`engine`] runs one blended prediction pass with cooperative
//!   cancellation and progress reporting.
//! - [`hook`] scopes the substitution of the model's forward function to a
//!   session, with guaranteed restoration.
//!
//! # Usage
//!
//! ```ignore
//! let engine = TiledDenoiser::new(
//!     model.clone(),
//!     &config,
//!     plan,
//!     DenoiserAdapter::new(config.protocol),
//!     cancel.clone(),
//!     &device,
//!     DType::F32,
//! )?;
//! handle.install(&notifier, move |_original| Arc::new(engine));
//! // ... sampler steps run against handle.current() ...
//! notifier.notify_session_end(); // restores the plain model
//! ```

pub mod adapter;
pub mod config;
pub mod engine;
pub mod hook;
pub mod region;
pub mod weights;

pub use adapter::{Conditioning, ControlHook, DenoiserAdapter, NoiseModel, SamplerProtocol};
pub use config::BlendConfig;
pub use engine::{CancelToken, ProgressCallback, TiledDenoiser};
pub use hook::{ModelHandle, SessionNotifier};
pub use region::{CustomRegion, TileBox, TilingPlan};
pub use weights::{gaussian_weights, gaussian_weights_tensor, SessionWeights};
