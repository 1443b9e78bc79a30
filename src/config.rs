//! Session configuration for tiled latent blending.

use serde::Deserialize;

use crate::adapter::SamplerProtocol;

/// Configuration fixed for the lifetime of one generation session.
///
/// Tile dimensions are latent-space sizes (canvas pixels / VAE compression
/// ratio). The grid mask and normalization fields are derived from these
/// values once at session setup, so changing them mid-session is not
/// supported; build a new session instead.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BlendConfig {
    /// Height of every grid tile in latent units (default: 96).
    #[serde(default = "default_tile_height")]
    pub tile_height: usize,

    /// Width of every grid tile in latent units (default: 96).
    #[serde(default = "default_tile_width")]
    pub tile_width: usize,

    /// Calling convention of the sampler driving the session.
    #[serde(default)]
    pub protocol: SamplerProtocol,
}

fn default_tile_height() -> usize {
    96
}
fn default_tile_width() -> usize {
    96
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            tile_height: default_tile_height(),
            tile_width: default_tile_width(),
            protocol: SamplerProtocol::default(),
        }
    }
}

impl BlendConfig {
    /// Load a configuration from its JSON representation.
    pub fn from_json(json: &str) -> candle::Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(candle::Error::wrap)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> candle::Result<()> {
        if self.tile_height == 0 || self.tile_width == 0 {
            candle::bail!(
                "tile size {}x{} must be non-zero",
                self.tile_height,
                self.tile_width
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BlendConfig::default();
        assert_eq!(config.tile_height, 96);
        assert_eq!(config.tile_width, 96);
        assert_eq!(config.protocol, SamplerProtocol::KDiffusion);
    }

    #[test]
    fn test_from_json() -> candle::Result<()> {
        let config = BlendConfig::from_json(r#"{"tile_height": 64, "protocol": "ddim"}"#)?;
        assert_eq!(config.tile_height, 64);
        // Unset fields fall back to defaults.
        assert_eq!(config.tile_width, 96);
        assert_eq!(config.protocol, SamplerProtocol::Ddim);

        assert!(BlendConfig::from_json(r#"{"tile_width": 0}"#).is_err());
        Ok(())
    }
}
