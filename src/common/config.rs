// SPDX-License-Identifier: GPL-2.0-or-later

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Performance/quality trade-off supplying pipeline defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    Balance,
    Speed,
    Quality,
}

impl Preset {
    #[must_use]
    pub fn config(self) -> PipelineConfig {
        match self {
            Preset::Balance => PipelineConfig {
                step: 2,
                min_conf: 0.8,
                smart_skip: true,
                denoise_strength: 3.0,
                scale_factor: 2.0,
                conf_threshold: 0.5,
            },
            Preset::Speed => PipelineConfig {
                step: 4,
                min_conf: 0.7,
                smart_skip: true,
                denoise_strength: 0.0,
                scale_factor: 1.5,
                conf_threshold: 0.5,
            },
            Preset::Quality => PipelineConfig {
                step: 1,
                min_conf: 0.85,
                smart_skip: false,
                denoise_strength: 5.0,
                scale_factor: 2.5,
                conf_threshold: 0.5,
            },
        }
    }
}

/// Fully resolved processing configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PipelineConfig {
    /// Process every n-th frame.
    pub step: u32,

    /// Minimum confidence for the aggregator to accept a result.
    pub min_conf: f32,

    /// Reuse the previous OCR result when the region is visually unchanged.
    pub smart_skip: bool,

    /// Non-local-means strength. Zero disables the filter.
    pub denoise_strength: f32,

    /// Bicubic upscale factor. One disables the filter.
    pub scale_factor: f32,

    /// Per-box confidence filter inside result parsing.
    pub conf_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Preset::Balance.config()
    }
}

/// Explicit per-request overrides. Only the enumerated keys are honored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineOverrides {
    pub step: Option<u32>,
    pub min_conf: Option<f32>,
    pub smart_skip: Option<bool>,
    pub denoise_strength: Option<f32>,
    pub scale_factor: Option<f32>,
    pub conf_threshold: Option<f32>,
}

#[derive(Debug, Error, PartialEq)]
pub enum InvalidConfigError {
    #[error("step out of range [1,10]: {0}")]
    Step(u32),

    #[error("min_conf out of range [0,1]: {0}")]
    MinConf(f32),

    #[error("denoise_strength out of range [0,10]: {0}")]
    DenoiseStrength(f32),

    #[error("scale_factor out of range [1,4]: {0}")]
    ScaleFactor(f32),

    #[error("conf_threshold out of range [0,1]: {0}")]
    ConfThreshold(f32),
}

impl PipelineOverrides {
    /// Applies the overrides on top of the preset defaults and validates the
    /// result.
    pub fn resolve(self, preset: Preset) -> Result<PipelineConfig, InvalidConfigError> {
        use InvalidConfigError::*;
        let mut config = preset.config();
        if let Some(v) = self.step {
            config.step = v;
        }
        if let Some(v) = self.min_conf {
            config.min_conf = v;
        }
        if let Some(v) = self.smart_skip {
            config.smart_skip = v;
        }
        if let Some(v) = self.denoise_strength {
            config.denoise_strength = v;
        }
        if let Some(v) = self.scale_factor {
            config.scale_factor = v;
        }
        if let Some(v) = self.conf_threshold {
            config.conf_threshold = v;
        }

        if !(1..=10).contains(&config.step) {
            return Err(Step(config.step));
        }
        if !(0.0..=1.0).contains(&config.min_conf) {
            return Err(MinConf(config.min_conf));
        }
        if !(0.0..=10.0).contains(&config.denoise_strength) {
            return Err(DenoiseStrength(config.denoise_strength));
        }
        if !(1.0..=4.0).contains(&config.scale_factor) {
            return Err(ScaleFactor(config.scale_factor));
        }
        if !(0.0..=1.0).contains(&config.conf_threshold) {
            return Err(ConfThreshold(config.conf_threshold));
        }
        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlurMode {
    Blur,
    #[default]
    Hybrid,
}

/// Settings for the obscuring renderer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurSettings {
    pub mode: BlurMode,

    /// Baseline pixel row of the caption. Defaults to `height - 50`.
    pub y: Option<u32>,

    pub font_size: u32,
    pub padding_x: u32,

    /// Vertical padding as a multiplier of the text height.
    pub padding_y: f32,

    /// Box-filter half-width.
    pub sigma: u32,

    /// Feather radius in pixels.
    pub feather: u32,

    pub width_multiplier: f32,

    /// Global blend strength of the blurred region.
    pub alpha: f32,
}

impl Default for BlurSettings {
    fn default() -> Self {
        Self {
            mode: BlurMode::Hybrid,
            y: None,
            font_size: 21,
            padding_x: 40,
            padding_y: 2.0,
            sigma: 5,
            feather: 30,
            width_multiplier: 1.0,
            alpha: 1.0,
        }
    }
}
