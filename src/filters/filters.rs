// SPDX-License-Identifier: GPL-2.0-or-later

pub mod ops;
mod pipeline;

pub use pipeline::ImagePipeline;

use image::{GrayImage, RgbImage};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("accelerator unavailable")]
    Unavailable,

    #[error("{0}")]
    Backend(String),
}

/// One set of filter primitives. Implementations may be backed by an
/// accelerator; a failed call must leave the input untouched so the caller
/// can retry on another backend.
pub trait FilterBackend: Send + Sync {
    fn denoise(&self, frame: &RgbImage, strength: f32) -> Result<RgbImage, FilterError>;
    fn scale(&self, frame: &RgbImage, factor: f32) -> Result<RgbImage, FilterError>;
    fn sharpen(&self, frame: &RgbImage) -> Result<RgbImage, FilterError>;
    fn gaussian_gray(&self, frame: &GrayImage, sigma: f32) -> Result<GrayImage, FilterError>;
    fn box_blur(&self, frame: &RgbImage, radius: u32) -> Result<RgbImage, FilterError>;
}

pub type ArcFilterBackend = Arc<dyn FilterBackend>;

/// Software implementation. Never fails.
pub struct CpuBackend;

impl FilterBackend for CpuBackend {
    fn denoise(&self, frame: &RgbImage, strength: f32) -> Result<RgbImage, FilterError> {
        Ok(ops::nl_means_denoise(frame, strength))
    }
    fn scale(&self, frame: &RgbImage, factor: f32) -> Result<RgbImage, FilterError> {
        Ok(ops::scale_bicubic(frame, factor))
    }
    fn sharpen(&self, frame: &RgbImage) -> Result<RgbImage, FilterError> {
        Ok(ops::sharpen(frame))
    }
    fn gaussian_gray(&self, frame: &GrayImage, sigma: f32) -> Result<GrayImage, FilterError> {
        Ok(ops::gaussian_blur_gray(frame, sigma))
    }
    fn box_blur(&self, frame: &RgbImage, radius: u32) -> Result<RgbImage, FilterError> {
        Ok(ops::box_blur(frame, radius))
    }
}

/// Per-call backend selection: try the accelerated primary when present,
/// degrade to the CPU for that call on any error. A single stage failing
/// never aborts the pipeline.
pub struct SelectiveBackend {
    primary: Option<ArcFilterBackend>,
    cpu: CpuBackend,
}

impl SelectiveBackend {
    #[must_use]
    pub fn new(primary: Option<ArcFilterBackend>) -> Arc<Self> {
        Arc::new(Self {
            primary,
            cpu: CpuBackend {},
        })
    }

    #[must_use]
    pub fn cpu_only() -> Arc<Self> {
        Self::new(None)
    }

    fn select<T>(
        &self,
        primary: impl Fn(&dyn FilterBackend) -> Result<T, FilterError>,
        cpu: impl Fn(&CpuBackend) -> Result<T, FilterError>,
    ) -> T {
        if let Some(backend) = &self.primary {
            if let Ok(v) = primary(backend.as_ref()) {
                return v;
            }
        }
        cpu(&self.cpu).expect("cpu backend is infallible")
    }

    #[must_use]
    pub fn denoise(&self, frame: &RgbImage, strength: f32) -> RgbImage {
        self.select(|b| b.denoise(frame, strength), |b| b.denoise(frame, strength))
    }

    #[must_use]
    pub fn scale(&self, frame: &RgbImage, factor: f32) -> RgbImage {
        self.select(|b| b.scale(frame, factor), |b| b.scale(frame, factor))
    }

    #[must_use]
    pub fn sharpen(&self, frame: &RgbImage) -> RgbImage {
        self.select(|b| b.sharpen(frame), |b| b.sharpen(frame))
    }

    #[must_use]
    pub fn gaussian_gray(&self, frame: &GrayImage, sigma: f32) -> GrayImage {
        self.select(
            |b| b.gaussian_gray(frame, sigma),
            |b| b.gaussian_gray(frame, sigma),
        )
    }

    #[must_use]
    pub fn box_blur(&self, frame: &RgbImage, radius: u32) -> RgbImage {
        self.select(|b| b.box_blur(frame, radius), |b| b.box_blur(frame, radius))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Backend that always fails, standing in for a broken accelerator.
    struct BrokenBackend;

    impl FilterBackend for BrokenBackend {
        fn denoise(&self, _: &RgbImage, _: f32) -> Result<RgbImage, FilterError> {
            Err(FilterError::Unavailable)
        }
        fn scale(&self, _: &RgbImage, _: f32) -> Result<RgbImage, FilterError> {
            Err(FilterError::Unavailable)
        }
        fn sharpen(&self, _: &RgbImage) -> Result<RgbImage, FilterError> {
            Err(FilterError::Unavailable)
        }
        fn gaussian_gray(&self, _: &GrayImage, _: f32) -> Result<GrayImage, FilterError> {
            Err(FilterError::Unavailable)
        }
        fn box_blur(&self, _: &RgbImage, _: u32) -> Result<RgbImage, FilterError> {
            Err(FilterError::Unavailable)
        }
    }

    #[test]
    fn broken_primary_degrades_to_cpu() {
        let primary: ArcFilterBackend = Arc::new(BrokenBackend {});
        let backend = SelectiveBackend::new(Some(primary));
        let img = RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        // Flat image survives a box blur unchanged, proving the CPU path ran.
        assert_eq!(img, backend.box_blur(&img, 2));
        assert_eq!((8, 8), backend.scale(&img, 2.0).dimensions());
    }
}
