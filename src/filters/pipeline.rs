// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{ops, SelectiveBackend};
use common::{config::PipelineConfig, Roi};
use image::RgbImage;
use std::sync::Arc;

/// Change detection constants: 5x5 Gaussian, absolute difference threshold,
/// and the maximum number of changed pixels still considered static.
const MOTION_BLUR_KSIZE: u32 = 5;
const MOTION_DIFF_THRESH: u8 = 15;
const MOTION_PIXEL_COUNT_THRESH: u64 = 15;

/// Per-frame processing: ROI crop, smart-skip change detection, denoise,
/// upscale, sharpen. Owns the previous raw region for the skip heuristic.
pub struct ImagePipeline {
    roi: Roi,
    config: PipelineConfig,
    backend: Arc<SelectiveBackend>,
    last_raw_roi: Option<RgbImage>,
    skipped_count: u64,
}

impl ImagePipeline {
    #[must_use]
    pub fn new(roi: Roi, config: PipelineConfig, backend: Arc<SelectiveBackend>) -> Self {
        Self {
            roi,
            config,
            backend,
            last_raw_roi: None,
            skipped_count: 0,
        }
    }

    #[must_use]
    pub fn skipped_count(&self) -> u64 {
        self.skipped_count
    }

    /// Runs the pipeline. `(None, true)` means the frame was skipped and the
    /// previous OCR result should be reused.
    #[must_use]
    pub fn process(&mut self, frame: &RgbImage) -> (Option<RgbImage>, bool) {
        let Some(rect) = self.roi.clamp_to(frame.width(), frame.height()) else {
            return (None, true);
        };
        let region =
            image::imageops::crop_imm(frame, rect.x, rect.y, rect.w, rect.h).to_image();

        if self.config.smart_skip {
            if let Some(last) = &self.last_raw_roi {
                if last.dimensions() == region.dimensions() && !self.changed(last, &region) {
                    self.skipped_count += 1;
                    return (None, true);
                }
            }
            self.last_raw_roi = Some(region.clone());
        }

        let mut out = region;
        if self.config.denoise_strength > 0.0 {
            out = self.backend.denoise(&out, self.config.denoise_strength);
        }
        if (self.config.scale_factor - 1.0).abs() > f32::EPSILON {
            out = self.backend.scale(&out, self.config.scale_factor);
        }
        out = self.backend.sharpen(&out);

        (Some(out), false)
    }

    /// Absolute change detection between the current and previous region.
    fn changed(&self, last: &RgbImage, current: &RgbImage) -> bool {
        let sigma = ops::sigma_for_kernel(MOTION_BLUR_KSIZE);
        let a = self.backend.gaussian_gray(&ops::grayscale(last), sigma);
        let b = self.backend.gaussian_gray(&ops::grayscale(current), sigma);
        ops::changed_pixel_count(&a, &b, MOTION_DIFF_THRESH) > MOTION_PIXEL_COUNT_THRESH
    }
}
