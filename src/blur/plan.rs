// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{effects, geometry};
use common::{
    config::{BlurMode, BlurSettings},
    subtitle::SubtitleItem,
    Roi,
};
use filters::ops;
use image::{GrayImage, RgbImage};
use std::collections::HashMap;

/// Sample frames evaluated per cue when picking the best text mask.
const MASK_SAMPLES: u64 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanEntry {
    pub roi: Roi,
    pub subtitle_id: u32,
}

/// Frame index to the cue and region active on that frame. Each cue is
/// expanded by one frame on both ends to tolerate timestamp rounding.
pub type RenderPlan = HashMap<u64, PlanEntry>;

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn build_render_plan(
    subtitles: &[SubtitleItem],
    settings: &BlurSettings,
    width: u32,
    height: u32,
    fps: f64,
    total_frames: u64,
) -> RenderPlan {
    let mut plan = RenderPlan::new();
    for sub in subtitles {
        let text = sub.text.trim();
        if text.is_empty() {
            continue;
        }
        let roi = geometry::calculate_blur_roi(text, width, height, settings);

        #[allow(clippy::cast_possible_wrap)]
        let start_f = ((sub.start * fps) as i64 - 1).max(0);
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let end_f = (((sub.end * fps) as i64) + 1).max(0).min((total_frames + 5) as i64);

        #[allow(clippy::cast_sign_loss)]
        for index in start_f as u64..end_f as u64 {
            plan.insert(
                index,
                PlanEntry {
                    roi,
                    subtitle_id: sub.id,
                },
            );
        }
    }
    plan
}

/// Per-cue glyph masks. For every cue, up to five evenly spaced sample
/// frames are scored by the non-zero pixel count of their generated mask
/// and the densest one wins; that mask is reused for every frame of the cue
/// to stabilize the inpaint.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn precompute_best_masks(
    frame_at: &dyn Fn(u64) -> Option<RgbImage>,
    subtitles: &[SubtitleItem],
    settings: &BlurSettings,
    width: u32,
    height: u32,
    fps: f64,
    total_frames: u64,
) -> HashMap<u32, GrayImage> {
    let mut masks = HashMap::new();
    if settings.mode != BlurMode::Hybrid || total_frames == 0 {
        return masks;
    }

    for sub in subtitles {
        let text = sub.text.trim();
        if text.is_empty() {
            continue;
        }
        let roi = geometry::calculate_blur_roi(text, width, height, settings);

        let start_f = (sub.start * fps) as u64;
        let end_f = (sub.end * fps) as u64;
        let duration = end_f.saturating_sub(start_f);

        let samples: Vec<u64> = if duration <= MASK_SAMPLES {
            (start_f..end_f).collect()
        } else {
            let step = duration as f64 / MASK_SAMPLES as f64;
            (0..MASK_SAMPLES)
                .map(|i| start_f + (i as f64 * step) as u64)
                .collect()
        };

        let mut best: Option<(u64, GrayImage)> = None;
        for index in samples {
            let index = index.min(total_frames - 1);
            let Some(frame) = frame_at(index) else {
                continue;
            };
            let Some(mask) = effects::generate_text_mask(&frame, roi, settings.font_size) else {
                continue;
            };
            let pixels = ops::count_nonzero(&mask);
            if best.as_ref().map_or(true, |(max, _)| pixels > *max) {
                best = Some((pixels, mask));
            }
        }
        if let Some((_, mask)) = best {
            masks.insert(sub.id, mask);
        }
    }
    masks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cue(id: u32, start: f64, end: f64, text: &str) -> SubtitleItem {
        SubtitleItem {
            id,
            start,
            end,
            text: text.to_owned(),
            conf: 1.0,
        }
    }

    #[test]
    fn plan_covers_expanded_interval() {
        let settings = BlurSettings::default();
        let plan = build_render_plan(&[cue(1, 1.0, 2.0, "hello")], &settings, 640, 480, 25.0, 100);

        // [25 - 1, 50 + 1) frames.
        assert!(plan.contains_key(&24));
        assert!(plan.contains_key(&50));
        assert!(!plan.contains_key(&23));
        assert!(!plan.contains_key(&51));
        assert_eq!(1, plan[&24].subtitle_id);
    }

    #[test]
    fn plan_skips_empty_text() {
        let settings = BlurSettings::default();
        let plan = build_render_plan(&[cue(1, 0.0, 1.0, "   ")], &settings, 640, 480, 25.0, 100);
        assert!(plan.is_empty());
    }

    #[test]
    fn plan_clamps_to_video_end() {
        let settings = BlurSettings::default();
        let plan = build_render_plan(&[cue(1, 3.0, 100.0, "x y z")], &settings, 640, 480, 25.0, 100);
        assert!(plan.contains_key(&104));
        assert!(!plan.contains_key(&105));
    }

    #[test]
    fn best_mask_picks_densest_sample() {
        let settings = BlurSettings::default();

        // Frame 0 is blank; frame 50 carries a bright bar in the caption
        // band, producing a denser mask.
        let frame_at = |index: u64| -> Option<RgbImage> {
            let mut frame = RgbImage::from_pixel(640, 480, image::Rgb([20, 20, 20]));
            if index >= 50 {
                for y in 420..440 {
                    for x in 250..390 {
                        frame.put_pixel(x, y, image::Rgb([255, 255, 255]));
                    }
                }
            }
            Some(frame)
        };

        let masks = precompute_best_masks(
            &frame_at,
            &[cue(1, 0.0, 8.0, "some caption")],
            &settings,
            640,
            480,
            25.0,
            300,
        );
        let mask = masks.get(&1).expect("mask for cue 1");
        assert!(ops::count_nonzero(mask) > 0);
    }

    #[test]
    fn masks_skipped_outside_hybrid_mode() {
        let settings = BlurSettings {
            mode: BlurMode::Blur,
            ..Default::default()
        };
        let frame_at = |_: u64| Some(RgbImage::new(64, 48));
        let masks = precompute_best_masks(
            &frame_at,
            &[cue(1, 0.0, 1.0, "text")],
            &settings,
            64,
            48,
            25.0,
            100,
        );
        assert!(masks.is_empty());
    }
}
