// SPDX-License-Identifier: GPL-2.0-or-later

use common::{
    config::{BlurMode, BlurSettings},
    Roi,
};
use filters::{
    ops::{self, MaskF32},
    SelectiveBackend,
};
use image::{GrayImage, RgbImage};

/// Binarization threshold applied to the morphological gradient.
const GRADIENT_THRESH: u8 = 25;

/// Number of successive box-filter passes for the regional blur.
const BOX_PASSES: u32 = 3;

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn font_scaled(font_size: u32, factor: f32, floor: u32) -> u32 {
    ((f64::from(font_size) * f64::from(factor)) as u32).max(floor)
}

/// Builds the glyph mask for one region: morphological gradient on
/// luminance, binarization, closing to fill strokes, and a dilation to
/// cover anti-aliased fringes. Returns `None` when the region is empty.
#[must_use]
pub fn generate_text_mask(frame: &RgbImage, roi: Roi, font_size: u32) -> Option<GrayImage> {
    let rect = roi.clamp_to(frame.width(), frame.height())?;
    let region = image::imageops::crop_imm(frame, rect.x, rect.y, rect.w, rect.h).to_image();
    let gray = ops::grayscale(&region);

    let grad = ops::morph_gradient(&gray, &ops::StructElement::rect(3));
    let mask = ops::threshold_binary(&grad, GRADIENT_THRESH);

    let close_k = font_scaled(font_size, 0.5, 5);
    let mask = ops::morph_close(&mask, &ops::StructElement::rect(close_k));

    let dilate_k = font_scaled(font_size, 0.6, 9);
    Some(ops::dilate(&mask, &ops::StructElement::ellipse(dilate_k)))
}

/// Obscures `roi` in place. `text_mask` is the precomputed glyph mask for
/// hybrid mode; when absent (or stale) it is generated from this frame.
pub fn apply_blur_to_frame(
    frame: &mut RgbImage,
    roi: Roi,
    settings: &BlurSettings,
    text_mask: Option<&GrayImage>,
    backend: &SelectiveBackend,
) {
    if roi.w == 0 || roi.h == 0 {
        return;
    }
    let Some(rect) = roi.clamp_to(frame.width(), frame.height()) else {
        return;
    };

    if settings.mode == BlurMode::Hybrid {
        let generated;
        let mask = match text_mask {
            Some(mask) if mask.dimensions() == (rect.w, rect.h) => Some(mask),
            _ => {
                generated = generate_text_mask(frame, rect, settings.font_size);
                generated.as_ref()
            }
        };
        if let Some(mask) = mask {
            hybrid_inpaint(frame, rect, mask, settings.font_size);
        }
    }

    let region = image::imageops::crop_imm(frame, rect.x, rect.y, rect.w, rect.h).to_image();
    let mut blurred = region.clone();
    for _ in 0..BOX_PASSES {
        blurred = backend.box_blur(&blurred, settings.sigma);
    }

    feather_composite(
        frame,
        rect,
        &region,
        &blurred,
        settings.feather,
        settings.alpha,
    );
}

/// Text-aware reconstruction: inpaints the glyphs inside an expanded
/// region, softens the result, and blends it back through a feathered
/// alpha mask so the repair disappears into the frame.
fn hybrid_inpaint(frame: &mut RgbImage, rect: Roi, mask: &GrayImage, font_size: u32) {
    let pad = font_scaled(font_size, 0.5, 15);
    let (fw, fh) = frame.dimensions();

    let x1 = rect.x.saturating_sub(pad);
    let y1 = rect.y.saturating_sub(pad);
    let x2 = (rect.x + rect.w + pad).min(fw);
    let y2 = (rect.y + rect.h + pad).min(fh);
    let (ew, eh) = (x2 - x1, y2 - y1);
    if ew == 0 || eh == 0 {
        return;
    }

    let expanded = image::imageops::crop_imm(frame, x1, y1, ew, eh).to_image();

    let mut local_mask = GrayImage::new(ew, eh);
    image::imageops::replace(
        &mut local_mask,
        mask,
        i64::from(rect.x - x1),
        i64::from(rect.y - y1),
    );

    let radius = font_scaled(font_size, 0.3, 5);
    let inpainted = ops::inpaint_diffusion(&expanded, &local_mask, radius);

    let blur_k = ops::odd(font_scaled(font_size, 0.8, 11));
    let softened = ops::gaussian_blur_rgb(&inpainted, ops::sigma_for_kernel(blur_k));

    let alpha_k = ops::odd(font_scaled(font_size, 0.6, 9));
    let mut alpha = MaskF32::new(ew, eh);
    for (a, m) in alpha.pixels_mut().zip(local_mask.pixels()) {
        a.0[0] = f32::from(m.0[0]) / 255.0;
    }
    let alpha = ops::gaussian_blur_mask(&alpha, ops::sigma_for_kernel(alpha_k));

    blend_region(frame, x1, y1, &expanded, &softened, &alpha, 1.0);
}

/// Blends `blurred` over the region through a feathered rectangle mask.
/// The inset collapses on sides where the region touches the frame edge so
/// the mask extends all the way out.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn feather_composite(
    frame: &mut RgbImage,
    rect: Roi,
    original: &RgbImage,
    blurred: &RgbImage,
    feather: u32,
    alpha: f32,
) {
    let (fw, fh) = frame.dimensions();
    let eff = u32::min(
        feather,
        u32::min((rect.w as f32 * 0.45) as u32, (rect.h as f32 * 0.45) as u32),
    );

    let mask = if eff < 1 {
        MaskF32::from_pixel(rect.w, rect.h, image::Luma([1.0]))
    } else {
        let inset_left = if rect.x == 0 { 0 } else { eff };
        let inset_top = if rect.y == 0 { 0 } else { eff };
        let inset_right = if rect.x + rect.w >= fw { 0 } else { eff };
        let inset_bottom = if rect.y + rect.h >= fh { 0 } else { eff };

        let mut mask = MaskF32::new(rect.w, rect.h);
        for (x, y, p) in mask.enumerate_pixels_mut() {
            let inside = x >= inset_left
                && x < rect.w - inset_right
                && y >= inset_top
                && y < rect.h - inset_bottom;
            p.0[0] = if inside { 1.0 } else { 0.0 };
        }
        ops::gaussian_blur_mask(&mask, ops::sigma_for_kernel(ops::odd(eff)))
    };

    blend_region(frame, rect.x, rect.y, original, blurred, &mask, alpha);
}

/// `frame[region] = over * (mask * alpha) + under * (1 - mask * alpha)`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn blend_region(
    frame: &mut RgbImage,
    x0: u32,
    y0: u32,
    under: &RgbImage,
    over: &RgbImage,
    mask: &MaskF32,
    alpha: f32,
) {
    debug_assert_eq!(under.dimensions(), over.dimensions());
    debug_assert_eq!(under.dimensions(), mask.dimensions());
    for (x, y, m) in mask.enumerate_pixels() {
        let a = (m.0[0] * alpha).clamp(0.0, 1.0);
        let u = under.get_pixel(x, y);
        let o = over.get_pixel(x, y);
        let p = frame.get_pixel_mut(x0 + x, y0 + y);
        for c in 0..3 {
            let v = f32::from(o.0[c]) * a + f32::from(u.0[c]) * (1.0 - a);
            p.0[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
}
