// SPDX-License-Identifier: GPL-2.0-or-later

use common::{config::BlurSettings, Roi};

/// Extra pixels added to the font size to get the text height.
const TEXT_HEIGHT_PAD: u32 = 4;

/// Default distance of the caption baseline from the bottom edge.
const DEFAULT_BASELINE_OFFSET: u32 = 50;

fn is_wide_char(c: char) -> bool {
    // East-Asian wide and fullwidth blocks: CJK unified, kana, hangul,
    // fullwidth forms.
    matches!(c,
        '\u{4e00}'..='\u{9fa5}'
        | '\u{3040}'..='\u{30ff}'
        | '\u{ac00}'..='\u{d7af}'
        | '\u{ff00}'..='\u{ffef}')
}

fn char_weight(c: char) -> f64 {
    if is_wide_char(c) {
        1.1
    } else if "mwWM@OQG".contains(c) {
        0.95
    } else if c.is_ascii_uppercase() {
        0.8
    } else if c.is_ascii_digit() {
        0.65
    } else if "il1.,!I|:;tfj".contains(c) {
        0.35
    } else {
        0.65
    }
}

/// Conservative pixel width of rendered text from per-character weights.
/// Monotonic in the font size.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn estimate_text_width(text: &str, font_size: u32, width_multiplier: f32) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let weight: f64 = text.chars().map(char_weight).sum();
    (weight * f64::from(font_size) * f64::from(width_multiplier)).ceil() as u32
}

/// Bounding box of the caption band for the given text, centered
/// horizontally and clamped to the frame. Empty text yields a zero ROI.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn calculate_blur_roi(text: &str, width: u32, height: u32, settings: &BlurSettings) -> Roi {
    if text.is_empty() {
        return Roi::default();
    }

    let y_pos = i64::from(
        settings
            .y
            .unwrap_or_else(|| height.saturating_sub(DEFAULT_BASELINE_OFFSET)),
    );
    let text_h = i64::from(settings.font_size + TEXT_HEIGHT_PAD);
    let text_w = i64::from(estimate_text_width(
        text,
        settings.font_size,
        settings.width_multiplier,
    ));

    let padding_x = i64::from(settings.padding_x);
    #[allow(clippy::cast_precision_loss)]
    let padding_y = (text_h as f64 * f64::from(settings.padding_y)) as i64;

    let x = (i64::from(width) - text_w) / 2;
    let y = y_pos - text_h;

    let left = x - padding_x;
    let top = y - padding_y;
    let right = left + text_w + padding_x * 2;
    let bottom = top + text_h + padding_y * 2;

    let final_x = left.max(0);
    let final_y = top.max(0);
    let final_w = (right.min(i64::from(width)) - final_x).max(0);
    let final_h = (bottom.min(i64::from(height)) - final_y).max(0);

    Roi::new(
        final_x as u32,
        final_y as u32,
        final_w as u32,
        final_h as u32,
    )
}
