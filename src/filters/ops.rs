// SPDX-License-Identifier: GPL-2.0-or-later

use image::{GrayImage, ImageBuffer, Luma, RgbImage};

pub type MaskF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Sigma a kernel-size-specified Gaussian resolves to when no explicit sigma
/// is given. Matches the usual `0.3*((k-1)*0.5 - 1) + 0.8` derivation.
#[must_use]
pub fn sigma_for_kernel(ksize: u32) -> f32 {
    #[allow(clippy::cast_precision_loss)]
    let k = ksize as f32;
    (0.3 * ((k - 1.0) * 0.5 - 1.0) + 0.8).max(0.1)
}

/// Forces a kernel size odd, rounding up.
#[must_use]
pub fn odd(ksize: u32) -> u32 {
    if ksize % 2 == 0 {
        ksize + 1
    } else {
        ksize
    }
}

#[must_use]
pub fn grayscale(frame: &RgbImage) -> GrayImage {
    image::imageops::grayscale(frame)
}

#[must_use]
pub fn gaussian_blur_gray(frame: &GrayImage, sigma: f32) -> GrayImage {
    image::imageops::blur(frame, sigma)
}

#[must_use]
pub fn gaussian_blur_rgb(frame: &RgbImage, sigma: f32) -> RgbImage {
    image::imageops::blur(frame, sigma)
}

#[must_use]
pub fn gaussian_blur_mask(mask: &MaskF32, sigma: f32) -> MaskF32 {
    image::imageops::blur(mask, sigma)
}

/// Counts pixels whose absolute difference exceeds `thresh`. Images must
/// have identical dimensions.
#[must_use]
pub fn changed_pixel_count(a: &GrayImage, b: &GrayImage, thresh: u8) -> u64 {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    a.as_raw()
        .iter()
        .zip(b.as_raw())
        .filter(|(x, y)| x.abs_diff(**y) > thresh)
        .count() as u64
}

#[must_use]
pub fn threshold_binary(frame: &GrayImage, thresh: u8) -> GrayImage {
    let mut out = frame.clone();
    for p in out.pixels_mut() {
        p.0[0] = if p.0[0] > thresh { 255 } else { 0 };
    }
    out
}

/// Bicubic (Catmull-Rom) resize by `factor`. A factor of one is a no-op.
#[must_use]
pub fn scale_bicubic(frame: &RgbImage, factor: f32) -> RgbImage {
    if (factor - 1.0).abs() < f32::EPSILON {
        return frame.clone();
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (w, h) = (
        ((frame.width() as f32 * factor) as u32).max(1),
        ((frame.height() as f32 * factor) as u32).max(1),
    );
    image::imageops::resize(frame, w, h, image::imageops::FilterType::CatmullRom)
}

/// Fixed 3x3 sharpening convolution.
#[must_use]
pub fn sharpen(frame: &RgbImage) -> RgbImage {
    const KERNEL: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 9.0, -1.0, -1.0, -1.0, -1.0];
    image::imageops::filter3x3(frame, &KERNEL)
}

/// Simplified non-local-means: 3x3 patches compared over a 7x7 search
/// window, weighted by `exp(-d2 / h2)`. Zero strength is a no-op.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn nl_means_denoise(frame: &RgbImage, strength: f32) -> RgbImage {
    if strength <= 0.0 {
        return frame.clone();
    }
    const PATCH: i64 = 1;
    const SEARCH: i64 = 3;
    let (width, height) = (i64::from(frame.width()), i64::from(frame.height()));
    let h2 = (strength * strength * 9.0).max(1.0);

    let at = |x: i64, y: i64| -> &image::Rgb<u8> {
        let x = x.clamp(0, width - 1) as u32;
        let y = y.clamp(0, height - 1) as u32;
        frame.get_pixel(x, y)
    };

    let patch_distance = |ax: i64, ay: i64, bx: i64, by: i64| -> f32 {
        let mut d2 = 0.0f32;
        for dy in -PATCH..=PATCH {
            for dx in -PATCH..=PATCH {
                let pa = at(ax + dx, ay + dy);
                let pb = at(bx + dx, by + dy);
                for c in 0..3 {
                    let d = f32::from(pa.0[c]) - f32::from(pb.0[c]);
                    d2 += d * d;
                }
            }
        }
        d2 / 27.0
    };

    let mut out = frame.clone();
    for y in 0..height {
        for x in 0..width {
            let mut acc = [0.0f32; 3];
            let mut weight_sum = 0.0f32;
            for sy in -SEARCH..=SEARCH {
                for sx in -SEARCH..=SEARCH {
                    let d2 = patch_distance(x, y, x + sx, y + sy);
                    let w = (-d2 / h2).exp();
                    let p = at(x + sx, y + sy);
                    for c in 0..3 {
                        acc[c] += w * f32::from(p.0[c]);
                    }
                    weight_sum += w;
                }
            }
            let p = out.get_pixel_mut(x as u32, y as u32);
            for c in 0..3 {
                p.0[c] = (acc[c] / weight_sum).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Single box-filter pass with kernel size `2*radius + 1`, clamped borders.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn box_blur(frame: &RgbImage, radius: u32) -> RgbImage {
    if radius == 0 {
        return frame.clone();
    }
    let (width, height) = (i64::from(frame.width()), i64::from(frame.height()));
    let r = i64::from(radius);
    let norm = ((2 * r + 1) * (2 * r + 1)) as f32;

    // Horizontal pass into f32, then vertical.
    let clamp_px = |x: i64, y: i64| -> &image::Rgb<u8> {
        frame.get_pixel(x.clamp(0, width - 1) as u32, y.clamp(0, height - 1) as u32)
    };

    let mut horizontal = vec![[0.0f32; 3]; (width * height) as usize];
    for y in 0..height {
        for x in 0..width {
            let mut acc = [0.0f32; 3];
            for dx in -r..=r {
                let p = clamp_px(x + dx, y);
                for c in 0..3 {
                    acc[c] += f32::from(p.0[c]);
                }
            }
            horizontal[(y * width + x) as usize] = acc;
        }
    }

    let mut out = frame.clone();
    for y in 0..height {
        for x in 0..width {
            let mut acc = [0.0f32; 3];
            for dy in -r..=r {
                let sy = (y + dy).clamp(0, height - 1);
                let h = horizontal[(sy * width + x) as usize];
                for c in 0..3 {
                    acc[c] += h[c];
                }
            }
            let p = out.get_pixel_mut(x as u32, y as u32);
            for c in 0..3 {
                p.0[c] = (acc[c] / norm).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Structuring element for the morphology operators.
#[derive(Clone, Debug)]
pub struct StructElement {
    size: u32,
    mask: Vec<bool>,
}

impl StructElement {
    #[must_use]
    pub fn rect(size: u32) -> Self {
        let size = size.max(1);
        Self {
            size,
            mask: vec![true; (size * size) as usize],
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ellipse(size: u32) -> Self {
        let size = size.max(1);
        let r = (size as f32 - 1.0) / 2.0;
        let mut mask = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                let dx = (x as f32 - r) / r.max(0.5);
                let dy = (y as f32 - r) / r.max(0.5);
                mask.push(dx * dx + dy * dy <= 1.0);
            }
        }
        Self { size, mask }
    }

    fn offsets(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        let half = i64::from(self.size / 2);
        self.mask.iter().enumerate().filter(|(_, m)| **m).map(move |(i, _)| {
            let size = i64::from(self.size);
            let i = i64::try_from(i).unwrap_or(0);
            (i % size - half, i / size - half)
        })
    }
}

#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn dilate(frame: &GrayImage, elem: &StructElement) -> GrayImage {
    let (width, height) = (i64::from(frame.width()), i64::from(frame.height()));
    let mut out = frame.clone();
    for y in 0..height {
        for x in 0..width {
            let mut max = 0u8;
            for (dx, dy) in elem.offsets() {
                let sx = (x + dx).clamp(0, width - 1) as u32;
                let sy = (y + dy).clamp(0, height - 1) as u32;
                max = max.max(frame.get_pixel(sx, sy).0[0]);
            }
            out.get_pixel_mut(x as u32, y as u32).0[0] = max;
        }
    }
    out
}

#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn erode(frame: &GrayImage, elem: &StructElement) -> GrayImage {
    let (width, height) = (i64::from(frame.width()), i64::from(frame.height()));
    let mut out = frame.clone();
    for y in 0..height {
        for x in 0..width {
            let mut min = 255u8;
            for (dx, dy) in elem.offsets() {
                let sx = (x + dx).clamp(0, width - 1) as u32;
                let sy = (y + dy).clamp(0, height - 1) as u32;
                min = min.min(frame.get_pixel(sx, sy).0[0]);
            }
            out.get_pixel_mut(x as u32, y as u32).0[0] = min;
        }
    }
    out
}

/// Dilation minus erosion. Bright outlines around intensity edges.
#[must_use]
pub fn morph_gradient(frame: &GrayImage, elem: &StructElement) -> GrayImage {
    let dilated = dilate(frame, elem);
    let eroded = erode(frame, elem);
    let mut out = dilated;
    for (p, e) in out.pixels_mut().zip(eroded.pixels()) {
        p.0[0] = p.0[0].saturating_sub(e.0[0]);
    }
    out
}

/// Dilation followed by erosion. Fills gaps between glyph strokes.
#[must_use]
pub fn morph_close(frame: &GrayImage, elem: &StructElement) -> GrayImage {
    erode(&dilate(frame, elem), elem)
}

#[must_use]
pub fn count_nonzero(frame: &GrayImage) -> u64 {
    frame.as_raw().iter().filter(|v| **v != 0).count() as u64
}

/// Iterative diffusion inpaint. Masked pixels are filled onion-peel style
/// from known neighbors, then smoothed inside the mask for `radius` passes.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn inpaint_diffusion(frame: &RgbImage, mask: &GrayImage, radius: u32) -> RgbImage {
    debug_assert_eq!(frame.dimensions(), mask.dimensions());
    let (width, height) = (i64::from(frame.width()), i64::from(frame.height()));
    let mut out = frame.clone();
    let mut known: Vec<bool> = mask.as_raw().iter().map(|v| *v == 0).collect();
    let mut unknown: Vec<(i64, i64)> = Vec::new();
    for y in 0..height {
        for x in 0..width {
            if !known[(y * width + x) as usize] {
                unknown.push((x, y));
            }
        }
    }

    // Fill from the boundary inward.
    while !unknown.is_empty() {
        let mut next = Vec::new();
        let mut filled_any = false;
        for &(x, y) in &unknown {
            let mut acc = [0.0f32; 3];
            let mut count = 0u32;
            for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    let sx = x + dx;
                    let sy = y + dy;
                    if sx < 0 || sy < 0 || sx >= width || sy >= height {
                        continue;
                    }
                    if known[(sy * width + sx) as usize] {
                        let p = out.get_pixel(sx as u32, sy as u32);
                        for c in 0..3 {
                            acc[c] += f32::from(p.0[c]);
                        }
                        count += 1;
                    }
                }
            }
            if count == 0 {
                next.push((x, y));
                continue;
            }
            filled_any = true;
            #[allow(clippy::cast_precision_loss)]
            let n = count as f32;
            let p = out.get_pixel_mut(x as u32, y as u32);
            for c in 0..3 {
                p.0[c] = (acc[c] / n).round().clamp(0.0, 255.0) as u8;
            }
        }
        // Newly filled pixels become known for the next peel.
        for &(x, y) in &unknown {
            if !next.contains(&(x, y)) {
                known[(y * width + x) as usize] = true;
            }
        }
        if !filled_any {
            break;
        }
        unknown = next;
    }

    // Smoothing passes over the masked area proportional to the radius.
    let masked: Vec<(i64, i64)> = mask
        .enumerate_pixels()
        .filter(|(_, _, p)| p.0[0] != 0)
        .map(|(x, y, _)| (i64::from(x), i64::from(y)))
        .collect();
    for _ in 0..radius {
        let snapshot = out.clone();
        for &(x, y) in &masked {
            let mut acc = [0.0f32; 3];
            let mut count = 0u32;
            for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    let sx = x + dx;
                    let sy = y + dy;
                    if sx < 0 || sy < 0 || sx >= width || sy >= height {
                        continue;
                    }
                    let p = snapshot.get_pixel(sx as u32, sy as u32);
                    for c in 0..3 {
                        acc[c] += f32::from(p.0[c]);
                    }
                    count += 1;
                }
            }
            #[allow(clippy::cast_precision_loss)]
            let n = count as f32;
            let p = out.get_pixel_mut(x as u32, y as u32);
            for c in 0..3 {
                p.0[c] = (acc[c] / n).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn flat(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb([value, value, value]))
    }

    #[test_case(1, 1; "one")]
    #[test_case(4, 5; "even")]
    #[test_case(11, 11; "odd")]
    fn odd_kernel(input: u32, want: u32) {
        assert_eq!(want, odd(input));
    }

    #[test]
    fn changed_count_identical() {
        let a = grayscale(&flat(8, 8, 100));
        assert_eq!(0, changed_pixel_count(&a, &a, 15));
    }

    #[test]
    fn changed_count_differs() {
        let a = grayscale(&flat(8, 8, 100));
        let b = grayscale(&flat(8, 8, 200));
        assert_eq!(64, changed_pixel_count(&a, &b, 15));
    }

    #[test]
    fn box_blur_preserves_flat_regions() {
        let img = flat(16, 16, 120);
        let blurred = box_blur(&img, 3);
        assert_eq!(img, blurred);
    }

    #[test]
    fn denoise_zero_strength_is_noop() {
        let img = flat(6, 6, 42);
        assert_eq!(img, nl_means_denoise(&img, 0.0));
    }

    #[test]
    fn scale_factor_one_is_noop() {
        let img = flat(6, 6, 42);
        assert_eq!(img, scale_bicubic(&img, 1.0));
    }

    #[test]
    fn scale_doubles_dimensions() {
        let img = flat(6, 4, 42);
        let scaled = scale_bicubic(&img, 2.0);
        assert_eq!((12, 8), scaled.dimensions());
    }

    #[test]
    fn gradient_flat_is_zero() {
        let img = grayscale(&flat(8, 8, 77));
        let grad = morph_gradient(&img, &StructElement::rect(3));
        assert_eq!(0, count_nonzero(&grad));
    }

    #[test]
    fn gradient_edge_detected() {
        let mut img = GrayImage::from_pixel(8, 8, Luma([0]));
        for y in 0..8 {
            for x in 4..8 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        let grad = morph_gradient(&img, &StructElement::rect(3));
        assert!(count_nonzero(&grad) > 0);
    }

    #[test]
    fn inpaint_fills_masked_area() {
        let mut img = flat(10, 10, 100);
        // Bright square that should be reconstructed from surroundings.
        for y in 4..6 {
            for x in 4..6 {
                img.put_pixel(x, y, image::Rgb([255, 255, 255]));
            }
        }
        let mut mask = GrayImage::from_pixel(10, 10, Luma([0]));
        for y in 4..6 {
            for x in 4..6 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let out = inpaint_diffusion(&img, &mask, 3);
        for y in 4..6 {
            for x in 4..6 {
                let p = out.get_pixel(x, y);
                assert!(p.0[0] < 120, "pixel ({x},{y}) not reconstructed: {p:?}");
            }
        }
    }

    #[test]
    fn ellipse_element_is_round() {
        let elem = StructElement::ellipse(5);
        // Corners excluded, center included.
        assert!(!elem.mask[0]);
        assert!(elem.mask[12]);
    }
}
