use image::DynamicImage;
use image::imageops::FilterType;

use crate::config::AspectPolicy;

/// Output dimensions for a source of `width × height` under `policy`.
///
/// Zero-sized targets are clamped to 1 px.
pub fn target_dimensions(width: u32, height: u32, policy: AspectPolicy) -> (u32, u32) {
    let (w, h) = match policy {
        AspectPolicy::Fixed { width, height } => (width, height),
        AspectPolicy::SquareCrop { size } => (size, size),
        AspectPolicy::FitLongestSide { max_px } => {
            if width == 0 || height == 0 {
                (max_px, max_px)
            } else if width >= height {
                let short = (max_px as f64 * height as f64 / width as f64).floor() as u32;
                (max_px, short)
            } else {
                let short = (max_px as f64 * width as f64 / height as f64).floor() as u32;
                (short, max_px)
            }
        }
    };
    (w.max(1), h.max(1))
}

/// Produce a newly allocated, resized copy of `img` following `policy`.
///
/// - `Fixed` stretches to the exact size.
/// - `SquareCrop` center-crops to `min(width, height)` first.
/// - `FitLongestSide` keeps the aspect ratio.
pub fn scale(img: &DynamicImage, policy: AspectPolicy) -> DynamicImage {
    let (src_w, src_h) = (img.width(), img.height());
    let (dst_w, dst_h) = target_dimensions(src_w, src_h, policy);
    log::debug!("Scaling {src_w}x{src_h} → {dst_w}x{dst_h} ({policy:?})");

    match policy {
        AspectPolicy::SquareCrop { .. } => {
            let side = src_w.min(src_h);
            let x = (src_w - side) / 2;
            let y = (src_h - side) / 2;
            img.crop_imm(x, y, side, side)
                .resize_exact(dst_w, dst_h, FilterType::Triangle)
        }
        AspectPolicy::Fixed { .. } | AspectPolicy::FitLongestSide { .. } => {
            img.resize_exact(dst_w, dst_h, FilterType::Triangle)
        }
    }
}
