use image::{GenericImageView, ImageFormat};
use std::path::Path;
use tracing::{debug, warn};

/// Post-processing applied to every image the renderer reports as written.
pub trait PostProcess: Send + Sync {
    fn finish(&self, image: &Path) -> Verdict;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Kept,
    Blank { non_white: u64 },
}

/// Crops the white margin around the rendered content and flags images with
/// (almost) nothing on them.
#[derive(Debug, Clone)]
pub struct WhitespaceTrim {
    /// Minimum non-white pixels for an image to count as non-blank.
    pub threshold: u64,
    /// Channel value at or above which a pixel is background.
    pub white_level: u8,
    /// Margin kept around the content, in pixels.
    pub padding: u32,
}

impl Default for WhitespaceTrim {
    fn default() -> Self {
        Self {
            threshold: 100,
            white_level: 250,
            padding: 5,
        }
    }
}

impl WhitespaceTrim {
    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }
}

impl PostProcess for WhitespaceTrim {
    fn finish(&self, image: &Path) -> Verdict {
        let img = match image::open(image) {
            Ok(img) => img,
            Err(e) => {
                // keep whatever the renderer produced
                warn!(image = %image.display(), error = %e, "could not decode image for trimming");
                return Verdict::Kept;
            }
        };

        let rgb = img.to_rgb8();
        let (width, height) = img.dimensions();

        let mut non_white = 0u64;
        let (mut left, mut top, mut right, mut bottom) = (width, height, 0u32, 0u32);
        for (x, y, px) in rgb.enumerate_pixels() {
            if px.0.iter().any(|&c| c < self.white_level) {
                non_white += 1;
                left = left.min(x);
                top = top.min(y);
                right = right.max(x + 1);
                bottom = bottom.max(y + 1);
            }
        }

        if non_white < self.threshold {
            return Verdict::Blank { non_white };
        }

        let left = left.saturating_sub(self.padding);
        let top = top.saturating_sub(self.padding);
        let right = (right + self.padding).min(width);
        let bottom = (bottom + self.padding).min(height);

        if (left, top, right, bottom) == (0, 0, width, height) {
            return Verdict::Kept;
        }

        let cropped = img.crop_imm(left, top, right - left, bottom - top);
        match cropped.save_with_format(image, ImageFormat::Png) {
            Ok(()) => debug!(
                image = %image.display(),
                from = %format!("{width}x{height}"),
                to = %format!("{}x{}", cropped.width(), cropped.height()),
                "trimmed whitespace"
            ),
            Err(e) => warn!(image = %image.display(), error = %e, "failed to save trimmed image"),
        }
        Verdict::Kept
    }
}
