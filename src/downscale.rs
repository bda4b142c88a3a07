use crate::buffer_pool::PixelBuffer;
use fast_image_resize as fir;
use fir::images::{TypedImage, TypedImageRef};
use fir::pixels::U8x4;
use fir::{ResizeOptions, Resizer};
use thiserror::Error;

/// Resample quality tiers. `High` is a tent filter, selected at the Normal
/// performance level for scales >= 0.5; `Balanced` everywhere else; `Nearest`
/// when the device is under Minimal-level pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleQuality {
    High,
    Balanced,
    Nearest,
}

#[derive(Debug, Error)]
pub enum DownscaleError {
    #[error("source and destination dimensions do not match buffer contents")]
    BadDimensions,
    #[error("resize failed: {0}")]
    Resize(String),
}

/// SIMD-accelerated BGRA downscaler. One instance lives on the encoding
/// worker; the resizer keeps its internal scratch across frames.
pub struct Downscaler {
    resizer: Resizer,
}

impl Downscaler {
    pub fn new() -> Self {
        Self {
            resizer: Resizer::new(),
        }
    }

    /// Resamples `src` into `dst` at the destination's dimensions.
    pub fn downscale(
        &mut self,
        src: &PixelBuffer,
        dst: &mut PixelBuffer,
        quality: ResampleQuality,
    ) -> Result<(), DownscaleError> {
        if src.is_empty() || dst.is_empty() {
            return Err(DownscaleError::BadDimensions);
        }

        let src_view = TypedImageRef::<U8x4>::from_buffer(src.width(), src.height(), src.data())
            .map_err(|e| DownscaleError::Resize(e.to_string()))?;
        let (dst_w, dst_h) = (dst.width(), dst.height());
        let mut dst_view = TypedImage::<U8x4>::from_buffer(dst_w, dst_h, dst.data_mut())
            .map_err(|e| DownscaleError::Resize(e.to_string()))?;

        let alg = match quality {
            ResampleQuality::High => fir::ResizeAlg::Convolution(fir::FilterType::Bilinear),
            ResampleQuality::Balanced => fir::ResizeAlg::Convolution(fir::FilterType::Box),
            ResampleQuality::Nearest => fir::ResizeAlg::Nearest,
        };
        let opts = ResizeOptions::new().resize_alg(alg).use_alpha(false);

        self.resizer
            .resize_typed::<U8x4>(&src_view, &mut dst_view, &opts)
            .map_err(|e| DownscaleError::Resize(e.to_string()))?;
        Ok(())
    }
}

impl Default for Downscaler {
    fn default() -> Self {
        Self::new()
    }
}

/// Output dimensions for a given native size and effective scale: even-forced
/// with a floor so the encoder never sees a degenerate frame.
pub fn output_dimensions(native_w: u32, native_h: u32, scale: f32, min_dimension: u32) -> (u32, u32) {
    let to_even = |v: u32| v & !1;
    let floor = to_even(min_dimension.max(2));
    let w = to_even(((native_w as f32 * scale).round() as u32).max(floor));
    let h = to_even(((native_h as f32 * scale).round() as u32).max(floor));
    (w, h)
}
