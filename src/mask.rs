use crate::buffer_pool::{BYTES_PER_PIXEL, PixelBuffer};
use crate::geometry::Rect;

/// Fill colour for masked regions, BGRA. Opaque so no sensitive pixel can
/// survive blending.
pub const MASK_COLOR: [u8; 4] = [34, 32, 30, 255];

/// Rasterises opaque rectangles over the sensitive regions of a frame.
///
/// `scale` converts the rects (target-surface points) into the buffer's pixel
/// space. Rects are rounded outward and clipped; non-finite rects are
/// skipped. Runs on the encoding worker, never the engine context.
pub fn apply_privacy_mask<'a, I>(buffer: &mut PixelBuffer, regions: I, scale: f32)
where
    I: IntoIterator<Item = &'a Rect>,
{
    let width = buffer.width();
    let height = buffer.height();
    let row_bytes = buffer.row_bytes();
    let data = buffer.data_mut();

    for region in regions {
        if !region.is_finite() {
            continue;
        }
        let Some(bounds) = region.scaled(scale).to_pixel_bounds(width, height) else {
            continue;
        };
        for y in bounds.y0..bounds.y1 {
            let row = y as usize * row_bytes;
            for x in bounds.x0..bounds.x1 {
                let at = row + x as usize * BYTES_PER_PIXEL;
                data[at..at + BYTES_PER_PIXEL].copy_from_slice(&MASK_COLOR);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MASK_COLOR, apply_privacy_mask};
    use crate::buffer_pool::PixelBuffer;
    use crate::geometry::Rect;

    fn patterned(width: u32, height: u32) -> PixelBuffer {
        let mut buf = PixelBuffer::new(width, height);
        for (i, px) in buf.data_mut().chunks_exact_mut(4).enumerate() {
            let v = (i % 251) as u8;
            px.copy_from_slice(&[v, v.wrapping_add(1), v.wrapping_add(2), 255]);
        }
        buf
    }

    fn pixel(buf: &PixelBuffer, x: u32, y: u32) -> [u8; 4] {
        let at = (y as usize * buf.width() as usize + x as usize) * 4;
        let mut px = [0u8; 4];
        px.copy_from_slice(&buf.data()[at..at + 4]);
        px
    }

    #[test]
    fn masked_region_contains_no_source_pixels() {
        let mut buf = patterned(100, 80);
        let unmasked = patterned(100, 80);
        let region = Rect::new(10.0, 10.0, 40.0, 20.0);

        apply_privacy_mask(&mut buf, [region].iter(), 1.0);

        for y in 10..30 {
            for x in 10..50 {
                assert_eq!(pixel(&buf, x, y), MASK_COLOR, "pixel ({x},{y}) not masked");
            }
        }
        // Just outside the region is untouched.
        assert_eq!(pixel(&buf, 9, 10), pixel(&unmasked, 9, 10));
        assert_eq!(pixel(&buf, 50, 29), pixel(&unmasked, 50, 29));
    }

    #[test]
    fn rects_are_scaled_and_rounded_outward() {
        let mut buf = patterned(50, 50);
        // Region in point space; buffer downscaled by half.
        let region = Rect::new(21.0, 21.0, 19.0, 19.0);
        apply_privacy_mask(&mut buf, [region].iter(), 0.5);

        // 21*0.5=10.5 floors to 10, (21+19)*0.5=20 ceils to 20.
        assert_eq!(pixel(&buf, 10, 10), MASK_COLOR);
        assert_eq!(pixel(&buf, 19, 19), MASK_COLOR);
        assert_ne!(pixel(&buf, 9, 9), MASK_COLOR);
        assert_ne!(pixel(&buf, 20, 20), MASK_COLOR);
    }

    #[test]
    fn non_finite_regions_are_skipped() {
        let mut buf = patterned(32, 32);
        let before = buf.data().to_vec();
        let regions = [
            Rect::new(f32::NAN, 0.0, 10.0, 10.0),
            Rect::new(0.0, f32::INFINITY, 10.0, 10.0),
        ];
        apply_privacy_mask(&mut buf, regions.iter(), 1.0);
        assert_eq!(buf.data(), before.as_slice());
    }

    #[test]
    fn offscreen_regions_are_clipped() {
        let mut buf = patterned(16, 16);
        apply_privacy_mask(&mut buf, [Rect::new(12.0, 12.0, 100.0, 100.0)].iter(), 1.0);
        assert_eq!(pixel(&buf, 15, 15), MASK_COLOR);
        assert_ne!(pixel(&buf, 11, 11), MASK_COLOR);
    }
}
