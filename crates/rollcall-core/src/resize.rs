//! Bilinear resampling of 8-bit grayscale buffers.

use crate::types::LumaImage;

/// Resize a grayscale image to `out_w × out_h` with bilinear interpolation.
///
/// Pixel centres are aligned (half-pixel offset), so a uniform image stays
/// uniform at any scale.
pub fn bilinear(src: &LumaImage<'_>, out_w: usize, out_h: usize) -> Vec<u8> {
    let (w, h) = (src.width as usize, src.height as usize);
    let mut out = vec![0u8; out_w * out_h];
    if w == 0 || h == 0 || out_w == 0 || out_h == 0 || src.data.len() < w * h {
        return out;
    }

    let sx = w as f32 / out_w as f32;
    let sy = h as f32 / out_h as f32;

    for oy in 0..out_h {
        let fy_src = (oy as f32 + 0.5) * sy - 0.5;
        let y0 = (fy_src.floor().max(0.0) as usize).min(h - 1);
        let y1 = (y0 + 1).min(h - 1);
        let wy = (fy_src - y0 as f32).clamp(0.0, 1.0);

        let row0 = &src.data[y0 * w..y0 * w + w];
        let row1 = &src.data[y1 * w..y1 * w + w];

        for ox in 0..out_w {
            let fx_src = (ox as f32 + 0.5) * sx - 0.5;
            let x0 = (fx_src.floor().max(0.0) as usize).min(w - 1);
            let x1 = (x0 + 1).min(w - 1);
            let wx = (fx_src - x0 as f32).clamp(0.0, 1.0);

            let top = row0[x0] as f32 * (1.0 - wx) + row0[x1] as f32 * wx;
            let bottom = row1[x0] as f32 * (1.0 - wx) + row1[x1] as f32 * wx;
            let v = top * (1.0 - wy) + bottom * wy;

            out[oy * out_w + ox] = v.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Downscale a frame by `factor` (0 < factor ≤ 1), returning the new buffer
/// and its dimensions. A factor ≥ 1 returns a copy of the input.
pub fn downscale(src: &LumaImage<'_>, factor: f32) -> (Vec<u8>, u32, u32) {
    if factor >= 1.0 || factor <= 0.0 {
        return (src.data.to_vec(), src.width, src.height);
    }
    let w = ((src.width as f32 * factor).round() as u32).max(1);
    let h = ((src.height as f32 * factor).round() as u32).max(1);
    (bilinear(src, w as usize, h as usize), w, h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_image_stays_uniform() {
        let data = vec![128u8; 100 * 100];
        let src = LumaImage::new(&data, 100, 100);
        let up = bilinear(&src, 200, 150);
        assert_eq!(up.len(), 200 * 150);
        assert!(up.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_downscale_quarter() {
        let data = vec![50u8; 640 * 480];
        let (small, w, h) = downscale(&LumaImage::new(&data, 640, 480), 0.25);
        assert_eq!((w, h), (160, 120));
        assert_eq!(small.len(), 160 * 120);
        assert!(small.iter().all(|&p| p == 50));
    }

    #[test]
    fn test_downscale_identity_factor() {
        let data: Vec<u8> = (0..12).collect();
        let (out, w, h) = downscale(&LumaImage::new(&data, 4, 3), 1.0);
        assert_eq!((w, h), (4, 3));
        assert_eq!(out, data);
    }

    #[test]
    fn test_downscale_averages_blocks() {
        // 2x2 checkerboard of 0/200 halves to its mean
        let data = vec![0u8, 200, 200, 0];
        let (out, w, h) = downscale(&LumaImage::new(&data, 2, 2), 0.5);
        assert_eq!((w, h), (1, 1));
        assert_eq!(out, vec![100]);
    }

    #[test]
    fn test_short_buffer_yields_black() {
        let data = vec![255u8; 3];
        let out = bilinear(&LumaImage::new(&data, 4, 4), 2, 2);
        assert_eq!(out, vec![0u8; 4]);
    }
}
