//! Frame type and pixel format conversion (YUYV, MJPG, GREY) plus dark-frame detection.

use image::{GrayImage, ImageFormat, RgbImage};

/// A captured camera frame in both color (for streaming) and grayscale
/// (for detection).
#[derive(Clone)]
pub struct Frame {
    pub rgb: RgbImage,
    /// Grayscale pixel data (width * height bytes).
    pub luma: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Build a frame from an RGB image, deriving the grayscale plane.
    pub fn from_rgb(rgb: RgbImage, sequence: u32) -> Self {
        let luma = rgb_to_grayscale(&rgb);
        let is_dark = is_dark_frame(&luma, DARK_FRAME_RATIO);
        Self {
            width: rgb.width(),
            height: rgb.height(),
            rgb,
            luma,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.luma.is_empty() {
            return 0.0;
        }
        self.luma.iter().map(|&b| b as f32).sum::<f32>() / self.luma.len() as f32
    }
}

/// Share of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short for {width}x{height}: expected {expected} bytes, got {actual}")]
    InvalidLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("MJPG decode failed: {0}")]
    Mjpeg(#[from] image::ImageError),
}

fn check_len(buf: &[u8], width: u32, height: u32, bytes_per_pixel: usize) -> Result<usize, FrameError> {
    let expected = width as usize * height as usize * bytes_per_pixel;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength { width, height, expected, actual: buf.len() });
    }
    Ok(expected)
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Convert packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair) to RGB (BT.601).
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = check_len(yuyv, width, height, 2)?;
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);

    for quad in yuyv[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            let y = y as f32;
            rgb.push(clamp_u8(y + 1.402 * v));
            rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_u8(y + 1.772 * u));
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        width,
        height,
        expected,
        actual: yuyv.len(),
    })
}

/// Replicate an 8-bit grayscale buffer into RGB.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = check_len(grey, width, height, 1)?;
    let plane = GrayImage::from_raw(width, height, grey[..expected].to_vec()).ok_or(
        FrameError::InvalidLength { width, height, expected, actual: grey.len() },
    )?;
    Ok(image::DynamicImage::ImageLuma8(plane).to_rgb8())
}

/// Luma plane of an RGB image.
///
/// Uses the `image` crate's Rec. 709 weights, the same conversion reference
/// images go through at enrollment, so live and gallery encodings agree.
pub fn rgb_to_grayscale(rgb: &RgbImage) -> Vec<u8> {
    image::imageops::grayscale(rgb).into_raw()
}

/// Decode one Motion-JPEG buffer to RGB.
pub fn decode_mjpeg(buf: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?.to_rgb8())
}

/// True if more than `threshold_pct` of pixels are near black (< 32).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // Two pixels, U = V = 128 -> no color cast
        let rgb = yuyv_to_rgb(&[90, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [90, 90, 90]);
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // High V pushes red up and green down
        let rgb = yuyv_to_rgb(&[100, 128, 100, 200], 2, 1).unwrap();
        let [r, g, b] = rgb.get_pixel(0, 0).0;
        assert!(r > 190 && g < 60 && b == 100, "got {r},{g},{b}");
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert!(matches!(
            yuyv_to_rgb(&[1, 2], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2, .. })
        ));
        assert!(grey_to_rgb(&[1, 2, 3], 2, 2).is_err());
    }

    #[test]
    fn test_grey_to_rgb_and_back() {
        let rgb = grey_to_rgb(&[0, 64, 128, 255], 2, 2).unwrap();
        assert_eq!(rgb.get_pixel(1, 1).0, [255, 255, 255]);
        assert_eq!(rgb_to_grayscale(&rgb), vec![0, 64, 128, 255]);
    }

    #[test]
    fn test_grayscale_matches_enrollment_conversion() {
        let rgb = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => image::Rgb([255, 0, 0]),
            1 => image::Rgb([0, 255, 0]),
            _ => image::Rgb([20, 90, 250]),
        });
        let enrolled = image::DynamicImage::ImageRgb8(rgb.clone()).to_luma8().into_raw();
        let live = rgb_to_grayscale(&rgb);
        assert_eq!(live, enrolled);
        // Rec. 709: green carries most of the weight, red far less than BT.601's 0.299.
        assert!(live[1] > 170 && live[0] < 60, "got {live:?}");
    }

    #[test]
    fn test_decode_mjpeg_roundtrip_dimensions() {
        let src = RgbImage::from_pixel(16, 8, image::Rgb([120, 60, 30]));
        let mut jpeg = std::io::Cursor::new(Vec::new());
        src.write_to(&mut jpeg, ImageFormat::Jpeg).unwrap();
        let decoded = decode_mjpeg(jpeg.get_ref()).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }

    #[test]
    fn test_decode_mjpeg_garbage() {
        assert!(matches!(decode_mjpeg(b"not a jpeg"), Err(FrameError::Mjpeg(_))));
    }

    #[test]
    fn test_dark_frame_thresholds() {
        assert!(is_dark_frame(&[0u8; 1000], DARK_FRAME_RATIO));
        assert!(!is_dark_frame(&[128u8; 1000], DARK_FRAME_RATIO));
        assert!(is_dark_frame(&[], DARK_FRAME_RATIO));

        let mut mostly = vec![10u8; 960];
        mostly.extend([128u8; 40]);
        assert!(is_dark_frame(&mostly, DARK_FRAME_RATIO));

        let mut borderline = vec![10u8; 940];
        borderline.extend([128u8; 60]);
        assert!(!is_dark_frame(&borderline, DARK_FRAME_RATIO));
    }

    #[test]
    fn test_frame_from_rgb_derives_luma() {
        let frame = Frame::from_rgb(RgbImage::from_pixel(4, 4, image::Rgb([200, 200, 200])), 7);
        assert_eq!(frame.luma.len(), 16);
        assert!(!frame.is_dark);
        assert!((frame.avg_brightness() - 200.0).abs() < 1.0);
        assert_eq!(frame.sequence, 7);
    }
}
