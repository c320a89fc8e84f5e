//! Grayscale frames and the pixel helpers the capture loop needs.

use image::GrayImage;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap the pixel data as an `image` buffer, or `None` if the length does
    /// not match the dimensions.
    pub fn into_gray_image(self) -> Option<GrayImage> {
        GrayImage::from_raw(self.width, self.height, self.data)
    }

    /// Flip the frame left-to-right in place.
    pub fn mirror(&mut self) {
        mirror_horizontal(&mut self.data, self.width, self.height);
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
/// Grayscale = every even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Check if a frame is dark using an 8-bucket histogram.
///
/// Returns true if >95% of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Reverse each row of a `width` × `height` grayscale buffer.
pub fn mirror_horizontal(gray: &mut [u8], width: u32, height: u32) {
    let w = width as usize;
    if w == 0 {
        return;
    }
    for row in gray.chunks_exact_mut(w).take(height as usize) {
        row.reverse();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_keeps_luma_bytes() {
        // 2x2 frame: [Y U Y V] per pixel pair.
        let yuyv = [10, 128, 20, 129, 30, 127, 40, 130];
        assert_eq!(yuyv_to_grayscale(&yuyv, 2, 2).unwrap(), vec![10, 20, 30, 40]);

        // Trailing bytes beyond the frame are ignored; short buffers are rejected.
        assert_eq!(yuyv_to_grayscale(&[1, 0, 2, 0, 9, 9], 2, 1).unwrap(), vec![1, 2]);
        assert!(matches!(
            yuyv_to_grayscale(&yuyv, 4, 2),
            Err(FrameError::InvalidLength { expected: 16, actual: 8 })
        ));
    }

    #[test]
    fn test_dark_frame_threshold() {
        let with_bright = |bright: usize| {
            let mut gray = vec![5u8; 100 - bright];
            gray.extend(std::iter::repeat(180u8).take(bright));
            gray
        };
        assert!(is_dark_frame(&[], 0.95));
        assert!(is_dark_frame(&with_bright(0), 0.95));
        assert!(is_dark_frame(&with_bright(3), 0.95));
        assert!(!is_dark_frame(&with_bright(5), 0.95), "exactly 95% dark is not dark");
        assert!(!is_dark_frame(&with_bright(100), 0.95));
    }

    #[test]
    fn test_mirror_horizontal() {
        let mut gray = vec![1, 2, 3, 4, 5, 6];
        mirror_horizontal(&mut gray, 3, 2);
        assert_eq!(gray, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_into_gray_image() {
        let frame = Frame {
            data: vec![7u8; 12],
            width: 4,
            height: 3,
            timestamp: std::time::Instant::now(),
            sequence: 0,
            is_dark: false,
        };
        let image = frame.into_gray_image().unwrap();
        assert_eq!(image.dimensions(), (4, 3));

        let short = Frame {
            data: vec![7u8; 5],
            width: 4,
            height: 3,
            timestamp: std::time::Instant::now(),
            sequence: 0,
            is_dark: false,
        };
        assert!(short.into_gray_image().is_none());
    }
}
