//! Enrollment-time image augmentation.
//!
//! Each dataset image can contribute extra embeddings from a mirrored, two
//! slightly rotated and one brightened copy, which helps recall under pose
//! and lighting changes at the door.

use crate::alignment::rotate_about_center;
use image::imageops;
use image::GrayImage;

const ROTATION_ANGLES_DEG: [f32; 2] = [10.0, -10.0];
const BRIGHTNESS_GAIN: f32 = 1.2;
const BRIGHTNESS_OFFSET: f32 = 30.0;

/// Augmented copies of `image` (the original is not included).
pub fn variants(image: &GrayImage) -> Vec<GrayImage> {
    let mut out = Vec::with_capacity(2 + ROTATION_ANGLES_DEG.len());
    out.push(imageops::flip_horizontal(image));
    for angle in ROTATION_ANGLES_DEG {
        out.push(rotate(image, angle));
    }
    out.push(brighten(image, BRIGHTNESS_GAIN, BRIGHTNESS_OFFSET));
    out
}

fn rotate(image: &GrayImage, angle_deg: f32) -> GrayImage {
    let (w, h) = image.dimensions();
    let data = rotate_about_center(image.as_raw(), w, h, angle_deg);
    GrayImage::from_raw(w, h, data).unwrap_or_else(|| image.clone())
}

/// `p * gain + offset`, saturated to the u8 range.
fn brighten(image: &GrayImage, gain: f32, offset: f32) -> GrayImage {
    let mut out = image.clone();
    for p in out.pixels_mut() {
        p.0[0] = (p.0[0] as f32 * gain + offset).round().clamp(0.0, 255.0) as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_variant_count_and_size() {
        let image = GrayImage::from_pixel(40, 30, Luma([100]));
        let out = variants(&image);
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|v| v.dimensions() == (40, 30)));
    }

    #[test]
    fn test_first_variant_is_mirror() {
        let mut image = GrayImage::new(3, 1);
        image.put_pixel(0, 0, Luma([10]));
        image.put_pixel(2, 0, Luma([250]));
        let mirrored = &variants(&image)[0];
        assert_eq!(mirrored.get_pixel(0, 0).0[0], 250);
        assert_eq!(mirrored.get_pixel(2, 0).0[0], 10);
    }

    #[test]
    fn test_brighten_saturates() {
        let mut image = GrayImage::new(2, 1);
        image.put_pixel(0, 0, Luma([100]));
        image.put_pixel(1, 0, Luma([220]));
        let bright = brighten(&image, BRIGHTNESS_GAIN, BRIGHTNESS_OFFSET);
        assert_eq!(bright.get_pixel(0, 0).0[0], 150);
        assert_eq!(bright.get_pixel(1, 0).0[0], 255);
    }
}
