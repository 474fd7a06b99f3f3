//! image decoding and pre-scaling helpers
use {
    crate::error::Result,
    image::{DynamicImage, imageops::FilterType},
    std::{path::Path, sync::Arc},
};

/// default resampling filter for scaling
const DEFAULT_FILTER: FilterType = FilterType::Lanczos3;

/// a decoded image shared between the cache and the display
///
/// cloning is cheap; the pixel buffer is freed when the last holder drops.
pub type DecodedImage = Arc<DynamicImage>;

/// decode an image file into memory
///
/// # Errors
///
/// returns an error if the file cannot be read or decoded
pub fn decode_file(path: &Path) -> Result<DecodedImage> {
    let img = image::ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(Arc::new(img))
}

/// scale a decoded image to fit inside `width` x `height`, keeping aspect
pub fn prescale(image: &DynamicImage, width: u32, height: u32) -> DecodedImage {
    Arc::new(image.resize(width, height, DEFAULT_FILTER))
}

/// cache key of a pre-scaled variant for a given display size
pub fn scaled_key(path: &str, width: u32, height: u32) -> String {
    format!("{path}|scaled:{width}x{height}")
}

/// decoded size in bytes, used for cache accounting
pub fn byte_size(image: &DynamicImage) -> u64 {
    image.as_bytes().len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_key_format() {
        assert_eq!(scaled_key("/tmp/a.jpg", 2560, 1440), "/tmp/a.jpg|scaled:2560x1440");
    }

    #[test]
    fn test_decode_and_prescale_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("img.png");
        DynamicImage::new_rgb8(64, 32).save(&path).unwrap();

        let decoded = decode_file(&path).unwrap();
        assert_eq!(decoded.width(), 64);

        let scaled = prescale(&decoded, 16, 16);
        assert_eq!(scaled.width(), 16);
        assert_eq!(scaled.height(), 8, "aspect is preserved");
        assert!(byte_size(&scaled) < byte_size(&decoded));
    }

    #[test]
    fn test_decode_missing_file_errors() {
        assert!(decode_file(Path::new("/nonexistent/x.png")).is_err());
    }
}
