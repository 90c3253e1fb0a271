use camcal::IntrinsicsArrays;
use image::GrayImage;
use opencv_calibrate::UndistortMaps;

/// Undistortion tables for one camera model and one image size.
///
/// Building the tables is much more expensive than applying them, so build
/// once and reuse for every image of a batch.
#[derive(Debug)]
pub struct UndistortionCache {
    maps: UndistortMaps,
}

impl UndistortionCache {
    /// `alpha` is the free scaling parameter: 0 keeps only valid pixels, 1
    /// keeps every source pixel (with black borders).
    pub fn new(
        intrinsics: &IntrinsicsArrays,
        width: u32,
        height: u32,
        alpha: f64,
    ) -> eyre::Result<Self> {
        let maps = UndistortMaps::new(
            &intrinsics.camera_matrix,
            &intrinsics.distortion_coeffs,
            width,
            height,
            alpha,
        )?;
        tracing::debug!("undistortion maps: {maps:?}");
        Ok(Self { maps })
    }

    pub fn width(&self) -> u32 {
        self.maps.width()
    }

    pub fn height(&self) -> u32 {
        self.maps.height()
    }

    /// Camera matrix of the undistorted (uncropped) image, row major.
    pub fn new_camera_matrix(&self) -> &[f64; 9] {
        &self.maps.new_camera_matrix
    }

    /// Valid pixel region as `(x, y, width, height)`.
    pub fn roi(&self) -> (u32, u32, u32, u32) {
        self.maps.roi
    }
}

/// Remove lens distortion and crop to the region of valid pixels.
///
/// If the valid region is empty, the uncropped result is returned.
pub fn undistort_image(
    decoded: &GrayImage,
    undist_cache: &UndistortionCache,
) -> eyre::Result<GrayImage> {
    let (width, height) = decoded.dimensions();
    if (width, height) != (undist_cache.width(), undist_cache.height()) {
        eyre::bail!(
            "image is {width}x{height}, but undistortion was prepared for {}x{}",
            undist_cache.width(),
            undist_cache.height()
        );
    }

    let data_u8 = undist_cache.maps.remap(decoded.as_raw())?;
    let full = GrayImage::from_raw(width, height, data_u8)
        .ok_or_else(|| eyre::eyre!("unexpected output image size"))?;

    let (x, y, w, h) = undist_cache.roi();
    if w == 0 || h == 0 {
        return Ok(full);
    }
    Ok(image::imageops::crop_imm(&full, x, y, w, h).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinhole(dist: [f64; 5]) -> IntrinsicsArrays {
        IntrinsicsArrays {
            camera_matrix: [300.0, 0.0, 80.0, 0.0, 300.0, 60.0, 0.0, 0.0, 1.0],
            distortion_coeffs: dist,
        }
    }

    #[test]
    fn size_mismatch_is_error() {
        let cache = UndistortionCache::new(&pinhole([0.0; 5]), 160, 120, 1.0).unwrap();
        let img = GrayImage::new(100, 100);
        assert!(undistort_image(&img, &cache).is_err());
    }

    #[test]
    fn output_is_cropped_to_roi() {
        let cache = UndistortionCache::new(&pinhole([-0.3, 0.1, 0.0, 0.0, 0.0]), 160, 120, 0.0)
            .unwrap();
        let (_, _, w, h) = cache.roi();
        let img = GrayImage::from_pixel(160, 120, image::Luma([90]));
        let out = undistort_image(&img, &cache).unwrap();
        if w > 0 && h > 0 {
            assert_eq!(out.dimensions(), (w, h));
        } else {
            assert_eq!(out.dimensions(), (160, 120));
        }
        assert!(out.width() <= 160 && out.height() <= 120);
    }

    #[test]
    fn rejects_bad_alpha() {
        assert!(UndistortionCache::new(&pinhole([0.0; 5]), 160, 120, 2.0).is_err());
    }
}
