//! Chessboard detection, camera calibration and undistortion using OpenCV.
//!
//! Images cross this API as raw 8-bit buffers with an explicit width and
//! height. Geometry crosses as plain arrays so that callers never need to
//! touch an OpenCV `Mat`.

use opencv::{
    calib3d,
    core::{self, Mat, Point2f, Point3f, Rect, Scalar, Size, TermCriteria, TermCriteria_Type, Vector},
    imgproc,
    prelude::*,
};
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("OpenCV error: {source}")]
    Cv {
        #[from]
        source: opencv::Error,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// RMS reprojection error reported by the optimizer, in pixels
    pub rms_reprojection_error: f64,
    pub image_width: u32,
    pub image_height: u32,
    /// camera calibration matrix, row major order
    pub camera_matrix: [f64; 9],
    /// non-linear distortion coefficients (k1, k2, p1, p2, k3)
    pub distortion_coeffs: [f64; 5],
    /// per-view rotation, as Rodrigues vectors
    pub rotation_vectors: Vec<[f64; 3]>,
    /// per-view translation
    pub translation_vectors: Vec<[f64; 3]>,
}

/// A point with a view in image (2D) and world (3D)
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondingPoint {
    pub object_point: (f64, f64, f64),
    pub image_point: (f64, f64),
}

/// Termination criteria and search window for sub-pixel corner refinement.
#[derive(Debug, Clone, PartialEq)]
pub struct SubPixCriteria {
    /// Half size of the search window.
    pub window: (i32, i32),
    pub max_iter: i32,
    pub epsilon: f64,
}

impl Default for SubPixCriteria {
    fn default() -> Self {
        Self {
            window: (5, 5),
            max_iter: 30,
            epsilon: 0.1,
        }
    }
}

impl SubPixCriteria {
    fn to_cv(&self) -> Result<TermCriteria> {
        if self.window.0 < 1 || self.window.1 < 1 || self.max_iter < 1 || self.epsilon <= 0.0 {
            return Err(Error::InvalidInput(format!("bad sub-pixel criteria {self:?}")));
        }
        Ok(TermCriteria::new(
            TermCriteria_Type::EPS as i32 + TermCriteria_Type::COUNT as i32,
            self.max_iter,
            self.epsilon,
        )?)
    }
}

/// Version of the linked OpenCV library.
pub fn opencv_version() -> Result<String> {
    Ok(core::get_version_string()?)
}

fn check_buffer(len: usize, width: u32, height: u32, channels: usize) -> Result<()> {
    let expected = width as usize * height as usize * channels;
    if width == 0 || height == 0 {
        return Err(Error::InvalidInput(format!(
            "image size {width}x{height} is empty"
        )));
    }
    if len != expected {
        return Err(Error::InvalidInput(format!(
            "buffer has {len} bytes, expected {expected} for {width}x{height}x{channels}"
        )));
    }
    Ok(())
}

fn check_pattern(pattern_width: usize, pattern_height: usize) -> Result<Size> {
    if pattern_width < 2 || pattern_height < 2 {
        return Err(Error::InvalidInput(format!(
            "pattern {pattern_width}x{pattern_height} needs at least 2x2 corners"
        )));
    }
    Ok(Size::new(pattern_width as i32, pattern_height as i32))
}

/// Copy a mono8 buffer into an owned single channel `Mat`.
fn mono8_mat(mono8: &[u8], width: u32, height: u32) -> Result<Mat> {
    check_buffer(mono8.len(), width, height, 1)?;
    Ok(Mat::from_slice_rows_cols(mono8, height as usize, width as usize)?)
}

/// Find the inner corners of a chessboard and refine them to sub-pixel
/// accuracy.
///
/// `pattern_width` and `pattern_height` count inner corners, so a board of
/// 8x6 squares has a 7x5 pattern. Returns `Ok(None)` when no complete board
/// is visible.
pub fn find_chessboard_corners(
    mono8: &[u8],
    im_width: u32,
    im_height: u32,
    pattern_width: usize,
    pattern_height: usize,
) -> Result<Option<Vec<(f32, f32)>>> {
    find_chessboard_corners_with(
        mono8,
        im_width,
        im_height,
        pattern_width,
        pattern_height,
        &SubPixCriteria::default(),
    )
}

pub fn find_chessboard_corners_with(
    mono8: &[u8],
    im_width: u32,
    im_height: u32,
    pattern_width: usize,
    pattern_height: usize,
    criteria: &SubPixCriteria,
) -> Result<Option<Vec<(f32, f32)>>> {
    let pattern_size = check_pattern(pattern_width, pattern_height)?;
    let term_criteria = criteria.to_cv()?;
    let gray = mono8_mat(mono8, im_width, im_height)?;

    let mut corners = Vector::<Point2f>::new();
    let found = calib3d::find_chessboard_corners(
        &gray,
        pattern_size,
        &mut corners,
        calib3d::CALIB_CB_ADAPTIVE_THRESH | calib3d::CALIB_CB_NORMALIZE_IMAGE,
    )?;
    if !found {
        return Ok(None);
    }

    imgproc::corner_sub_pix(
        &gray,
        &mut corners,
        Size::new(criteria.window.0, criteria.window.1),
        // no dead zone in the middle of the search window
        Size::new(-1, -1),
        term_criteria,
    )?;

    Ok(Some(corners.iter().map(|pt| (pt.x, pt.y)).collect()))
}

/// Render detected corners on top of a gray image.
///
/// Returns an RGB8 buffer of the same size as the input.
pub fn draw_chessboard_corners(
    mono8: &[u8],
    im_width: u32,
    im_height: u32,
    pattern_width: usize,
    pattern_height: usize,
    corners: &[(f32, f32)],
    pattern_was_found: bool,
) -> Result<Vec<u8>> {
    let pattern_size = check_pattern(pattern_width, pattern_height)?;
    let gray = mono8_mat(mono8, im_width, im_height)?;

    let mut rgb = Mat::default();
    imgproc::cvt_color(&gray, &mut rgb, imgproc::COLOR_GRAY2RGB, 0)?;

    let corners: Vector<Point2f> = corners.iter().map(|&(x, y)| Point2f::new(x, y)).collect();
    calib3d::draw_chessboard_corners(&mut rgb, pattern_size, &corners, pattern_was_found)?;

    Ok(rgb.data_bytes()?.to_vec())
}

/// Estimate intrinsics, distortion and per-view poses from point
/// correspondences, one inner `Vec` per view.
pub fn calibrate_camera(
    all_pts: &[Vec<CorrespondingPoint>],
    width: u32,
    height: u32,
) -> Result<CalibrationResult> {
    if all_pts.is_empty() {
        return Err(Error::InvalidInput("no views to calibrate from".into()));
    }
    if let Some(idx) = all_pts.iter().position(|view| view.len() < 4) {
        return Err(Error::InvalidInput(format!(
            "view {idx} has {} points, need at least 4",
            all_pts[idx].len()
        )));
    }

    let mut object_points = Vector::<Vector<Point3f>>::with_capacity(all_pts.len());
    let mut image_points = Vector::<Vector<Point2f>>::with_capacity(all_pts.len());
    for view in all_pts.iter() {
        let obj: Vector<Point3f> = view
            .iter()
            .map(|pt| {
                let (x, y, z) = pt.object_point;
                Point3f::new(x as f32, y as f32, z as f32)
            })
            .collect();
        let img: Vector<Point2f> = view
            .iter()
            .map(|pt| Point2f::new(pt.image_point.0 as f32, pt.image_point.1 as f32))
            .collect();
        object_points.push(obj);
        image_points.push(img);
    }

    let mut camera_matrix = Mat::default();
    let mut dist_coeffs = Mat::default();
    let mut rvecs = Vector::<Mat>::new();
    let mut tvecs = Vector::<Mat>::new();

    let rms_reprojection_error = calib3d::calibrate_camera(
        &object_points,
        &image_points,
        Size::new(width as i32, height as i32),
        &mut camera_matrix,
        &mut dist_coeffs,
        &mut rvecs,
        &mut tvecs,
        0,
        TermCriteria::new(
            TermCriteria_Type::COUNT as i32 + TermCriteria_Type::EPS as i32,
            30,
            f64::EPSILON,
        )?,
    )?;
    debug!("calibrateCamera finished with RMS {rms_reprojection_error}");

    let mut k = [0.0; 9];
    for row in 0..3 {
        for col in 0..3 {
            k[row * 3 + col] = *camera_matrix.at_2d::<f64>(row as i32, col as i32)?;
        }
    }

    let mut distortion_coeffs = [0.0; 5];
    let n_dist = dist_coeffs.total().min(5);
    for (i, coeff) in distortion_coeffs.iter_mut().enumerate().take(n_dist) {
        *coeff = *dist_coeffs.at::<f64>(i as i32)?;
    }

    let rotation_vectors = rvecs.iter().map(|m| vec3(&m)).collect::<Result<Vec<_>>>()?;
    let translation_vectors = tvecs.iter().map(|m| vec3(&m)).collect::<Result<Vec<_>>>()?;

    debug_assert!(rotation_vectors.len() == all_pts.len());
    debug_assert!(translation_vectors.len() == all_pts.len());

    Ok(CalibrationResult {
        rms_reprojection_error,
        image_width: width,
        image_height: height,
        camera_matrix: k,
        distortion_coeffs,
        rotation_vectors,
        translation_vectors,
    })
}

fn vec3(m: &Mat) -> Result<[f64; 3]> {
    Ok([*m.at::<f64>(0)?, *m.at::<f64>(1)?, *m.at::<f64>(2)?])
}

/// Precomputed lookup tables to undistort images of one size.
pub struct UndistortMaps {
    map_x: Mat,
    map_y: Mat,
    width: u32,
    height: u32,
    /// camera matrix of the undistorted images, row major order
    pub new_camera_matrix: [f64; 9],
    /// region of the undistorted image holding only valid pixels, as
    /// `(x, y, width, height)`
    pub roi: (u32, u32, u32, u32),
}

impl std::fmt::Debug for UndistortMaps {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("UndistortMaps")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("new_camera_matrix", &self.new_camera_matrix)
            .field("roi", &self.roi)
            .finish_non_exhaustive()
    }
}

impl UndistortMaps {
    /// `alpha` is the free scaling parameter between 0 (only valid pixels
    /// remain) and 1 (all source pixels remain).
    pub fn new(
        camera_matrix: &[f64; 9],
        distortion_coeffs: &[f64; 5],
        width: u32,
        height: u32,
        alpha: f64,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidInput(format!(
                "image size {width}x{height} is empty"
            )));
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::InvalidInput(format!(
                "alpha {alpha} is outside [0, 1]"
            )));
        }
        let k = Mat::from_slice_rows_cols(camera_matrix.as_slice(), 3, 3)?;
        let d = Mat::from_slice(distortion_coeffs.as_slice())?;
        let size = Size::new(width as i32, height as i32);

        let mut roi = Rect::default();
        let new_k = calib3d::get_optimal_new_camera_matrix(
            &k,
            &d,
            size,
            alpha,
            size,
            Some(&mut roi),
            false,
        )?;

        let mut map_x = Mat::default();
        let mut map_y = Mat::default();
        calib3d::init_undistort_rectify_map(
            &k,
            &d,
            // empty rectification is treated as identity
            &Mat::default(),
            &new_k,
            size,
            core::CV_32FC1,
            &mut map_x,
            &mut map_y,
        )?;

        let mut new_camera_matrix = [0.0; 9];
        for row in 0..3 {
            for col in 0..3 {
                new_camera_matrix[row * 3 + col] = *new_k.at_2d::<f64>(row as i32, col as i32)?;
            }
        }

        Ok(Self {
            map_x,
            map_y,
            width,
            height,
            new_camera_matrix,
            roi: clamp_roi(roi, width, height),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Resample a mono8 image through the undistortion maps.
    pub fn remap(&self, mono8: &[u8]) -> Result<Vec<u8>> {
        let src = mono8_mat(mono8, self.width, self.height)?;
        let mut dst = Mat::default();
        imgproc::remap(
            &src,
            &mut dst,
            &self.map_x,
            &self.map_y,
            imgproc::INTER_LINEAR,
            core::BORDER_CONSTANT,
            Scalar::default(),
        )?;
        Ok(dst.data_bytes()?.to_vec())
    }
}

fn clamp_roi(roi: Rect, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let x = roi.x.clamp(0, width as i32) as u32;
    let y = roi.y.clamp(0, height as i32) as u32;
    let w = (roi.width.max(0) as u32).min(width - x);
    let h = (roi.height.max(0) as u32).min(height - y);
    (x, y, w, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Fronto-parallel board with `sq` pixel squares and a one square
    /// white margin around the pattern.
    fn render_board(cols: usize, rows: usize, sq: usize) -> (Vec<u8>, u32, u32) {
        // squares = corners + 1, plus a margin of two squares per side
        let w = (cols + 1 + 4) * sq;
        let h = (rows + 1 + 4) * sq;
        let mut buf = vec![255u8; w * h];
        for y in 0..h {
            for x in 0..w {
                let (sx, sy) = (x / sq, y / sq);
                let inside = (2..cols + 3).contains(&sx) && (2..rows + 3).contains(&sy);
                if inside && (sx + sy) % 2 == 0 {
                    buf[y * w + x] = 0;
                }
            }
        }
        (buf, w as u32, h as u32)
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        let rgb: &[u8] = b"12345678901234567890";
        let err = find_chessboard_corners(rgb, 4, 6, 3, 3).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_degenerate_pattern() {
        let (buf, w, h) = render_board(7, 5, 20);
        let err = find_chessboard_corners(&buf, w, h, 1, 5).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn blank_image_has_no_board() {
        let buf = vec![128u8; 64 * 48];
        let corners = find_chessboard_corners(&buf, 64, 48, 7, 5).unwrap();
        assert!(corners.is_none());
    }

    #[test]
    fn finds_rendered_board() {
        let sq = 20;
        let (buf, w, h) = render_board(7, 5, sq);
        let corners = find_chessboard_corners(&buf, w, h, 7, 5).unwrap().unwrap();
        assert_eq!(corners.len(), 35);
        // every corner lies on a square boundary
        for (x, y) in corners.iter() {
            let fx = *x as f64 / sq as f64;
            let fy = *y as f64 / sq as f64;
            assert!((fx - fx.round()).abs() < 0.1, "x={x}");
            assert!((fy - fy.round()).abs() < 0.1, "y={y}");
        }

        let rgb = draw_chessboard_corners(&buf, w, h, 7, 5, &corners, true).unwrap();
        assert_eq!(rgb.len(), buf.len() * 3);
    }

    #[test]
    fn custom_subpix_criteria() {
        let sq = 20;
        let (buf, w, h) = render_board(7, 5, sq);
        let criteria = SubPixCriteria {
            window: (3, 3),
            max_iter: 50,
            epsilon: 0.001,
        };
        let refined = find_chessboard_corners_with(&buf, w, h, 7, 5, &criteria)
            .unwrap()
            .unwrap();
        let default = find_chessboard_corners(&buf, w, h, 7, 5).unwrap().unwrap();
        assert_eq!(refined.len(), default.len());
        for (a, b) in refined.iter().zip(default.iter()) {
            assert!((a.0 - b.0).abs() < 0.5 && (a.1 - b.1).abs() < 0.5, "{a:?} vs {b:?}");
            let fx = a.0 as f64 / sq as f64;
            assert!((fx - fx.round()).abs() < 0.1, "x={}", a.0);
        }

        let bad_window = SubPixCriteria {
            window: (0, 0),
            ..criteria
        };
        assert!(matches!(
            find_chessboard_corners_with(&buf, w, h, 7, 5, &bad_window),
            Err(Error::InvalidInput(_))
        ));
    }

    fn rot_xy(ax: f64, ay: f64) -> [[f64; 3]; 3] {
        let (sx, cx) = ax.sin_cos();
        let (sy, cy) = ay.sin_cos();
        // Ry * Rx
        [
            [cy, sy * sx, sy * cx],
            [0.0, cx, -sx],
            [-sy, cy * sx, cy * cx],
        ]
    }

    #[test]
    fn calibrate_recovers_pinhole() {
        let (fx, fy, cx, cy) = (800.0, 800.0, 320.0, 240.0);
        let poses = [
            (0.0, 0.0),
            (0.3, 0.0),
            (0.0, 0.3),
            (-0.25, 0.2),
            (0.2, -0.3),
        ];
        let views: Vec<Vec<CorrespondingPoint>> = poses
            .iter()
            .map(|&(ax, ay)| {
                let r = rot_xy(ax, ay);
                let t = [-3.0, -2.0, 15.0];
                let mut view = Vec::new();
                for row in 0..5 {
                    for col in 0..7 {
                        let p = [col as f64, row as f64, 0.0];
                        let c: Vec<f64> = (0..3)
                            .map(|i| r[i][0] * p[0] + r[i][1] * p[1] + r[i][2] * p[2] + t[i])
                            .collect();
                        view.push(CorrespondingPoint {
                            object_point: (p[0], p[1], p[2]),
                            image_point: (fx * c[0] / c[2] + cx, fy * c[1] / c[2] + cy),
                        });
                    }
                }
                view
            })
            .collect();

        let result = calibrate_camera(&views, 640, 480).unwrap();
        assert_eq!(result.rotation_vectors.len(), poses.len());
        assert_eq!(result.translation_vectors.len(), poses.len());
        assert!(result.rms_reprojection_error < 0.01);
        assert_relative_eq!(result.camera_matrix[0], fx, max_relative = 0.01);
        assert_relative_eq!(result.camera_matrix[4], fy, max_relative = 0.01);
        assert_relative_eq!(result.camera_matrix[8], 1.0);
    }

    #[test]
    fn calibrate_needs_views() {
        let err = calibrate_camera(&[], 640, 480).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn identity_undistortion_keeps_pixels() {
        let k = [500.0, 0.0, 32.0, 0.0, 500.0, 24.0, 0.0, 0.0, 1.0];
        let maps = UndistortMaps::new(&k, &[0.0; 5], 64, 48, 1.0).unwrap();
        let (x, y, w, h) = maps.roi;
        assert!(x + w <= 64 && y + h <= 48);
        assert!(w > 60 && h > 44, "{:?}", maps.roi);
        assert_relative_eq!(maps.new_camera_matrix[0], 500.0, max_relative = 0.05);

        let src = vec![200u8; 64 * 48];
        let dst = maps.remap(&src).unwrap();
        assert_eq!(dst.len(), src.len());
        assert_eq!(dst[24 * 64 + 32], 200);
    }
}
