use std::path::{Path, PathBuf};

use nalgebra::{RealField, Rotation3, RowVector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

mod error;
pub use error::{Error, Result};

pub use opencv_calibrate::CalibrationResult;

type Coords3D = (f64, f64, f64);
type Coords2D = (f64, f64);

/// File name of the persisted 3x3 camera matrix.
pub const CAMERA_MATRIX_FNAME: &str = "camera_matrix.yaml";
/// File name of the persisted 1x5 distortion coefficients.
pub const DIST_COEFS_FNAME: &str = "dist_coefs.yaml";

/// Number of inner corners of a chessboard pattern.
///
/// A board of 8x6 squares has a 7x5 pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSize {
    /// corners per row
    pub width: usize,
    /// corners per column
    pub height: usize,
}

impl PatternSize {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn num_corners(&self) -> usize {
        self.width * self.height
    }
}

impl Default for PatternSize {
    fn default() -> Self {
        Self::new(7, 5)
    }
}

impl std::fmt::Display for PatternSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{},{}", self.width, self.height)
    }
}

impl std::str::FromStr for PatternSize {
    type Err = Error;

    /// Parse `cols,rows` (or `colsxrows`).
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidPattern(s.to_string());
        let (w, h) = s
            .trim()
            .split_once(',')
            .or_else(|| s.trim().split_once(['x', 'X']))
            .ok_or_else(invalid)?;
        let width: usize = w.trim().parse().map_err(|_| invalid())?;
        let height: usize = h.trim().parse().map_err(|_| invalid())?;
        if width < 2 || height < 2 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerBoardData {
    n_rows: usize,
    n_cols: usize,
    points: Vec<Coords2D>,
}

impl CheckerBoardData {
    pub fn new(n_rows: usize, n_cols: usize, points: &[Coords2D]) -> Self {
        let points = points.to_vec();
        Self {
            n_rows,
            n_cols,
            points,
        }
    }

    /// Build from detector output for a pattern.
    pub fn from_corners(pattern: PatternSize, corners: &[(f32, f32)]) -> Self {
        let points: Vec<Coords2D> = corners.iter().map(|c| (c.0 as f64, c.1 as f64)).collect();
        Self::new(pattern.height, pattern.width, &points)
    }

    pub fn points(&self) -> &[Coords2D] {
        &self.points
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelSize {
    width: usize,
    height: usize,
}

impl PixelSize {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }
}

/// Board-frame coordinates of every corner of every board.
///
/// Corner `j` sits at column `j % n_cols` and row `j / n_cols`, matching
/// the row-major order of the corner detector. All points lie on `z = 0`.
pub fn mk_object_points(data: &[CheckerBoardData], square_size: f64) -> Vec<Vec<Coords3D>> {
    let mut result = Vec::with_capacity(data.len());
    for b in data.iter() {
        let num_pts = b.n_cols * b.n_rows;
        let mut opts_loc: Vec<Coords3D> = Vec::with_capacity(num_pts);
        for j in 0..num_pts {
            let x = (j % b.n_cols) as f64 * square_size;
            let y = (j / b.n_cols) as f64 * square_size;
            opts_loc.push((x, y, 0.0));
        }
        result.push(opts_loc);
    }
    result
}

fn check_views(data: &[CheckerBoardData]) -> Result<()> {
    if data.is_empty() {
        return Err(Error::NoViews);
    }
    for (view, b) in data.iter().enumerate() {
        let expected = b.n_rows * b.n_cols;
        if b.points.len() != expected {
            return Err(Error::WrongPointCount {
                view,
                n_cols: b.n_cols,
                n_rows: b.n_rows,
                expected,
                actual: b.points.len(),
            });
        }
    }
    Ok(())
}

/// Given some checkerboard corner locations, compute intrinsics using OpenCV.
pub fn compute_intrinsics_with_raw_opencv(
    size: PixelSize,
    data: &[CheckerBoardData],
    square_size: f64,
) -> Result<CalibrationResult> {
    check_views(data)?;

    let object_points: Vec<Vec<Coords3D>> = mk_object_points(data, square_size);
    debug_assert!(object_points.len() == data.len());

    use opencv_calibrate::CorrespondingPoint;
    let pts: Vec<Vec<CorrespondingPoint>> = object_points
        .into_iter()
        .zip(data.iter())
        .map(|(obj_pts, board)| {
            obj_pts
                .into_iter()
                .zip(board.points.iter())
                .map(|(obj_pt, im_pt)| CorrespondingPoint {
                    object_point: obj_pt,
                    image_point: *im_pt,
                })
                .collect()
        })
        .collect();

    debug!(
        "calibrating {}x{} camera from {} views",
        size.width,
        size.height,
        pts.len()
    );
    Ok(opencv_calibrate::calibrate_camera(
        &pts,
        size.width as u32,
        size.height as u32,
    )?)
}

pub fn convert_to_cam_geom<R: RealField>(
    opencv_results: &CalibrationResult,
) -> opencv_ros_camera::RosOpenCvIntrinsics<R> {
    intrinsics_from_arrays(&opencv_results.camera_matrix, &opencv_results.distortion_coeffs)
}

fn intrinsics_from_arrays<R: RealField>(
    k: &[f64; 9],
    d: &[f64; 5],
) -> opencv_ros_camera::RosOpenCvIntrinsics<R> {
    let fx = nalgebra::convert(k[0]);
    let skew = nalgebra::convert(k[1]);
    let fy = nalgebra::convert(k[4]);
    let cx = nalgebra::convert(k[2]);
    let cy = nalgebra::convert(k[5]);
    let dist = nalgebra::Vector5::new(
        nalgebra::convert(d[0]),
        nalgebra::convert(d[1]),
        nalgebra::convert(d[2]),
        nalgebra::convert(d[3]),
        nalgebra::convert(d[4]),
    );
    let dist = opencv_ros_camera::Distortion::from_opencv_vec(dist);

    opencv_ros_camera::RosOpenCvIntrinsics::from_params_with_distortion(fx, skew, fy, cx, cy, dist)
}

/// Agreement between detected corners and corners reprojected through the
/// calibrated model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReprojectionError {
    /// `sqrt(sum(d^2) / n)` over all corners of all views, in pixels
    pub rms_pixels: f64,
    /// `sum(d) / n`, in pixels
    pub mean_distance_pixels: f64,
    pub num_points: usize,
}

/// Reproject every board corner through its view's pose and the calibrated
/// intrinsics and distortion, then compare against the detections.
pub fn reprojection_error(
    result: &CalibrationResult,
    data: &[CheckerBoardData],
    square_size: f64,
) -> Result<ReprojectionError> {
    check_views(data)?;
    if result.rotation_vectors.len() != data.len() || result.translation_vectors.len() != data.len()
    {
        return Err(Error::PoseCountMismatch {
            views: data.len(),
            poses: result.rotation_vectors.len(),
        });
    }

    let intrinsics = convert_to_cam_geom::<f64>(result);
    let k = &result.camera_matrix;
    let object_points = mk_object_points(data, square_size);

    let mut sum_sq = 0.0;
    let mut sum_dist = 0.0;
    let mut num_points = 0;
    for (i, (obj_pts, board)) in object_points.iter().zip(data.iter()).enumerate() {
        let rot = Rotation3::from_scaled_axis(Vector3::from(result.rotation_vectors[i]));
        let t = Vector3::from(result.translation_vectors[i]);
        for (obj_pt, im_pt) in obj_pts.iter().zip(board.points.iter()) {
            let cam = rot * Vector3::new(obj_pt.0, obj_pt.1, obj_pt.2) + t;
            let (xn, yn) = (cam.x / cam.z, cam.y / cam.z);
            let undist = opencv_ros_camera::UndistortedPixels {
                data: RowVector2::<f64>::new(k[0] * xn + k[1] * yn + k[2], k[4] * yn + k[5]),
            };
            let dist = intrinsics.distort(&undist).data;
            let dx = im_pt.0 - dist[(0, 0)];
            let dy = im_pt.1 - dist[(0, 1)];
            let d2 = dx * dx + dy * dy;
            sum_sq += d2;
            sum_dist += d2.sqrt();
            num_points += 1;
        }
    }

    let n = num_points as f64;
    Ok(ReprojectionError {
        rms_pixels: (sum_sq / n).sqrt(),
        mean_distance_pixels: sum_dist / n,
        num_points,
    })
}

/// A dense row-major matrix as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Array2 {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

/// The two arrays that make up a saved calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicsArrays {
    pub camera_matrix: [f64; 9],
    pub distortion_coeffs: [f64; 5],
}

impl From<&CalibrationResult> for IntrinsicsArrays {
    fn from(orig: &CalibrationResult) -> Self {
        Self {
            camera_matrix: orig.camera_matrix,
            distortion_coeffs: orig.distortion_coeffs,
        }
    }
}

fn write_array(path: &Path, array: &Array2) -> Result<()> {
    let f = std::fs::File::create(path)?;
    serde_yaml::to_writer(f, array)?;
    Ok(())
}

fn read_array(path: &Path) -> Result<Array2> {
    let f = std::fs::File::open(path)?;
    Ok(serde_yaml::from_reader(f)?)
}

/// Write `camera_matrix.yaml` and `dist_coefs.yaml` into `dir`.
///
/// Returns the paths of the written files.
pub fn save_arrays<P: AsRef<Path>>(dir: P, arrays: &IntrinsicsArrays) -> Result<[PathBuf; 2]> {
    let dir = dir.as_ref();
    let k_path = dir.join(CAMERA_MATRIX_FNAME);
    let d_path = dir.join(DIST_COEFS_FNAME);
    write_array(
        &k_path,
        &Array2 {
            rows: 3,
            cols: 3,
            data: arrays.camera_matrix.to_vec(),
        },
    )?;
    write_array(
        &d_path,
        &Array2 {
            rows: 1,
            cols: 5,
            data: arrays.distortion_coeffs.to_vec(),
        },
    )?;
    Ok([k_path, d_path])
}

/// Read back the arrays written by [save_arrays].
///
/// Distortion may be stored as a row or a column.
pub fn load_arrays<P: AsRef<Path>>(dir: P) -> Result<IntrinsicsArrays> {
    let dir = dir.as_ref();
    let k = read_array(&dir.join(CAMERA_MATRIX_FNAME))?;
    let d = read_array(&dir.join(DIST_COEFS_FNAME))?;

    let camera_matrix: [f64; 9] = match (k.rows, k.cols, k.data.as_slice().try_into()) {
        (3, 3, Ok(data)) => data,
        _ => {
            return Err(Error::BadArrayShape {
                name: CAMERA_MATRIX_FNAME,
                expected: "3x3",
                rows: k.rows,
                cols: k.cols,
                len: k.data.len(),
            });
        }
    };
    let distortion_coeffs: [f64; 5] = match (d.rows * d.cols, d.data.as_slice().try_into()) {
        (5, Ok(data)) if d.rows == 1 || d.cols == 1 => data,
        _ => {
            return Err(Error::BadArrayShape {
                name: DIST_COEFS_FNAME,
                expected: "1x5",
                rows: d.rows,
                cols: d.cols,
                len: d.data.len(),
            });
        }
    };
    Ok(IntrinsicsArrays {
        camera_matrix,
        distortion_coeffs,
    })
}

/// Save the calibration as a ROS `camera_info` YAML file.
pub fn save_yaml<P: AsRef<Path>>(
    cam_info_file_stamped: P,
    pkg_name: &str,
    local: chrono::DateTime<chrono::Local>,
    raw_opencv_cal: &CalibrationResult,
    mean_reprojection_distance_pixels: f64,
    raw_cam_name: &str,
) -> Result<()> {
    let intrinsics = convert_to_cam_geom::<f64>(raw_opencv_cal);

    let ci: opencv_ros_camera::RosCameraInfo<_> = opencv_ros_camera::NamedIntrinsicParameters {
        intrinsics,
        width: raw_opencv_cal.image_width as usize,
        height: raw_opencv_cal.image_height as usize,
        name: raw_cam_name.into(),
    }
    .into();

    let mut f = std::fs::File::create(&cam_info_file_stamped)?;
    std::io::Write::write_all(
        &mut f,
        format!(
            "# Saved by {} at {}\n\
                        # Mean reprojection distance: {:.2}\n",
            pkg_name, local, mean_reprojection_distance_pixels
        )
        .as_bytes(),
    )?;
    serde_yaml::to_writer(f, &ci)?;
    Ok(())
}
