use std::{
    collections::{HashMap, hash_map::Entry},
    path::{Path, PathBuf},
};

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use eyre::{self as anyhow, Context, Result};
use image::GrayImage;
use tracing::{debug, error, info, warn};

use camcal::{CheckerBoardData, IntrinsicsArrays, PatternSize, PixelSize, ReprojectionError};
use undistort_image::UndistortionCache;

mod inputs;
pub use inputs::{IMAGE_EXTENSIONS, get_image_files};

/// Fewer views than this rarely give a trustworthy calibration.
pub const MIN_RECOMMENDED_VIEWS: usize = 10;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Also write log messages to this file
    #[arg(long, global = true, env = "CAL_LOG_FILE")]
    pub log_file: Option<Utf8PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Find chessboards, calibrate, undistort the inputs and save the model
    Calibrate(CalibrateArgs),
    /// Undistort images with a previously saved model
    Undistort(UndistortArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CalibrateArgs {
    /// Input directory (with .png, .jpg, .bmp, or .tiff files) or a glob
    /// mask such as "images/2015*.jpg"
    #[arg(env = "CAL_INPUT")]
    pub input: String,
    /// Output directory for the model and the debug images
    #[arg(short, long, default_value = "output", env = "CAL_OUTDIR")]
    pub outdir: Utf8PathBuf,
    /// Checkerboard pattern as cols,rows in number of inner corners (e.g.
    /// 8x6 checks would be 7,5 corners)
    #[arg(short, long, default_value_t = PatternSize::default(), env = "CAL_PATTERN")]
    pub pattern: PatternSize,
    /// Length of a square side. Sets the unit of the board poses only.
    #[arg(long, default_value_t = 1.0)]
    pub square_size: f64,
    /// Free scaling for undistorted images: 0 keeps only valid pixels, 1
    /// keeps all source pixels
    #[arg(long, default_value_t = 1.0)]
    pub alpha: f64,
    /// Do not write undistorted copies of the inputs
    #[arg(long)]
    pub no_undistort: bool,
    /// Do not write images annotated with the detected corners
    #[arg(long)]
    pub no_debug_images: bool,
    /// Camera name stored in the camera info file (default: derived from
    /// the input)
    #[arg(long)]
    pub camera_name: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct UndistortArgs {
    /// Input directory or glob mask, as for `calibrate`
    #[arg(env = "CAL_INPUT")]
    pub input: String,
    /// Output directory for the undistorted images
    #[arg(short, long, default_value = "output", env = "CAL_OUTDIR")]
    pub outdir: Utf8PathBuf,
    /// Directory holding camera_matrix.yaml and dist_coefs.yaml
    #[arg(long, default_value = "output")]
    pub calibration_dir: Utf8PathBuf,
    /// Free scaling for undistorted images, as for `calibrate`
    #[arg(long, default_value_t = 1.0)]
    pub alpha: f64,
}

/// What a calibration run found and wrote.
#[derive(Debug, Clone)]
pub struct CalibrationSummary {
    pub num_images: usize,
    pub num_detected: usize,
    pub image_width: u32,
    pub image_height: u32,
    /// RMS error reported by the optimizer
    pub rms_reprojection_error: f64,
    pub reprojection: ReprojectionError,
    pub intrinsics: IntrinsicsArrays,
    pub written_files: Vec<PathBuf>,
}

fn file_stem(fname: &Path) -> String {
    fname
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".into())
}

fn open_gray(fname: &Path) -> Result<GrayImage> {
    let img = image::open(fname).with_context(|| format!("Opening {}", fname.display()))?;
    Ok(img.to_luma8())
}

fn default_camera_name(input: &str) -> String {
    let path = Path::new(input);
    let base = if path.is_dir() {
        Some(path)
    } else {
        path.parent()
    };
    base.and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "camera".into())
}

/// Detect, calibrate, evaluate, undistort and save.
pub fn run_cal(cli: CalibrateArgs) -> Result<CalibrationSummary> {
    let start = std::time::Instant::now();
    let pattern = cli.pattern;
    let outdir = cli.outdir;

    match opencv_calibrate::opencv_version() {
        Ok(v) => info!("OpenCV {v}"),
        Err(e) => warn!("OpenCV version unknown: {e}"),
    }
    info!("Input: {}", cli.input);
    info!("Output dir: {outdir}");

    let fnames = get_image_files(&cli.input)?;
    std::fs::create_dir_all(&outdir).with_context(|| format!("Creating {outdir}"))?;

    info!(
        "Attempting to find {}x{} chessboard in {} images.",
        pattern.width,
        pattern.height,
        fnames.len()
    );

    let mut written_files = Vec::new();
    let mut image_size: Option<(u32, u32)> = None;
    let mut goodcorners: Vec<CheckerBoardData> = Vec::with_capacity(fnames.len());

    for fname in fnames.iter() {
        let gray = match open_gray(fname) {
            Ok(gray) => gray,
            Err(e) => {
                error!("Skipping image: {e:#}");
                continue;
            }
        };
        let (w, h) = gray.dimensions();
        match image_size {
            None => image_size = Some((w, h)),
            Some((w0, h0)) if (w0, h0) != (w, h) => {
                warn!(
                    "Skipping {}: size {w}x{h} differs from {w0}x{h0}.",
                    fname.display()
                );
                continue;
            }
            Some(_) => {}
        }

        let corners = match opencv_calibrate::find_chessboard_corners(
            gray.as_raw(),
            w,
            h,
            pattern.width,
            pattern.height,
        ) {
            Ok(corners) => corners,
            Err(e) => {
                error!("Chessboard detection failed in {}: {e}", fname.display());
                continue;
            }
        };

        let Some(corners) = corners else {
            error!("Chessboard not found in: {}", fname.display());
            continue;
        };
        info!("Chessboard found in: {}", fname.display());
        debug!("    {} corners.", corners.len());
        debug_assert_eq!(corners.len(), pattern.num_corners());

        if !cli.no_debug_images {
            let out = outdir.join(format!("{}_output.bmp", file_stem(fname)));
            match write_debug_image(&gray, pattern, &corners, out.as_std_path()) {
                Ok(()) => written_files.push(out.into_std_path_buf()),
                Err(e) => error!("Not writing annotated image: {e:#}"),
            }
        }
        goodcorners.push(CheckerBoardData::from_corners(pattern, &corners));
    }

    let num_detected = goodcorners.len();
    info!("Images passed chessboard detection: {num_detected}");
    let (image_width, image_height) = match image_size {
        Some(size) if num_detected > 0 => size,
        _ => anyhow::bail!(
            "no {}x{} chessboard found in any of {} images",
            pattern.width,
            pattern.height,
            fnames.len()
        ),
    };
    if num_detected < MIN_RECOMMENDED_VIEWS {
        warn!(
            "Only {num_detected} views found. At least {MIN_RECOMMENDED_VIEWS} at varying angles \
             and distances are recommended."
        );
    }

    let size = PixelSize::new(image_width as usize, image_height as usize);
    let raw_opencv_cal =
        camcal::compute_intrinsics_with_raw_opencv(size, &goodcorners, cli.square_size)?;
    let reprojection = camcal::reprojection_error(&raw_opencv_cal, &goodcorners, cli.square_size)?;
    info!("Mean reprojection error: {}", reprojection.rms_pixels);
    debug!(
        "got calibrated intrinsics: {:?}",
        camcal::convert_to_cam_geom::<f64>(&raw_opencv_cal)
    );

    let intrinsics = IntrinsicsArrays::from(&raw_opencv_cal);

    if !cli.no_undistort {
        written_files.extend(undistort_all(&fnames, &outdir, &intrinsics, cli.alpha)?);
    }

    let [k_path, d_path] = camcal::save_arrays(&outdir, &intrinsics)?;
    info!("Saved {} and {}", k_path.display(), d_path.display());
    written_files.push(k_path);
    written_files.push(d_path);

    let cam_name = cli
        .camera_name
        .unwrap_or_else(|| default_camera_name(&cli.input));
    let local = chrono::Local::now();
    let cam_info_file_stamped =
        outdir.join(format!("{cam_name}.{}.yaml", local.format("%Y%m%d_%H%M%S")));
    let cam_info_file = outdir.join(format!("{cam_name}.yaml"));

    // Save timestamped version first for backup purposes (since below
    // we overwrite the non-timestamped file).
    camcal::save_yaml(
        &cam_info_file_stamped,
        env!["CARGO_PKG_NAME"],
        local,
        &raw_opencv_cal,
        reprojection.mean_distance_pixels,
        &cam_name,
    )?;

    // Now copy the successfully saved file into the non-timestamped
    // name. This will overwrite an existing file.
    std::fs::copy(&cam_info_file_stamped, &cam_info_file)
        .with_context(|| format!("Copying to file {cam_info_file}"))?;
    info!("Saved camera calibration to file: {cam_info_file}");
    written_files.push(cam_info_file_stamped.into_std_path_buf());
    written_files.push(cam_info_file.into_std_path_buf());

    info!("RMS: {}", raw_opencv_cal.rms_reprojection_error);
    info!("Camera matrix: {:?}", intrinsics.camera_matrix);
    info!("Distortion coefficients: {:?}", intrinsics.distortion_coeffs);
    info!("Elapse time: {:.2} seconds", start.elapsed().as_secs_f64());

    Ok(CalibrationSummary {
        num_images: fnames.len(),
        num_detected,
        image_width,
        image_height,
        rms_reprojection_error: raw_opencv_cal.rms_reprojection_error,
        reprojection,
        intrinsics,
        written_files,
    })
}

fn write_debug_image(
    gray: &GrayImage,
    pattern: PatternSize,
    corners: &[(f32, f32)],
    out: &Path,
) -> Result<()> {
    let (w, h) = gray.dimensions();
    let rgb = opencv_calibrate::draw_chessboard_corners(
        gray.as_raw(),
        w,
        h,
        pattern.width,
        pattern.height,
        corners,
        true,
    )?;
    let vis = image::RgbImage::from_raw(w, h, rgb)
        .ok_or_else(|| anyhow::eyre!("annotated image has unexpected size"))?;
    vis.save(out)
        .with_context(|| format!("Saving {}", out.display()))?;
    Ok(())
}

/// Undistort every readable image into `outdir`.
///
/// Maps are built once per image size.
fn undistort_all(
    fnames: &[PathBuf],
    outdir: &Utf8PathBuf,
    intrinsics: &IntrinsicsArrays,
    alpha: f64,
) -> Result<Vec<PathBuf>> {
    let mut caches: HashMap<(u32, u32), UndistortionCache> = HashMap::new();
    let mut written = Vec::with_capacity(fnames.len());
    for fname in fnames.iter() {
        debug!("Reading image: {}", fname.display());
        let gray = match open_gray(fname) {
            Ok(gray) => gray,
            Err(e) => {
                error!("Skipping image: {e:#}");
                continue;
            }
        };
        let (w, h) = gray.dimensions();
        let cache = match caches.entry((w, h)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!("Computing undistortion maps for {w}x{h}.");
                entry.insert(UndistortionCache::new(intrinsics, w, h, alpha)?)
            }
        };
        let dst = undistort_image::undistort_image(&gray, cache)?;
        let out = outdir.join(format!("{}_undistort_output.bmp", file_stem(fname)));
        debug!("Writing image: {out}");
        dst.save(&out).with_context(|| format!("Saving {out}"))?;
        written.push(out.into_std_path_buf());
    }
    info!("Undistorted {} images.", written.len());
    Ok(written)
}

/// Undistort images using the arrays saved by a previous [run_cal].
pub fn run_undistort(cli: UndistortArgs) -> Result<Vec<PathBuf>> {
    let intrinsics = camcal::load_arrays(&cli.calibration_dir)
        .with_context(|| format!("Loading calibration from {}", cli.calibration_dir))?;
    info!("Camera matrix: {:?}", intrinsics.camera_matrix);
    info!("Distortion coefficients: {:?}", intrinsics.distortion_coeffs);

    let fnames = get_image_files(&cli.input)?;
    std::fs::create_dir_all(&cli.outdir).with_context(|| format!("Creating {}", cli.outdir))?;

    let written = undistort_all(&fnames, &cli.outdir, &intrinsics, cli.alpha)?;
    if written.is_empty() {
        anyhow::bail!("no readable image in \"{}\"", cli.input);
    }
    Ok(written)
}
