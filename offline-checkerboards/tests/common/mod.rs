#![allow(dead_code)]

use camino::Utf8PathBuf;
use eyre::Result;
use image::{GrayImage, Luma, imageops};
use nalgebra::{Rotation3, Vector3};

use offline_checkerboards::CalibrateArgs;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const F: f64 = 600.0;
pub const CX: f64 = 320.0;
pub const CY: f64 = 240.0;

// 7x5 inner corners at integer board coordinates, squares span [-1, 7) x [-1, 5)
const PATTERN_W: i64 = 7;
const PATTERN_H: i64 = 5;

fn is_black(x: f64, y: f64) -> bool {
    if x < -1.0 || x >= PATTERN_W as f64 || y < -1.0 || y >= PATTERN_H as f64 {
        return false;
    }
    (x.floor() as i64 + y.floor() as i64).rem_euclid(2) == 0
}

/// Ray trace a pinhole camera looking at the board placed with `rot` and
/// `t` (board to camera), 2x2 supersampled.
pub fn render_view(rot: &Rotation3<f64>, t: &Vector3<f64>) -> GrayImage {
    let rt = rot.inverse();
    let origin = rt * (-t);
    GrayImage::from_fn(WIDTH, HEIGHT, |u, v| {
        let mut acc = 0u32;
        for (du, dv) in [(-0.25, -0.25), (0.25, -0.25), (-0.25, 0.25), (0.25, 0.25)] {
            let dir = rt * Vector3::new(
                (u as f64 + du - CX) / F,
                (v as f64 + dv - CY) / F,
                1.0,
            );
            let s = -origin.z / dir.z;
            let black = if dir.z.abs() > 1e-12 && s > 0.0 {
                let p = origin + dir * s;
                is_black(p.x, p.y)
            } else {
                false
            };
            acc += if black { 20 } else { 235 };
        }
        Luma([(acc / 4) as u8])
    })
}

pub fn pose(rx: f64, ry: f64, rz: f64) -> (Rotation3<f64>, Vector3<f64>) {
    let rot = Rotation3::from_euler_angles(rx, ry, rz);
    // put the board center 12 units in front of the camera
    let center = Vector3::new(3.0, 2.0, 0.0);
    let t = Vector3::new(0.0, 0.0, 12.0) - rot * center;
    (rot, t)
}

/// A frontal view at half resolution, as from a second camera mode.
pub fn render_half_size_view() -> GrayImage {
    let (rot, t) = pose(0.0, 0.0, 0.0);
    imageops::resize(
        &render_view(&rot, &t),
        WIDTH / 2,
        HEIGHT / 2,
        imageops::FilterType::Triangle,
    )
}

/// Write synthetic views plus one empty frame and one corrupt file.
///
/// Returns the number of full size board views.
pub fn write_dataset(dir: &std::path::Path) -> Result<usize> {
    let poses = [
        (0.0, 0.0, 0.0),
        (0.35, 0.0, 0.0),
        (-0.35, 0.0, 0.05),
        (0.0, 0.35, 0.0),
        (0.0, -0.35, -0.05),
        (0.25, 0.25, 0.1),
        (-0.2, 0.3, -0.1),
    ];
    for (i, &(rx, ry, rz)) in poses.iter().enumerate() {
        let (rot, t) = pose(rx, ry, rz);
        render_view(&rot, &t).save(dir.join(format!("board_{i}.png")))?;
    }
    GrayImage::from_pixel(WIDTH, HEIGHT, Luma([200])).save(dir.join("empty.png"))?;
    std::fs::write(dir.join("broken.png"), b"not a png")?;
    std::fs::write(dir.join("notes.txt"), b"calibration session")?;
    Ok(poses.len())
}

pub fn utf8(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

pub fn calibrate_args(input: &Utf8PathBuf, outdir: &Utf8PathBuf) -> CalibrateArgs {
    CalibrateArgs {
        input: input.to_string(),
        outdir: outdir.clone(),
        pattern: "7,5".parse().unwrap(),
        square_size: 1.0,
        alpha: 1.0,
        no_undistort: false,
        no_debug_images: false,
        camera_name: Some("synthetic".into()),
    }
}
