use clap::Parser;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct CliArgs {
    /// Pattern width (the number of horizontal inner corners in the image)
    pattern_width: usize,
    /// Pattern height (the number of vertical inner corners in the image)
    pattern_height: usize,
    /// Input image
    image: std::path::PathBuf,
    /// Write a copy of the input with the detection drawn on it
    #[arg(long)]
    draw: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let gray = image::open(&args.image)?.to_luma8();
    let (w, h) = gray.dimensions();

    let start = std::time::Instant::now();
    let corners = opencv_calibrate::find_chessboard_corners(
        gray.as_raw(),
        w,
        h,
        args.pattern_width,
        args.pattern_height,
    )?;
    let seconds = start.elapsed().as_secs_f64();
    println!("# processing duration: {}", seconds);

    if let Some(out_path) = &args.draw {
        let found = corners.is_some();
        let pts = corners.as_deref().unwrap_or(&[]);
        let rgb = opencv_calibrate::draw_chessboard_corners(
            gray.as_raw(),
            w,
            h,
            args.pattern_width,
            args.pattern_height,
            pts,
            found,
        )?;
        let img = image::RgbImage::from_raw(w, h, rgb)
            .ok_or_else(|| anyhow::anyhow!("drawn image has unexpected size"))?;
        img.save(out_path)?;
    }

    match corners {
        Some(corners) => {
            let corners_yaml = serde_yaml::to_string(&corners)?;
            println!("{}", corners_yaml);
        }
        None => {
            println!("# no {}x{} chessboard found", args.pattern_width, args.pattern_height);
        }
    }
    Ok(())
}
