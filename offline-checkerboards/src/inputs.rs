use std::path::PathBuf;

use camino::Utf8Path;
use eyre::{self as anyhow, Result};

/// File extensions picked up when the input is a directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

const MATCH_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

fn glob_files(pattern: &str, paths: &mut Vec<PathBuf>) -> Result<()> {
    for path in glob::glob_with(pattern, MATCH_OPTIONS)? {
        let path = path?;
        if path.is_file() {
            paths.push(path);
        }
    }
    Ok(())
}

/// List the images to process, sorted by name.
///
/// `input` is either a directory, in which case every file with one of
/// [IMAGE_EXTENSIONS] is used, or a glob mask such as `cal/2015*.jpg`.
pub fn get_image_files(input: &str) -> Result<Vec<PathBuf>> {
    let input_path = Utf8Path::new(input);
    let mut paths = vec![];

    if input_path.is_dir() {
        let escaped = glob::Pattern::escape(input_path.as_str());
        for ext in IMAGE_EXTENSIONS {
            let pattern = Utf8Path::new(&escaped).join(format!("*.{ext}"));
            glob_files(pattern.as_str(), &mut paths)?;
        }
    } else {
        glob_files(input, &mut paths)?;
    }

    if paths.is_empty() {
        anyhow::bail!("no image files in \"{input}\"");
    }

    paths.sort();
    paths.dedup();
    Ok(paths)
}
