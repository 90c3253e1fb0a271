/// Errors from calibrating, evaluating or persisting a camera model.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("calibration failed: {source}")]
    OpenCvCalibrate {
        #[from]
        source: opencv_calibrate::Error,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("invalid pattern \"{0}\", expected cols,rows with at least 2 corners each")]
    InvalidPattern(String),
    #[error("no checkerboard views to calibrate from")]
    NoViews,
    #[error("view {view} has {actual} corners, but a {n_cols}x{n_rows} pattern has {expected}")]
    WrongPointCount {
        view: usize,
        n_cols: usize,
        n_rows: usize,
        expected: usize,
        actual: usize,
    },
    #[error("{views} views but {poses} poses")]
    PoseCountMismatch { views: usize, poses: usize },
    #[error("{name}: expected {expected}, found {rows}x{cols} with {len} values")]
    BadArrayShape {
        name: &'static str,
        expected: &'static str,
        rows: usize,
        cols: usize,
        len: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
