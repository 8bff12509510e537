/// Error type shared by all modules
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GprError>;

#[derive(Debug, Error)]
pub enum GprError {
    #[error("{path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File not found: {0:?}")]
    NotFound(PathBuf),

    #[error("No '{key}' key in metadata of {path:?}")]
    MissingKey { key: String, path: PathBuf },

    #[error("Invalid value for '{key}' in {path:?}: {value}")]
    InvalidValue {
        key: String,
        value: String,
        path: PathBuf,
    },

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Step error: {0}")]
    Step(String),

    #[error("CSV error in {path:?} line {line}: {message}")]
    Csv {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Particle-size error: {0}")]
    Psa(String),

    #[error("NetCDF error: {0}")]
    NetCdf(#[from] netcdf::error::Error),
}

impl GprError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        GprError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<String> for GprError {
    fn from(message: String) -> Self {
        GprError::Step(message)
    }
}
