//! Typed loading of configuration and manifest files.
//!
//! The format is picked from the file extension.

use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Yaml,
    Json,
}

impl Format {
    /// Detect the format from a path's extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            _ => Err(Error::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

/// Parse a document from a string in the given format.
///
/// `path` is only used for error messages.
pub fn parse_str<T: DeserializeOwned>(content: &str, format: Format, path: &Path) -> Result<T> {
    match format {
        Format::Toml => toml::from_str(content).map_err(|e| Error::TomlParseFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        Format::Yaml => serde_yaml::from_str(content).map_err(|e| Error::YamlParseFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        Format::Json => serde_json::from_str(content).map_err(|e| Error::JsonParseFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Read and parse a file, detecting its format from the extension.
pub fn from_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let format = Format::from_path(path)?;
    debug!(path = %path.display(), format = ?format, "Loading document");
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
    parse_str(&content, format, path)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        workers: usize,
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(Format::from_path(Path::new("a.toml")).ok(), Some(Format::Toml));
        assert_eq!(Format::from_path(Path::new("a.yml")).ok(), Some(Format::Yaml));
        assert_eq!(Format::from_path(Path::new("a.json")).ok(), Some(Format::Json));
        assert!(Format::from_path(Path::new("a.ini")).is_err());
    }

    #[test]
    fn test_from_file_reads_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "name: demo\nworkers: 3").unwrap();

        let sample: Sample = from_file(file.path()).unwrap();
        assert_eq!(
            sample,
            Sample {
                name: "demo".to_string(),
                workers: 3
            }
        );
    }

    #[test]
    fn test_parse_error_names_the_file() {
        let err = parse_str::<Sample>("workers = ", Format::Toml, Path::new("bad.toml"))
            .expect_err("invalid toml must fail");
        assert!(matches!(err, Error::TomlParseFailed { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = from_file::<Sample>("/nonexistent/keystone.toml").expect_err("missing file");
        assert!(matches!(err, Error::FileReadFailed { .. }));
    }
}
