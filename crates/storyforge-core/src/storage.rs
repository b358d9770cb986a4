use crate::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Writes `value` as indented UTF-8 JSON atomically: serialize to
/// `path.tmp`, then rename over `path` (§6: "All persistent writes are
/// atomic"). Creates parent directories as needed.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| CoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let body = serde_json::to_string_pretty(value).map_err(|source| CoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = tmp_path(path);
    std::fs::write(&tmp, body.as_bytes()).map_err(|source| CoreError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| CoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Reads and parses `path`, or returns `T::default()` when it doesn't
/// exist yet. A file that exists but fails to parse is a hard error: the
/// core never silently discards data it cannot read back.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match std::fs::read_to_string(path) {
        Ok(body) => serde_json::from_str(&body).map_err(|source| CoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(CoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Reads and parses `path`, returning `None` when it doesn't exist. Useful
/// where there's no sensible `Default` (e.g. a schema that must be
/// authored before a story can run).
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(body) => serde_json::from_str(&body)
            .map(Some)
            .map_err(|source| CoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            }),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    std::path::PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        a: i64,
        b: String,
    }

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sample.json");
        let value = Sample {
            a: 7,
            b: "嗨".to_string(),
        };
        write_json_atomic(&path, &value).unwrap();
        assert!(path.exists());
        assert!(!tmp_path(&path).exists());

        let read_back: Sample = read_json_or_default(&path).unwrap();
        assert_eq!(read_back, value);
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let value: Sample = read_json_or_default(&path).unwrap();
        assert_eq!(value, Sample::default());
    }

    #[test]
    fn corrupt_file_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = read_json_or_default::<Sample>(&path).unwrap_err();
        assert!(matches!(err, CoreError::Corrupt { .. }));
    }
}
