use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use axum::body::Bytes;
use tempfile::{Builder, TempPath};

const MAX_NAME_LEN: usize = 100;

/// Writes uploaded images into a directory under collision-free names.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    keep: bool,
}

/// An upload persisted on disk. Dropping it removes the file unless the
/// store was configured to retain uploads.
#[derive(Debug)]
pub struct StoredUpload {
    path: PathBuf,
    _temp: Option<TempPath>,
}

impl StoredUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, keep: bool) -> Self {
        Self {
            dir: dir.into(),
            keep,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    pub async fn save(&self, filename: Option<&str>, data: Bytes) -> io::Result<StoredUpload> {
        let dir = self.dir.clone();
        let keep = self.keep;
        let suffix = format!("-{}", sanitize_filename(filename));

        tokio::task::spawn_blocking(move || -> io::Result<StoredUpload> {
            let mut file = Builder::new()
                .prefix("")
                .rand_bytes(12)
                .suffix(&suffix)
                .tempfile_in(&dir)?;
            file.write_all(&data)?;
            file.as_file().sync_all()?;

            if keep {
                let (_, path) = file.keep()?;
                Ok(StoredUpload { path, _temp: None })
            } else {
                let temp = file.into_temp_path();
                Ok(StoredUpload {
                    path: temp.to_path_buf(),
                    _temp: Some(temp),
                })
            }
        })
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
    }
}

/// Reduces a client-supplied filename to a single safe path component.
pub fn sanitize_filename(filename: Option<&str>) -> String {
    let base = filename
        .unwrap_or_default()
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();

    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_filename(Some("../../etc/passwd")), "passwd");
        assert_eq!(sanitize_filename(Some("C:\\Users\\me\\cat.jpg")), "cat.jpg");
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename(Some("my cat (1).png")), "my_cat__1_.png");
        assert_eq!(sanitize_filename(Some("ümlaut.jpg")), "_mlaut.jpg");
    }

    #[test]
    fn sanitize_falls_back_for_empty_names() {
        assert_eq!(sanitize_filename(None), "upload");
        assert_eq!(sanitize_filename(Some("")), "upload");
        assert_eq!(sanitize_filename(Some("..")), "upload");
        assert_eq!(sanitize_filename(Some("dir/")), "upload");
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_filename(Some(&long)).len(), MAX_NAME_LEN);
    }

    #[tokio::test]
    async fn upload_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path(), false);

        let upload = store
            .save(Some("cat.jpg"), Bytes::from_static(b"abc"))
            .await
            .unwrap();
        let path = upload.path().to_path_buf();

        assert!(path.starts_with(dir.path()));
        assert!(path.to_string_lossy().ends_with("-cat.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");

        drop(upload);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn upload_is_retained_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path(), true);

        let upload = store
            .save(Some("dog.png"), Bytes::from_static(b"woof"))
            .await
            .unwrap();
        let path = upload.path().to_path_buf();
        drop(upload);

        assert_eq!(std::fs::read(&path).unwrap(), b"woof");
    }

    #[tokio::test]
    async fn same_filename_does_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path(), false);

        let first = store
            .save(Some("same.jpg"), Bytes::from_static(b"1"))
            .await
            .unwrap();
        let second = store
            .save(Some("same.jpg"), Bytes::from_static(b"2"))
            .await
            .unwrap();

        assert_ne!(first.path(), second.path());
        assert_eq!(std::fs::read(first.path()).unwrap(), b"1");
        assert_eq!(std::fs::read(second.path()).unwrap(), b"2");
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().join("nope"), false);

        assert!(store
            .save(Some("x.jpg"), Bytes::from_static(b"x"))
            .await
            .is_err());
    }
}
