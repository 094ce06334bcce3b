//! Enrollment photos on disk: saving captured samples and importing a
//! folder of existing pictures of one person.

use crate::db::{Database, DbError};
use crate::pipeline::FramePipeline;
use chrono::{DateTime, Utc};
use rollcall_core::quality::{capture_quality, largest_face};
use rollcall_core::IdentityId;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("cannot read {}: {source}", path.display())]
    ReadDir { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Outcome of a folder import.
#[derive(Debug, Default)]
pub struct ImportReport {
    /// `(encoding id, photo)` for every stored face.
    pub imported: Vec<(i64, PathBuf)>,
    /// `(photo, reason)` for every picture that produced nothing.
    pub skipped: Vec<(PathBuf, String)>,
}

impl ImportReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "imported": self
                .imported
                .iter()
                .map(|(id, path)| serde_json::json!({ "encoding_id": id, "photo": path.display().to_string() }))
                .collect::<Vec<_>>(),
            "skipped": self
                .skipped
                .iter()
                .map(|(path, reason)| serde_json::json!({ "photo": path.display().to_string(), "reason": reason }))
                .collect::<Vec<_>>(),
        })
    }
}

/// Write a captured enrollment JPEG under `dir` without overwriting an
/// earlier one taken in the same millisecond.
pub fn save_photo(dir: &Path, identity_id: IdentityId, taken_at: DateTime<Utc>, jpeg: &[u8]) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stem = format!("{identity_id}_{}", taken_at.format("%Y%m%d_%H%M%S_%3f"));
    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => format!("{stem}.jpg"),
            n => format!("{stem}_{n}.jpg"),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(jpeg)?;
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Image files directly inside `dir`, sorted by name.
pub fn photo_paths(dir: &Path) -> Result<Vec<PathBuf>, ImportError> {
    let read_err = |source: io::Error| ImportError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        let is_photo = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| PHOTO_EXTENSIONS.iter().any(|p| ext.eq_ignore_ascii_case(p)));
        if is_photo && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Store the largest face of every photo in `dir` for `identity_id`.
///
/// Pictures that cannot be decoded, contain no face or do not fit the
/// enrolled embedding dimension are skipped and reported.
pub fn import_folder(
    pipeline: &mut FramePipeline,
    db: &Database,
    identity_id: IdentityId,
    dir: &Path,
) -> Result<ImportReport, ImportError> {
    if db.identity_name(identity_id)?.is_none() {
        return Err(DbError::UnknownIdentity(identity_id).into());
    }

    let mut report = ImportReport::default();
    for path in photo_paths(dir)? {
        let image = match image::open(&path) {
            Ok(image) => image.to_rgb8(),
            Err(e) => {
                report.skipped.push((path, format!("unreadable image: {e}")));
                continue;
            }
        };
        let detections = match pipeline.analyze_image(&image) {
            Ok(detections) => detections,
            Err(e) => {
                report.skipped.push((path, format!("face analysis failed: {e}")));
                continue;
            }
        };
        let Some(face) = largest_face(&detections) else {
            report.skipped.push((path, "no face detected".into()));
            continue;
        };

        let quality = capture_quality(&face.bbox, image.width(), image.height());
        let photo = path.to_string_lossy().into_owned();
        match db.add_face_encoding(identity_id, &face.embedding, quality, Some(photo.as_str())) {
            Ok(encoding_id) => {
                tracing::debug!(encoding_id, quality, photo = %photo, "photo imported");
                report.imported.push((encoding_id, path));
            }
            Err(e @ DbError::DimensionMismatch { .. }) => report.skipped.push((path, e.to_string())),
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(
        identity_id,
        imported = report.imported.len(),
        skipped = report.skipped.len(),
        dir = %dir.display(),
        "photo folder imported"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face, manual_clock, ScriptedAnalyzer, ScriptedSource};
    use image::{Rgb, RgbImage};
    use rollcall_core::EmbeddingRepository;
    use std::sync::Arc;

    fn write_png(dir: &Path, name: &str) {
        RgbImage::from_pixel(32, 32, Rgb([120, 110, 100]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_photo_paths_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "b.png");
        std::fs::write(dir.path().join("A.JPG"), b"upper-case extension").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a photo").unwrap();
        std::fs::create_dir(dir.path().join("nested.jpg")).unwrap();

        let names: Vec<_> = photo_paths(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["A.JPG", "b.png"]);
    }

    #[test]
    fn test_missing_folder_is_error() {
        let result = photo_paths(Path::new("/nonexistent/rollcall/photos"));
        assert!(matches!(result, Err(ImportError::ReadDir { .. })));
    }

    #[test]
    fn test_import_stores_faces_and_reports_skips() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png");
        write_png(dir.path(), "b.png");
        std::fs::write(dir.path().join("broken.jpg"), b"not really a jpeg").unwrap();

        let source = ScriptedSource::healthy();
        let camera = source.monitor();
        // a.png has a face, b.png has none; broken.jpg never reaches the analyzer
        let analyzer = ScriptedAnalyzer::sequence(vec![vec![face(4.0)], vec![]]);
        let calls = analyzer.calls();
        let mut pipeline = FramePipeline::new(Box::new(source), Box::new(analyzer), 1);

        let db = Database::open_in_memory(manual_clock()).unwrap();
        let alice = db.add_identity("alice").unwrap();
        let report = import_folder(&mut pipeline, &db, alice, dir.path()).unwrap();

        assert_eq!(report.imported.len(), 1);
        assert!(report.imported[0].1.ends_with("a.png"));
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.iter().any(|(p, r)| p.ends_with("b.png") && r == "no face detected"));
        assert!(report.skipped.iter().any(|(p, r)| p.ends_with("broken.jpg") && r.starts_with("unreadable")));
        assert_eq!(calls.get(), 2);
        assert!(!camera.is_started());

        let known = db.list_active_encodings().unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].embedding.values, vec![4.0; 4]);
        assert_eq!(report.to_json()["imported"][0]["encoding_id"], report.imported[0].0);
    }

    #[test]
    fn test_import_for_unknown_identity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = FramePipeline::new(
            Box::new(ScriptedSource::healthy()),
            Box::new(ScriptedAnalyzer::empty()),
            1,
        );
        let db = Database::open_in_memory(Arc::new(rollcall_core::SystemClock)).unwrap();
        let result = import_folder(&mut pipeline, &db, 77, dir.path());
        assert!(matches!(result, Err(ImportError::Db(DbError::UnknownIdentity(77)))));
    }

    #[test]
    fn test_same_millisecond_photos_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let taken_at = Utc::now();
        let first = save_photo(dir.path(), 3, taken_at, b"first").unwrap();
        let second = save_photo(dir.path(), 3, taken_at, b"second").unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
        assert_eq!(std::fs::read(&second).unwrap(), b"second");
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("3_"));
    }
}
