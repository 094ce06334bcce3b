use crate::db::{Database, IdentityStatus};
use crate::photos;
use crate::service::RollcallService;
use crate::session::SessionKind;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.Rollcall1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Rollcall1";

/// D-Bus control surface for the rollcall daemon.
///
/// Bus name: org.freedesktop.Rollcall1
/// Object path: /org/freedesktop/Rollcall1
pub struct RollcallBus {
    pub service: Arc<RollcallService>,
    pub db: Arc<Database>,
    pub photo_dir: PathBuf,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, zbus::fdo::Error> + Send + 'static,
) -> zbus::fdo::Result<T> {
    tokio::task::spawn_blocking(f).await.map_err(failed)?
}

#[interface(name = "org.freedesktop.Rollcall1")]
impl RollcallBus {
    /// Re-read enrolled embeddings from the database. Returns how many are loaded.
    async fn reload_embeddings(&self) -> zbus::fdo::Result<u32> {
        let service = Arc::clone(&self.service);
        let count = blocking(move || service.reload_embeddings().map_err(failed)).await?;
        tracing::info!(count, "embeddings reloaded over D-Bus");
        Ok(count as u32)
    }

    /// Attendance session for recognition streams started after this call.
    async fn set_attendance_session(&self, session_id: i64) -> zbus::fdo::Result<()> {
        let db = Arc::clone(&self.db);
        let exists = blocking(move || db.session_exists(session_id).map_err(failed)).await?;
        if !exists {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "no attendance session {session_id}"
            )));
        }
        self.service.set_attendance_session(Some(session_id));
        Ok(())
    }

    async fn clear_attendance_session(&self) {
        self.service.set_attendance_session(None);
    }

    /// Create an attendance session and return its id.
    async fn create_attendance_session(&self, name: &str) -> zbus::fdo::Result<i64> {
        let db = Arc::clone(&self.db);
        let name = name.to_string();
        blocking(move || db.create_session(&name).map_err(failed)).await
    }

    /// Attendance recorded in a session, as a JSON array.
    async fn attendance_records(&self, session_id: i64) -> zbus::fdo::Result<String> {
        let db = Arc::clone(&self.db);
        let records = blocking(move || db.attendance_for_session(session_id).map_err(failed)).await?;
        serde_json::to_string(&records).map_err(failed)
    }

    /// Register a person to enroll faces for. Returns the identity id.
    async fn add_identity(&self, display_name: &str) -> zbus::fdo::Result<i64> {
        if display_name.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("display name is empty".into()));
        }
        let db = Arc::clone(&self.db);
        let name = display_name.trim().to_string();
        blocking(move || db.add_identity(&name).map_err(failed)).await
    }

    /// Include or exclude an identity from recognition, then reload embeddings.
    async fn set_identity_active(&self, identity_id: i64, active: bool) -> zbus::fdo::Result<()> {
        let db = Arc::clone(&self.db);
        let service = Arc::clone(&self.service);
        let status = if active {
            IdentityStatus::Active
        } else {
            IdentityStatus::Inactive
        };
        blocking(move || {
            db.set_identity_status(identity_id, status).map_err(failed)?;
            service.reload_embeddings().map_err(failed)?;
            Ok(())
        })
        .await
    }

    /// Returns whether a recognition stream was running.
    async fn stop_recognition(&self) -> bool {
        self.service.stop(SessionKind::Recognition)
    }

    /// Returns whether a preview stream was running.
    async fn stop_preview(&self) -> bool {
        self.service.stop(SessionKind::EnrollmentPreview)
    }

    /// Capture one enrollment sample for an existing identity, store it and
    /// reload embeddings. Returns JSON with the encoding id and quality.
    async fn enroll(&self, identity_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, "enroll requested");
        let db = Arc::clone(&self.db);
        let known = blocking(move || db.identity_name(identity_id).map_err(failed)).await?;
        if known.is_none() {
            return Err(zbus::fdo::Error::InvalidArgs(format!("no identity {identity_id}")));
        }

        let capture = Arc::clone(&self.service)
            .capture_enrollment()
            .await
            .map_err(failed)?;
        let quality = capture.quality;

        let db = Arc::clone(&self.db);
        let service = Arc::clone(&self.service);
        let photo_dir = self.photo_dir.clone();
        let (encoding_id, photo) = blocking(move || {
            let photo = photos::save_photo(&photo_dir, identity_id, chrono::Utc::now(), &capture.jpeg).map_err(failed)?;
            let photo_path = photo.to_string_lossy().into_owned();
            let encoding_id = db
                .add_face_encoding(identity_id, &capture.embedding, capture.quality, Some(photo_path.as_str()))
                .map_err(failed)?;
            service.reload_embeddings().map_err(failed)?;
            Ok((encoding_id, photo))
        })
        .await?;

        tracing::info!(identity_id, encoding_id, quality, "enrollment stored");
        Ok(serde_json::json!({
            "encoding_id": encoding_id,
            "quality": quality,
            "photo": photo.display().to_string(),
        })
        .to_string())
    }

    /// Enroll every face found in a folder of photos of one identity,
    /// then reload embeddings. `dir` must be absolute. Returns JSON with
    /// the stored encodings and the skipped files.
    async fn import_photos(&self, identity_id: i64, dir: &str) -> zbus::fdo::Result<String> {
        let dir = PathBuf::from(dir);
        if !dir.is_absolute() {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "photo folder must be an absolute path: {}",
                dir.display()
            )));
        }
        tracing::info!(identity_id, dir = %dir.display(), "photo import requested");

        let db = Arc::clone(&self.db);
        let service = Arc::clone(&self.service);
        let report = blocking(move || {
            let report = service
                .with_pipeline(|pipeline| photos::import_folder(pipeline, &db, identity_id, &dir))
                .map_err(failed)?
                .map_err(failed)?;
            service.reload_embeddings().map_err(failed)?;
            Ok(report)
        })
        .await?;

        Ok(report.to_json().to_string())
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.service.status().to_string())
    }
}
