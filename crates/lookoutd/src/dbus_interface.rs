use crate::context::AppContext;
use lookout_core::{EnrollError, GalleryError};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.lookout.Lookout1";
pub const OBJECT_PATH: &str = "/org/lookout/Lookout1";

/// D-Bus interface for the Lookout daemon.
///
/// Bus name: org.lookout.Lookout1
/// Object path: /org/lookout/Lookout1
///
/// Results are JSON strings. Storage and analysis work runs on the blocking
/// pool so the bus executor never waits on disk or inference.
pub struct LookoutService {
    ctx: Arc<AppContext>,
    runtime: tokio::runtime::Handle,
    camera: String,
    sink: String,
}

impl LookoutService {
    pub fn new(
        ctx: Arc<AppContext>,
        runtime: tokio::runtime::Handle,
        camera: String,
        sink: String,
    ) -> Self {
        Self {
            ctx,
            runtime,
            camera,
            sink,
        }
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&AppContext) -> Result<T, EnrollError> + Send + 'static,
    {
        let ctx = self.ctx.clone();
        self.runtime
            .spawn_blocking(move || f(&ctx))
            .await
            .map_err(|e| fdo::Error::Failed(format!("{op}: worker failed: {e}")))?
            .map_err(|e| to_fdo(op, e))
    }
}

fn to_fdo(op: &str, err: EnrollError) -> fdo::Error {
    let msg = err.to_string();
    match &err {
        EnrollError::EmptyName(_)
        | EnrollError::Gallery(
            GalleryError::InvalidImage(_)
            | GalleryError::DuplicateName(_)
            | GalleryError::InvalidName(_)
            | GalleryError::AlreadyPromoted { .. },
        ) => {
            tracing::info!(op, error = %msg, "request rejected");
            fdo::Error::InvalidArgs(msg)
        }
        EnrollError::Gallery(GalleryError::NotFound(_)) => {
            tracing::info!(op, error = %msg, "request rejected");
            fdo::Error::FileNotFound(msg)
        }
        _ => {
            tracing::error!(op, error = %msg, "request failed");
            fdo::Error::Failed(msg)
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

#[interface(name = "org.lookout.Lookout1")]
impl LookoutService {
    /// Enroll the face in `image_path` under `name`.
    async fn add_face(&self, name: &str, image_path: &str) -> fdo::Result<String> {
        tracing::info!(name, image_path, "add_face requested");
        let name = name.to_string();
        let path = PathBuf::from(image_path);
        let entry = self
            .blocking("add_face", move |ctx| ctx.enrollment.add(&name, &path))
            .await?;
        Ok(serde_json::json!({
            "name": entry.name,
            "created_at": entry.created_at,
        })
        .to_string())
    }

    async fn remove_face(&self, name: &str) -> fdo::Result<bool> {
        tracing::info!(name, "remove_face requested");
        let name = name.to_string();
        self.blocking("remove_face", move |ctx| ctx.enrollment.remove(&name))
            .await?;
        Ok(true)
    }

    async fn list_known(&self) -> fdo::Result<String> {
        let known = self
            .blocking("list_known", |ctx| ctx.enrollment.list_known())
            .await?;
        to_json(&known)
    }

    async fn list_pending(&self) -> fdo::Result<String> {
        let pending = self
            .blocking("list_pending", |ctx| ctx.enrollment.list_pending())
            .await?;
        to_json(&pending)
    }

    /// Turn a pending capture into a known face named `name`.
    async fn promote(&self, capture_id: &str, name: &str) -> fdo::Result<String> {
        tracing::info!(capture_id, name, "promote requested");
        let capture_id = capture_id.to_string();
        let name = name.to_string();
        let entry = self
            .blocking("promote", move |ctx| ctx.enrollment.promote(&capture_id, &name))
            .await?;
        Ok(serde_json::json!({
            "name": entry.name,
            "created_at": entry.created_at,
        })
        .to_string())
    }

    /// Delete unpromoted captures older than `days`; returns how many went.
    async fn clean(&self, days: u32) -> fdo::Result<u32> {
        tracing::info!(days, "clean requested");
        let removed = self
            .blocking("clean", move |ctx| ctx.enrollment.clean(days))
            .await?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    async fn backup(&self) -> fdo::Result<String> {
        tracing::info!("backup requested");
        let manifest = self.blocking("backup", |ctx| ctx.enrollment.backup()).await?;
        to_json(&manifest)
    }

    /// Re-read known faces and swap the matcher's gallery; returns the count.
    async fn reload(&self) -> fdo::Result<u32> {
        tracing::info!("reload requested");
        let count = self
            .blocking("reload", |ctx| Ok(ctx.reload_gallery()?))
            .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn set_notifications(&self, enabled: bool) -> fdo::Result<bool> {
        self.ctx.settings.set_notifications(enabled);
        Ok(enabled)
    }

    async fn set_capture_unknown(&self, enabled: bool) -> fdo::Result<bool> {
        self.ctx.settings.set_capture_unknown(enabled);
        Ok(enabled)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let (known, pending) = self
            .blocking("status", |ctx| {
                Ok((
                    ctx.store.list_known()?.len(),
                    ctx.store.list_pending()?.len(),
                ))
            })
            .await?;
        let settings = self.ctx.settings.snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera,
            "camera_kind": self.ctx.config.camera.kind,
            "gallery_loaded": self.ctx.gallery.current().len(),
            "known": known,
            "pending": pending,
            "notifications_enabled": settings.notifications_enabled,
            "capture_unknown": settings.capture_unknown,
            "frames_processed": self.ctx.frames.load(Ordering::Relaxed),
            "sink": self.sink,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{portrait, test_context};
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> LookoutService {
        LookoutService::new(
            Arc::new(test_context(dir)),
            tokio::runtime::Handle::current(),
            "replay:test".into(),
            "log".into(),
        )
    }

    fn image(dir: &TempDir, file: &str, red: u8) -> String {
        let path = dir.path().join(file);
        portrait(red).save(&path).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let path = image(&dir, "dana.png", 120);

        let added: serde_json::Value =
            serde_json::from_str(&svc.add_face("Dana", &path).await.unwrap()).unwrap();
        assert_eq!(added["name"], "Dana");

        let known: serde_json::Value =
            serde_json::from_str(&svc.list_known().await.unwrap()).unwrap();
        assert_eq!(known.as_array().unwrap().len(), 1);
        assert_eq!(known[0]["name"], "Dana");

        assert!(svc.remove_face("Dana").await.unwrap());
        assert_eq!(svc.list_known().await.unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let path = image(&dir, "eve.png", 90);
        svc.add_face("Eve", &path).await.unwrap();

        assert!(matches!(
            svc.add_face("Eve", &path).await,
            Err(fdo::Error::InvalidArgs(_))
        ));
        assert!(matches!(
            svc.add_face("!!!", &path).await,
            Err(fdo::Error::InvalidArgs(_))
        ));
        assert!(matches!(
            svc.remove_face("Mallory").await,
            Err(fdo::Error::FileNotFound(_))
        ));
        assert!(matches!(
            svc.promote("20240101_000000_deadbeef", "Zed").await,
            Err(fdo::Error::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_and_status() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let path = image(&dir, "finn.png", 200);
        svc.add_face("Finn", &path).await.unwrap();

        assert_eq!(svc.reload().await.unwrap(), 1);
        svc.set_notifications(false).await.unwrap();

        let status: serde_json::Value = serde_json::from_str(&svc.status().await.unwrap()).unwrap();
        assert_eq!(status["known"], 1);
        assert_eq!(status["pending"], 0);
        assert_eq!(status["gallery_loaded"], 1);
        assert_eq!(status["notifications_enabled"], false);
        assert_eq!(status["camera"], "replay:test");
        assert_eq!(status["sink"], "log");
    }

    #[tokio::test]
    async fn test_clean_and_backup() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let path = image(&dir, "gus.png", 60);
        svc.add_face("Gus", &path).await.unwrap();

        assert_eq!(svc.clean(30).await.unwrap(), 0);
        let manifest: serde_json::Value =
            serde_json::from_str(&svc.backup().await.unwrap()).unwrap();
        assert_eq!(manifest["known"], 1);
        assert_eq!(manifest["pending"], 0);
    }
}
