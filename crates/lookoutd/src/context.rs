//! Everything the daemon shares between the frame loop and D-Bus handlers,
//! built once at startup.

use crate::config::Config;
use crate::settings::{RuntimeSettings, SettingsHandle};
use anyhow::{Context as _, Result};
use lookout_core::analysis::SharedAnalyzer;
use lookout_core::{
    EnrollmentManager, GalleryError, GallerySnapshot, GalleryStore, QualityPolicy,
    SnapshotCell, TemplateCodec, TemplateKey,
};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, PoisonError};

pub struct AppContext {
    pub config: Config,
    pub store: Arc<GalleryStore>,
    pub gallery: Arc<SnapshotCell>,
    pub analyzer: SharedAnalyzer,
    pub enrollment: EnrollmentManager,
    pub settings: SettingsHandle,
    /// Frames handled by the engine since startup.
    pub frames: Arc<AtomicU64>,
}

impl AppContext {
    /// Open storage, set up the template codec and load the gallery.
    pub fn build(config: Config, analyzer: SharedAnalyzer) -> Result<Self> {
        let layout = config.layout();
        let codec = if config.security.encrypt_templates {
            let (key, origin) = TemplateKey::load_or_create(&layout.key_path())
                .context("failed to load template key")?;
            tracing::info!(key_id = %key.id(), ?origin, "template encryption enabled");
            TemplateCodec::sealed(key)
        } else {
            tracing::warn!("template encryption disabled; pending templates are stored in plaintext");
            TemplateCodec::plaintext()
        };

        let store = Arc::new(
            GalleryStore::open(
                layout,
                codec,
                QualityPolicy {
                    blur_threshold: config.recognition.blur_threshold,
                },
            )
            .context("failed to open gallery storage")?,
        );

        let audit = store.audit_templates().context("failed to scan pending captures")?;
        if audit.unreadable > 0 {
            tracing::warn!(
                unreadable = audit.unreadable,
                readable = audit.readable,
                "some pending templates cannot be decoded with the current key"
            );
        }

        let entries = {
            let mut guard = analyzer.lock().unwrap_or_else(PoisonError::into_inner);
            store.load(&mut **guard).context("failed to load known faces")?
        };
        let gallery = Arc::new(SnapshotCell::new(GallerySnapshot::from_entries(entries)));

        let settings = SettingsHandle::new(RuntimeSettings {
            notifications_enabled: config.greeting.enabled,
            capture_unknown: config.recognition.capture_unknown,
        });

        Ok(Self {
            enrollment: EnrollmentManager::new(store.clone(), analyzer.clone()),
            config,
            store,
            gallery,
            analyzer,
            settings,
            frames: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Re-encode known storage and swap in the new snapshot.
    pub fn reload_gallery(&self) -> Result<usize, GalleryError> {
        let entries = {
            let mut guard = self.analyzer.lock().unwrap_or_else(PoisonError::into_inner);
            self.store.load(&mut **guard)?
        };
        let snapshot = GallerySnapshot::from_entries(entries);
        let count = snapshot.len();
        self.gallery.replace(snapshot);
        tracing::info!(count, "gallery reloaded");
        Ok(count)
    }
}
