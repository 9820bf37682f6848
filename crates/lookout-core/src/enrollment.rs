//! Operator-facing gallery management.
//!
//! Names are sanitized here before they reach the store. Image validation
//! is shared between `add` and `promote` inside [`GalleryStore`].

use crate::analysis::SharedAnalyzer;
use crate::gallery::{BackupManifest, GalleryError, GalleryStore};
use crate::types::{KnownEntry, KnownRecord, PendingEntry};
use std::path::Path;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use thiserror::Error;

const SECS_PER_DAY: u64 = 86_400;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("name {0:?} is empty after sanitizing")]
    EmptyName(String),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

/// Keep letters, digits, space, `-` and `_`; collapse whitespace runs and trim.
pub fn sanitize_name(raw: &str) -> Option<String> {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let name = kept.split_whitespace().collect::<Vec<_>>().join(" ");
    (!name.is_empty()).then_some(name)
}

fn required_name(raw: &str) -> Result<String, EnrollError> {
    sanitize_name(raw).ok_or_else(|| EnrollError::EmptyName(raw.to_string()))
}

pub struct EnrollmentManager {
    store: Arc<GalleryStore>,
    analyzer: SharedAnalyzer,
}

impl EnrollmentManager {
    pub fn new(store: Arc<GalleryStore>, analyzer: SharedAnalyzer) -> Self {
        Self { store, analyzer }
    }

    pub fn add(&self, name: &str, image: &Path) -> Result<KnownEntry, EnrollError> {
        let name = required_name(name)?;
        let mut analyzer = self.analyzer.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.store.add(&mut **analyzer, &name, image)?)
    }

    pub fn remove(&self, name: &str) -> Result<(), EnrollError> {
        let name = required_name(name)?;
        self.store.remove(&name)?;
        Ok(())
    }

    pub fn list_known(&self) -> Result<Vec<KnownRecord>, EnrollError> {
        Ok(self.store.list_known()?)
    }

    pub fn list_pending(&self) -> Result<Vec<PendingEntry>, EnrollError> {
        Ok(self.store.list_pending()?)
    }

    pub fn promote(&self, capture_id: &str, new_name: &str) -> Result<KnownEntry, EnrollError> {
        let name = required_name(new_name)?;
        let mut analyzer = self.analyzer.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.store.promote(&mut **analyzer, capture_id, &name)?)
    }

    /// Retire unpromoted captures older than `days` days.
    pub fn clean(&self, days: u32) -> Result<usize, EnrollError> {
        self.clean_older_than(Duration::from_secs(u64::from(days) * SECS_PER_DAY))
    }

    pub fn clean_older_than(&self, age: Duration) -> Result<usize, EnrollError> {
        Ok(self.store.clean(age)?)
    }

    pub fn backup(&self) -> Result<BackupManifest, EnrollError> {
        Ok(self.store.backup()?)
    }
}
