//! Nearest-neighbour classification with a rejection threshold.

use crate::types::{Identity, KnownEntry, Template};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("template has {actual} dimensions, gallery uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Immutable view of the known gallery used by the frame loop.
///
/// All entries share one template dimension. Entries are kept in load order,
/// which is the order ties are broken in.
#[derive(Debug, Default)]
pub struct GallerySnapshot {
    entries: Vec<KnownEntry>,
    dimension: Option<usize>,
}

impl GallerySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot, dropping entries whose dimension disagrees with the
    /// first entry.
    pub fn from_entries(entries: Vec<KnownEntry>) -> Self {
        let dimension = entries.first().map(|e| e.template.dimension());
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            let dim = entry.template.dimension();
            if Some(dim) != dimension {
                tracing::warn!(
                    name = %entry.name,
                    dimension = dim,
                    expected = ?dimension,
                    "template dimension mismatch; entry left out of gallery"
                );
                continue;
            }
            kept.push(entry);
        }
        Self {
            entries: kept,
            dimension,
        }
    }

    pub fn entries(&self) -> &[KnownEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

/// Holder for the current snapshot. Reload replaces it in a single swap;
/// readers keep whichever `Arc` they already took.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: RwLock<Arc<GallerySnapshot>>,
}

impl SnapshotCell {
    pub fn new(snapshot: GallerySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn current(&self) -> Arc<GallerySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, snapshot: GallerySnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }
}

/// Strategy for classifying a probe template against the gallery.
pub trait Matcher {
    fn classify(
        &self,
        probe: &Template,
        gallery: &GallerySnapshot,
        tolerance: f32,
    ) -> Result<Identity, MatchError>;
}

/// Euclidean nearest-neighbour matcher.
///
/// A gallery entry is a candidate when its distance is at most `tolerance`.
/// The answer is the candidate at the global minimum distance; when several
/// entries share that minimum, the first one in gallery order wins.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn classify(
        &self,
        probe: &Template,
        gallery: &GallerySnapshot,
        tolerance: f32,
    ) -> Result<Identity, MatchError> {
        let Some(expected) = gallery.dimension() else {
            return Ok(Identity::Unknown { nearest: None });
        };
        if probe.dimension() != expected {
            return Err(MatchError::DimensionMismatch {
                expected,
                actual: probe.dimension(),
            });
        }

        let mut best: Option<(usize, f32)> = None;
        for (i, entry) in gallery.entries().iter().enumerate() {
            let d = probe.euclidean_distance(&entry.template);
            // Strict comparison keeps the earliest entry on ties.
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        Ok(match best {
            Some((idx, distance)) if distance <= tolerance => Identity::Known {
                name: gallery.entries()[idx].name.clone(),
                distance,
            },
            other => Identity::Unknown {
                nearest: other.map(|(_, d)| d),
            },
        })
    }
}
