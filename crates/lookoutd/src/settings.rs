//! Settings the operator can flip while the daemon runs.

use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub notifications_enabled: bool,
    pub capture_unknown: bool,
}

/// Shared handle; the frame loop copies a snapshot once per frame.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<RuntimeSettings>>,
}

impl SettingsHandle {
    pub fn new(initial: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn snapshot(&self) -> RuntimeSettings {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_notifications(&self, enabled: bool) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).notifications_enabled = enabled;
        tracing::info!(enabled, "notifications toggled");
    }

    pub fn set_capture_unknown(&self, enabled: bool) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).capture_unknown = enabled;
        tracing::info!(enabled, "unknown capture toggled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_is_visible_to_clones() {
        let handle = SettingsHandle::new(RuntimeSettings {
            notifications_enabled: true,
            capture_unknown: true,
        });
        let reader = handle.clone();
        handle.set_notifications(false);
        handle.set_capture_unknown(false);
        assert_eq!(
            reader.snapshot(),
            RuntimeSettings {
                notifications_enabled: false,
                capture_unknown: false
            }
        );
    }
}
