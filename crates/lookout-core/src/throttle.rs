//! Per-name greeting cooldown.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const NAME_PLACEHOLDER: &str = "{name}";

/// Gates notifications for recognized identities.
///
/// A name is notified when it has never been notified, or when strictly more
/// than `cooldown` has passed since the last notification. Deciding true
/// records `now` in the same critical section.
#[derive(Debug)]
pub struct KnownThrottle {
    cooldown: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl KnownThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn should_notify(&self, name: &str, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let due = match last.get(name) {
            None => true,
            // A `now` earlier than the record counts as zero elapsed.
            Some(prev) => now
                .checked_duration_since(*prev)
                .is_some_and(|elapsed| elapsed > self.cooldown),
        };
        if due {
            last.insert(name.to_string(), now);
        }
        due
    }
}

/// Greeting text lookup: a per-name message, else the default template
/// with `{name}` substituted.
#[derive(Debug, Clone)]
pub struct Greetings {
    template: String,
    custom: HashMap<String, String>,
}

impl Greetings {
    pub fn new(template: impl Into<String>, custom: HashMap<String, String>) -> Self {
        Self {
            template: template.into(),
            custom,
        }
    }

    pub fn resolve(&self, name: &str) -> String {
        match self.custom.get(name) {
            Some(text) => text.clone(),
            None => self.template.replace(NAME_PLACEHOLDER, name),
        }
    }
}
