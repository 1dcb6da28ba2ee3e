//! Signal catalog: introspected signal metadata indexed by (interface, member).

use crate::types::{SignalKey, SignalMetadata};
use log::{debug, warn};
use std::collections::HashMap;

/// Append-only store of known signals.
#[derive(Debug, Default)]
pub struct SignalCatalog {
    signals: HashMap<SignalKey, SignalMetadata>,
    /// Notification-name annotations, pointing at the annotated signal.
    by_annotation: HashMap<String, SignalKey>,
}

impl SignalCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovered signal. Returns false if the signal was already
    /// known; the first record wins.
    pub fn record(&mut self, metadata: SignalMetadata) -> bool {
        let key = metadata.key();
        if self.signals.contains_key(&key) {
            debug!("Signal {} already catalogued", key);
            return false;
        }

        if let Some(name) = &metadata.notification_name {
            match self.by_annotation.get(name) {
                Some(existing) if existing != &key => {
                    warn!(
                        "Notification annotation '{}' on {} ignored, already used by {}",
                        name, key, existing
                    );
                }
                _ => {
                    self.by_annotation.insert(name.clone(), key.clone());
                }
            }
        }

        debug!("Catalogued signal {} ({} args)", key, metadata.args.len());
        self.signals.insert(key, metadata);
        true
    }

    pub fn get(&self, interface: &str, member: &str) -> Option<&SignalMetadata> {
        self.signals.get(&SignalKey::new(interface, member))
    }

    pub fn contains(&self, interface: &str, member: &str) -> bool {
        self.get(interface, member).is_some()
    }

    /// Signal carrying a notification-name annotation equal to `name`.
    pub fn by_notification_name(&self, name: &str) -> Option<&SignalMetadata> {
        self.by_annotation
            .get(name)
            .and_then(|key| self.signals.get(key))
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}
