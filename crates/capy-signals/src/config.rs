//! JSON configuration for a notification center

use crate::center::NotificationCenter;
use crate::error::ConfigError;
use crate::rule::RuleSpec;
use crate::types::Proxy;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config location.
pub const CONFIG_ENV: &str = "CAPY_NOTIFY_CONFIG";

/// Which message bus a center is bound to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

/// Notification name registered at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameMapping {
    pub name: String,
    pub signal: String,
    pub interface: String,
}

/// A rule the monitor subscribes to. Either `name` or the structural
/// fields select the signal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchRule {
    pub name: Option<String>,
    pub signal: Option<String>,
    pub interface: Option<String>,
    pub sender: Option<Proxy>,
    pub destination: Option<Proxy>,
    /// String filters keyed by argument index
    pub filters: BTreeMap<usize, String>,
}

impl WatchRule {
    pub fn to_spec(&self) -> RuleSpec {
        let spec = match &self.name {
            Some(name) => RuleSpec::name(name.clone()),
            None => RuleSpec::signal(self.signal.as_deref(), self.interface.as_deref()),
        };
        spec.sender(self.sender.as_ref())
            .destination(self.destination.as_ref())
            .filters(self.filters.iter().map(|(i, v)| (*i, v.as_str())))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CenterConfig {
    pub bus: BusKind,
    pub notification_names: Vec<NameMapping>,
    pub watch: Vec<WatchRule>,
}

impl CenterConfig {
    /// `$CAPY_NOTIFY_CONFIG`, else `~/.config/capy-notify/config.json`
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("capy-notify")
                .join("config.json")
        })
    }

    /// Load from config file. A missing file yields the default config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Register the configured notification names on `center`.
    /// Returns how many were accepted; conflicting ones are skipped.
    pub fn apply(&self, center: &NotificationCenter) -> usize {
        let mut applied = 0;
        for mapping in &self.notification_names {
            let registered = center.register_notification_name(
                &mapping.name,
                &mapping.signal,
                &mapping.interface,
            );
            match registered {
                Ok(()) => applied += 1,
                Err(e) => warn!("Skipping configured name '{}': {}", mapping.name, e),
            }
        }
        applied
    }
}
