//! capy-notify - D-Bus signal monitor
//!
//! Subscribes the configured watch rules on a notification center and logs
//! every notification until Ctrl-C.

mod event_bus;

use capy_signals::dbus::{self, DBUS_INTERFACE};
use capy_signals::{CenterConfig, ObserverId, RuleSpec};
use log::{error, info, warn};
use std::error::Error;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match CenterConfig::default_path() {
        Some(path) => CenterConfig::load(&path)?,
        None => {
            warn!("No config location, using defaults");
            CenterConfig::default()
        }
    };

    let (center, _bus) = dbus::connect(config.bus).await?;
    for signal in dbus::daemon_signals() {
        center.record_signal(signal);
    }
    let applied = config.apply(&center);
    info!("Registered {} notification name(s)", applied);

    let mut specs: Vec<RuleSpec> = config.watch.iter().map(|w| w.to_spec()).collect();
    if specs.is_empty() {
        specs.push(RuleSpec::signal(Some("NameOwnerChanged"), Some(DBUS_INTERFACE)));
    }

    // Subscribe before adding observers so nothing is missed
    let mut rx = event_bus::subscribe();
    let observer = ObserverId::next();
    for spec in &specs {
        if let Err(e) = center
            .add(observer, spec, |n| event_bus::send(n.clone()))
            .await
        {
            error!("Failed to watch {:?}: {}", spec.selector, e);
        }
    }
    info!("Watching {} rule(s), Ctrl-C to stop", specs.len());

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(notification) => {
                    let payload = serde_json::to_string(&notification.user_info)
                        .unwrap_or_else(|e| format!("<unserializable: {}>", e));
                    info!("{} from {}: {}", notification.name, notification.object, payload);
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} notification(s)", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    center.remove_observer(observer);
    Ok(())
}
