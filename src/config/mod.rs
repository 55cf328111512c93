//! The `config` module loads broker settings and publishes updates to them.
//!
//! Settings come from an optional `config/default` file and from environment
//! variables prefixed with `BROKER`, using `__` to separate nested keys
//! (`BROKER__DESTINATIONS__QUEUE_PREFETCH=50`). Missing values fall back to
//! `Settings::default()`.

mod settings;

use std::fmt;
use std::sync::Arc;

use config::{Config, Environment, File};
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::utils::Result;

pub use settings::{
    BrokerSettings, ConsumerSettings, DestinationSettings, LimitBehavior, LoggingSettings,
    PartialSettings, PersistenceSettings, Settings, TimerSettings,
};

/// Loads the configuration from the default file and environment variables,
/// merges it with default values and validates the result.
pub fn load_config() -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("BROKER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = partial.merge(Settings::default());
    settings.validate()?;
    Ok(settings)
}

/// Called with `(old, new)` after every accepted settings update.
pub type ConfigListener = Box<dyn Fn(&Settings, &Settings) + Send + Sync>;

/// Holds the current settings and notifies listeners synchronously when they
/// change. Listeners must not register further listeners from the callback.
pub struct ConfigWatcher {
    current: RwLock<Arc<Settings>>,
    listeners: Mutex<Vec<ConfigListener>>,
}

impl ConfigWatcher {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(settings)),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn current(&self) -> Arc<Settings> {
        Arc::clone(&self.current.read())
    }

    pub fn subscribe(&self, listener: ConfigListener) {
        self.listeners.lock().push(listener);
    }

    /// Validate and install `settings`, then run every listener.
    pub fn update(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let new = Arc::new(settings);
        let old = std::mem::replace(&mut *self.current.write(), Arc::clone(&new));
        if *old == *new {
            return Ok(());
        }
        info!("broker settings updated");
        for listener in self.listeners.lock().iter() {
            listener(&old, &new);
        }
        Ok(())
    }
}

impl fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("current", &self.current.read())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
