//! Gateway-specific settings.

use eyre::{Result, WrapErr};

use smsgate_base::{LoadableFromSettings, Settings};

/// Settings for the gateway agent. Currently the shared base carries
/// everything; this wrapper keeps the agent on the standard loading path.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    base: Settings,
}

impl AsRef<Settings> for GatewaySettings {
    fn as_ref(&self) -> &Settings {
        &self.base
    }
}

impl LoadableFromSettings for GatewaySettings {
    fn load() -> Result<Self> {
        let base = Settings::load().wrap_err("loading gateway settings")?;
        Ok(Self { base })
    }
}
