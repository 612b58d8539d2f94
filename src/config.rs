//! Runtime settings for the broker.
//!
//! The CLI front-end fills a [`Config`] from parsed arguments; environment
//! variables override individual fields on top of that, which is how the
//! broker is configured when supervised (systemd unit files, container
//! entrypoints). Validation happens last, on the merged result.

use anyhow::{bail, Result};

/// Validated broker settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port accepting supply-side peers. Required, nonzero.
    pub supply_port: u16,
    /// TCP port accepting demand-side peers. Required, nonzero.
    pub demand_port: u16,
    /// TCP port publishing unmet-demand counts to drivers. 0 disables.
    pub driver_port: u16,
    /// Disconnect descriptors idle for this many seconds. 0 disables.
    pub idle_timeout: u32,
    /// Publish the unmet-demand total every this many seconds when nothing
    /// else triggers a publication. 0 disables the periodic path only.
    pub driver_period: u32,
    /// Log per-message byte counts and idle expirations.
    pub verbose: bool,
    /// When set, the engine binds nothing and returns success immediately.
    /// Front-ends that have already satisfied the request (help, version)
    /// set this instead of skipping the engine call.
    pub exit_flag: bool,
}

impl Config {
    /// Override individual fields from `SPLICER_*` environment variables.
    ///
    /// Unparsable values are ignored with a warning rather than failing the
    /// whole startup.
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parse("SPLICER_SUPPLY_PORT") {
            self.supply_port = port;
        }
        if let Some(port) = env_parse("SPLICER_DEMAND_PORT") {
            self.demand_port = port;
        }
        if let Some(port) = env_parse("SPLICER_DRIVER_PORT") {
            self.driver_port = port;
        }
        if let Some(secs) = env_parse("SPLICER_IDLE_TIMEOUT") {
            self.idle_timeout = secs;
        }
        if let Some(secs) = env_parse("SPLICER_DRIVER_PERIOD") {
            self.driver_period = secs;
        }
    }

    /// Check the merged settings.
    ///
    /// # Errors
    ///
    /// Returns an error when a required port is zero or two roles share a
    /// port.
    pub fn validate(&self) -> Result<()> {
        if self.supply_port == 0 {
            bail!("the supply port must be nonzero");
        }
        if self.demand_port == 0 {
            bail!("the demand port must be nonzero");
        }
        if self.supply_port == self.demand_port {
            bail!("the supply and demand ports must differ");
        }
        if self.driver_port != 0
            && (self.driver_port == self.supply_port || self.driver_port == self.demand_port)
        {
            bail!("the driver port must differ from the supply and demand ports");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparsable {name}={raw}");
            None
        }
    }
}
