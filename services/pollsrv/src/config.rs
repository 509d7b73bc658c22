//! Service configuration
//!
//! A YAML file merged with `POLLSRV_` environment overrides (nested keys split
//! on `__`, e.g. `POLLSRV_ENGINE__MAX_RETRIES=5`).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fieldlink_core::{CommLink, Controller, DeviceKind, EngineSettings, LinkOptions, ProtocolKind};

use crate::error::{PollSrvError, Result};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "POLLSRV_";

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/pollsrv.yaml";

/// Service identity and logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub name: String,
    /// Directory for rolling log files
    pub log_dir: Option<String>,
    pub log_to_file: bool,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "pollsrv".to_string(),
            log_dir: None,
            log_to_file: false,
        }
    }
}

/// Engine timing shared by all links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub read_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub sample_interval_secs: u64,
    /// Event-listen exchanges per sensor per interval (0 = no listening)
    pub listen_cycles: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 750,
            max_retries: 3,
            retry_backoff_ms: 100,
            sample_interval_secs: 30,
            listen_cycles: 0,
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

/// One comm link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    pub uri: String,
    pub protocol: ProtocolKind,
    #[serde(default)]
    pub multidrop: bool,
    /// Read timeout override for slow links
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub options: LinkOptions,
}

impl LinkConfig {
    pub fn to_comm_link(&self, engine: &EngineConfig) -> CommLink {
        let timeout = Duration::from_millis(self.timeout_ms.unwrap_or(engine.read_timeout_ms));
        CommLink::new(&self.name, &self.uri, self.protocol)
            .with_multidrop(self.multidrop)
            .with_timeout(timeout)
            .with_options(self.options.clone())
    }
}

/// Device bound to one controller pin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    pub pin: u16,
    pub kind: DeviceKind,
    pub name: String,
}

/// One field controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub name: String,
    pub link: String,
    pub drop: u16,
    #[serde(default)]
    pub io: Vec<PinConfig>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ControllerConfig {
    pub fn to_controller(&self) -> Controller {
        self.io.iter().fold(
            Controller::new(&self.name, &self.link, self.drop),
            |ctl, p| ctl.with_device(p.pin, p.kind, &p.name),
        )
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service: ServiceSection,
    pub engine: EngineConfig,
    pub links: Vec<LinkConfig>,
    pub controllers: Vec<ControllerConfig>,
}

impl ServiceConfig {
    /// Load `path` with environment overrides, then validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PollSrvError::ConfigError(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        info!("Loading configuration from {}", path.display());
        let config: ServiceConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(prefix).split("__"))
            .extract()?;
        config.validate()?;
        debug!(
            "Configuration loaded: {} links, {} controllers",
            config.links.len(),
            config.controllers.len()
        );
        Ok(config)
    }

    /// Check cross references and addressing
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PollSrvError::ValidationError(msg));

        if self.engine.sample_interval_secs == 0 {
            return invalid("engine.sample_interval_secs must be positive".to_string());
        }
        if self.engine.read_timeout_ms == 0 {
            return invalid("engine.read_timeout_ms must be positive".to_string());
        }

        let mut links: HashMap<&str, &LinkConfig> = HashMap::new();
        for link in &self.links {
            if link.name.is_empty() {
                return invalid("Link name cannot be empty".to_string());
            }
            if links.insert(link.name.as_str(), link).is_some() {
                return invalid(format!("Duplicate link name '{}'", link.name));
            }
            fieldlink_core::Endpoint::parse(&link.uri).map_err(|e| PollSrvError::LinkError {
                link: link.name.clone(),
                source: e,
            })?;
        }

        let mut names = HashSet::new();
        let mut drops: HashSet<(&str, u16)> = HashSet::new();
        let mut per_link: HashMap<&str, usize> = HashMap::new();
        for ctl in &self.controllers {
            if !names.insert(ctl.name.as_str()) {
                return invalid(format!("Duplicate controller name '{}'", ctl.name));
            }
            let Some(link) = links.get(ctl.link.as_str()) else {
                return invalid(format!(
                    "Controller '{}' references unknown link '{}'",
                    ctl.name, ctl.link
                ));
            };
            if !link.protocol.is_drop_valid(ctl.drop) {
                return invalid(format!(
                    "Controller '{}': drop {} out of range {:?} for {}",
                    ctl.name,
                    ctl.drop,
                    link.protocol.drop_range(),
                    link.protocol
                ));
            }
            if !drops.insert((ctl.link.as_str(), ctl.drop)) {
                return invalid(format!(
                    "Controller '{}': drop {} already used on link '{}'",
                    ctl.name, ctl.drop, ctl.link
                ));
            }
            let count = per_link.entry(ctl.link.as_str()).or_default();
            *count += 1;
            if *count > 1 && !link.multidrop {
                return invalid(format!(
                    "Link '{}' is not multidrop but has more than one controller",
                    ctl.link
                ));
            }
            let mut pins = HashSet::new();
            for p in &ctl.io {
                if !pins.insert(p.pin) {
                    return invalid(format!("Controller '{}': duplicate pin {}", ctl.name, p.pin));
                }
            }
        }
        Ok(())
    }

    pub fn link(&self, name: &str) -> Option<&LinkConfig> {
        self.links.iter().find(|l| l.name == name)
    }

    /// Enabled controllers on `link`
    pub fn controllers_on<'a>(&'a self, link: &'a str) -> impl Iterator<Item = &'a ControllerConfig> {
        self.controllers
            .iter()
            .filter(move |c| c.enabled && c.link == link)
    }

    /// Render the effective configuration
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| PollSrvError::ConfigError(e.to_string()))
    }
}
