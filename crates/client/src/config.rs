//! Client configuration management

use crate::manager::ManagerSettings;
use crate::usb::acl::AclHelper;
use crate::usb::filter::{DEFAULT_AUTO_CONNECT_FILTER, FilterRules};
use anyhow::{Context, Result, anyhow};
use common::usb_types::AddressingMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    /// Master switch for USB redirection
    pub redirection_enabled: bool,
    /// Connect hot-plugged devices automatically
    pub auto_connect: bool,
    /// Rules selecting which hot-plugged devices auto-connect
    pub auto_connect_filter: String,
    /// Rules selecting a device to redirect once a channel comes up
    pub redirect_on_connect: Option<String>,
    /// Outbound payloads above this many bytes may be compressed
    pub compression_threshold: usize,
    /// Access-control helper to run before opening a device
    pub acl_helper: Option<PathBuf>,
    /// How devices are identified
    pub addressing: AddressingMode,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            redirection_enabled: true,
            auto_connect: true,
            auto_connect_filter: DEFAULT_AUTO_CONNECT_FILTER.to_string(),
            redirect_on_connect: None,
            compression_threshold: 1000,
            acl_helper: None,
            addressing: AddressingMode::default(),
        }
    }
}

impl UsbSettings {
    /// Device manager policy described by these settings
    pub fn manager_settings(&self) -> Result<ManagerSettings> {
        let auto_connect_filter: FilterRules = self
            .auto_connect_filter
            .parse()
            .with_context(|| format!("Invalid auto_connect_filter '{}'", self.auto_connect_filter))?;

        let redirect_on_connect = self
            .redirect_on_connect
            .as_deref()
            .map(|rules| {
                rules
                    .parse::<FilterRules>()
                    .with_context(|| format!("Invalid redirect_on_connect '{}'", rules))
            })
            .transpose()?;

        let acl_helper = self.acl_helper.as_ref().map(|path| {
            let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
            AclHelper::new(expanded)
        });

        Ok(ManagerSettings {
            redirection_enabled: self.redirection_enabled,
            auto_connect: self.auto_connect,
            auto_connect_filter,
            redirect_on_connect,
            compression_threshold: self.compression_threshold,
            acl_helper,
        })
    }
}

impl ClientConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-redirect/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "USB: redirection={}, auto_connect={}, filter='{}', addressing={:?}",
            config.usb.redirection_enabled,
            config.usb.auto_connect,
            config.usb.auto_connect_filter,
            config.usb.addressing
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-redirect").join("client.toml")
        } else {
            PathBuf::from(".config/usb-redirect/client.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }

        self.usb.manager_settings()?;
        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<ClientConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ClientConfig::load(Some(path_buf))
}
