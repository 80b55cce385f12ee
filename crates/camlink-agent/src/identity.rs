//! Device identity derivation
//!
//! Tiers, in priority order: explicitly configured id, platform query,
//! first hardware MAC address, random. A failing tier is logged and the next
//! one is tried; resolution itself never fails.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("{command} exited with {status}")]
    CommandFailed { command: String, status: String },

    #[error("identity query timed out after {0:?}")]
    Timeout(Duration),

    #[error("no device id in platform output")]
    NotFound,

    #[error("no usable network interface: {0}")]
    NoInterface(String),
}

/// Where an identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Configured,
    Platform,
    Mac,
    Random,
}

impl std::fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IdentitySource::Configured => "configured",
            IdentitySource::Platform => "platform",
            IdentitySource::Mac => "mac",
            IdentitySource::Random => "random",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub id: String,
    pub source: IdentitySource,
}

/// Vendor-specific device id lookup
#[async_trait]
pub trait PlatformIdentity: Send + Sync {
    async fn query_device_id(&self) -> Result<String, IdentityError>;
}

/// Reads the device id from the `armbenv -r` environment dump found on the camera firmware
pub struct ArmbenvIdentity {
    command: String,
    timeout: Duration,
}

impl Default for ArmbenvIdentity {
    fn default() -> Self {
        Self {
            command: "armbenv".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl ArmbenvIdentity {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

/// Pick the `ID = <value>` line that carries no `:`; the value starts at column 5
pub fn parse_armbenv_output(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter(|line| line.contains("ID =") && !line.contains(':'))
        .filter_map(|line| line.get(5..))
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl PlatformIdentity for ArmbenvIdentity {
    async fn query_device_id(&self) -> Result<String, IdentityError> {
        let run = tokio::process::Command::new(&self.command)
            .arg("-r")
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| IdentityError::Timeout(self.timeout))?
            .map_err(|e| IdentityError::Spawn {
                command: self.command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(IdentityError::CommandFailed {
                command: self.command.clone(),
                status: output.status.to_string(),
            });
        }

        parse_armbenv_output(&String::from_utf8_lossy(&output.stdout))
            .ok_or(IdentityError::NotFound)
    }
}

pub struct IdentityResolver {
    configured: Option<String>,
    platform: Option<Box<dyn PlatformIdentity>>,
    sysfs_net: PathBuf,
}

impl IdentityResolver {
    pub fn new(configured: Option<String>) -> Self {
        Self {
            configured,
            platform: Some(Box::new(ArmbenvIdentity::default())),
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }

    /// Replace (or with `None`, skip) the platform tier
    pub fn with_platform(mut self, platform: Option<Box<dyn PlatformIdentity>>) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_sysfs_net(mut self, path: impl Into<PathBuf>) -> Self {
        self.sysfs_net = path.into();
        self
    }

    pub async fn resolve(&self) -> AgentIdentity {
        if let Some(id) = self.configured.as_deref().map(str::trim) {
            if !id.is_empty() {
                return AgentIdentity {
                    id: id.to_string(),
                    source: IdentitySource::Configured,
                };
            }
        }

        if let Some(platform) = &self.platform {
            match platform.query_device_id().await {
                Ok(id) => {
                    info!(device_id = %id, "Device id obtained from platform");
                    return AgentIdentity {
                        id,
                        source: IdentitySource::Platform,
                    };
                }
                Err(e) => warn!(error = %e, "Platform device id unavailable"),
            }
        }

        match self.mac_identity().await {
            Ok(id) => {
                info!(device_id = %id, "Device id derived from MAC address");
                return AgentIdentity {
                    id,
                    source: IdentitySource::Mac,
                };
            }
            Err(e) => warn!(error = %e, "MAC-derived device id unavailable"),
        }

        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        info!(device_id = %id, "Device id generated randomly");
        AgentIdentity {
            id,
            source: IdentitySource::Random,
        }
    }

    /// First non-loopback interface with a non-zero address, in name order
    async fn mac_identity(&self) -> Result<String, IdentityError> {
        let mut entries = tokio::fs::read_dir(&self.sysfs_net)
            .await
            .map_err(|e| IdentityError::NoInterface(e.to_string()))?;

        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if name != "lo" {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        for name in names {
            let path = self.sysfs_net.join(&name).join("address");
            let Ok(raw) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let mac: String = raw.trim().chars().filter(|c| *c != ':').collect();
            if mac.len() == 12 && mac.chars().any(|c| c != '0') {
                return Ok(mac.to_ascii_lowercase());
            }
        }

        Err(IdentityError::NoInterface(format!(
            "no hardware address under {}",
            self.sysfs_net.display()
        )))
    }
}
