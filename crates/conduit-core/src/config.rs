use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::profile::{ProfileSpec, ProfileType};
use crate::retry::RetrySchedule;
use crate::service::{IpVersion, ServicePriorities, ServiceType};

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_POOL_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid retry schedule `{input}`: {reason}")]
    InvalidRetrySchedule { input: String, reason: String },
    #[error("invalid service priority entry `{0}`")]
    InvalidPriority(String),
    #[error("unknown service `{0}`")]
    UnknownService(String),
    #[error("pool_size must be at least 1")]
    EmptyPool,
    #[error("duplicate profile name `{0}`")]
    DuplicateProfile(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfigInput {
    pub version: u32,
    pub pool_size: Option<usize>,
    pub ip_versions: Option<Vec<IpVersion>>,
    pub ehrpd_capable: bool,
    pub data_disabled_on_boot: bool,
    pub data_roaming_allowed: bool,
    pub seed: Option<u64>,
    pub priorities: Option<PrioritiesInput>,
    pub retry: RetryInput,
    pub profiles: Vec<ProfileInput>,
}

/// Either the legacy `"0=10;1=20;"` string or a `service = priority` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PrioritiesInput {
    Legacy(String),
    Table(BTreeMap<String, i32>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryInput {
    pub default_schedule: Option<String>,
    #[serde(flatten)]
    pub per_service: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProfileInput {
    pub name: String,
    pub kind: Option<ProfileType>,
    pub services: Vec<String>,
    pub ip_versions: Option<Vec<IpVersion>>,
    pub apn: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub version: u32,
    pub pool_size: usize,
    pub ip_versions: Vec<IpVersion>,
    pub ehrpd_capable: bool,
    pub data_disabled_on_boot: bool,
    pub data_roaming_allowed: bool,
    pub seed: u64,
    pub priorities: ServicePriorities,
    pub retry_schedules: Vec<RetrySchedule>,
    pub profiles: Vec<ProfileSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            pool_size: DEFAULT_POOL_SIZE,
            ip_versions: vec![IpVersion::V4],
            ehrpd_capable: false,
            data_disabled_on_boot: false,
            data_roaming_allowed: false,
            seed: 0,
            priorities: ServicePriorities::default(),
            retry_schedules: vec![RetrySchedule::default(); ServiceType::COUNT],
            profiles: Vec::new(),
        }
    }
}

impl EngineConfigInput {
    pub fn resolve(self) -> Result<EngineConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let pool_size = self.pool_size.unwrap_or(DEFAULT_POOL_SIZE);
        if pool_size == 0 {
            return Err(ConfigError::EmptyPool);
        }

        let mut ip_versions = self.ip_versions.unwrap_or_else(|| vec![IpVersion::V4]);
        ip_versions.sort();
        ip_versions.dedup();

        let priorities = match self.priorities {
            None => ServicePriorities::default(),
            Some(PrioritiesInput::Legacy(s)) => ServicePriorities::parse_legacy(&s)?,
            Some(PrioritiesInput::Table(table)) => {
                let mut p = ServicePriorities::default();
                for (name, priority) in table {
                    p.set(name.parse()?, priority);
                }
                p
            }
        };

        let fallback = match self.retry.default_schedule {
            Some(s) => s.parse::<RetrySchedule>()?,
            None => RetrySchedule::default(),
        };
        let mut retry_schedules = vec![fallback; ServiceType::COUNT];
        for (name, schedule) in self.retry.per_service {
            let ds: ServiceType = name.parse()?;
            retry_schedules[ds.index()] = schedule.parse()?;
        }

        let mut names = HashSet::new();
        let mut profiles = Vec::new();
        for input in self.profiles {
            let name = input.name.trim().to_string();
            if name.is_empty() {
                tracing::warn!("skipping profile without a name");
                continue;
            }
            if !names.insert(name.clone()) {
                return Err(ConfigError::DuplicateProfile(name));
            }
            let services = input
                .services
                .iter()
                .map(|s| s.parse::<ServiceType>())
                .collect::<Result<Vec<_>, _>>()?;
            if services.is_empty() {
                tracing::warn!(profile = %name, "profile serves no services, skipping");
                continue;
            }
            let non_empty = |v: Option<String>| {
                v.and_then(|s| {
                    let trimmed = s.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        Some(trimmed.to_string())
                    }
                })
            };
            profiles.push(ProfileSpec {
                name,
                kind: input.kind.unwrap_or(ProfileType::Apn),
                services,
                ip_versions: input.ip_versions.unwrap_or_else(|| IpVersion::ALL.to_vec()),
                apn: non_empty(input.apn),
                user: non_empty(input.user),
                password: input.password,
            });
        }

        Ok(EngineConfig {
            version,
            pool_size,
            ip_versions,
            ehrpd_capable: self.ehrpd_capable,
            data_disabled_on_boot: self.data_disabled_on_boot,
            data_roaming_allowed: self.data_roaming_allowed,
            seed: self.seed.unwrap_or(0),
            priorities,
            retry_schedules,
            profiles,
        })
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        let parsed: EngineConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn schedule_for(&self, ds: ServiceType) -> RetrySchedule {
        self.retry_schedules
            .get(ds.index())
            .cloned()
            .unwrap_or_default()
    }

    pub fn supports(&self, ipv: IpVersion) -> bool {
        self.ip_versions.contains(&ipv)
    }
}
