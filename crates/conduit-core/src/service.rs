//! # Services and IP Versions
//!
//! The fixed set of logical data services a client can request, their
//! runtime priorities, and the IP versions a service can be tracked on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// A logical network capability requested by clients.
///
/// Declaration order doubles as the tie-break order when two services have
/// the same priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Default,
    Mms,
    Supl,
    Dun,
    Hipri,
    Verizon,
}

impl ServiceType {
    pub const ALL: [ServiceType; 6] = [
        ServiceType::Default,
        ServiceType::Mms,
        ServiceType::Supl,
        ServiceType::Dun,
        ServiceType::Hipri,
        ServiceType::Verizon,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Stable numeric id, used by the legacy priority string.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Default => "default",
            ServiceType::Mms => "mms",
            ServiceType::Supl => "supl",
            ServiceType::Dun => "dun",
            ServiceType::Hipri => "hipri",
            ServiceType::Verizon => "verizon",
        }
    }

    /// The catch-all service that is retried forever instead of being
    /// disabled once its profiles are exhausted.
    pub fn is_baseline(self) -> bool {
        self == ServiceType::Default
    }

    fn default_priority(self) -> i32 {
        match self {
            ServiceType::Default => 10,
            ServiceType::Mms => 20,
            ServiceType::Supl => 30,
            ServiceType::Dun => 50,
            ServiceType::Hipri => 400,
            ServiceType::Verizon => 100,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        ServiceType::ALL
            .into_iter()
            .find(|ds| ds.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ConfigError::UnknownService(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub const ALL: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IpVersion::V4 => "v4",
            IpVersion::V6 => "v6",
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime priority table. Higher value = more important.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePriorities {
    values: [i32; ServiceType::COUNT],
}

impl Default for ServicePriorities {
    fn default() -> Self {
        let mut values = [0; ServiceType::COUNT];
        for ds in ServiceType::ALL {
            values[ds.index()] = ds.default_priority();
        }
        Self { values }
    }
}

impl ServicePriorities {
    /// Parses the legacy `"index=priority;..."` form. Services not named in
    /// the string keep their default priority.
    pub fn parse_legacy(input: &str) -> Result<Self, ConfigError> {
        let mut out = Self::default();
        for entry in input.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let bad = || ConfigError::InvalidPriority(entry.to_string());
            let (index, priority) = entry.split_once('=').ok_or_else(bad)?;
            let index: usize = index.trim().parse().map_err(|_| bad())?;
            let priority: i32 = priority.trim().parse().map_err(|_| bad())?;
            let ds = ServiceType::from_index(index).ok_or_else(bad)?;
            out.set(ds, priority);
        }
        Ok(out)
    }

    pub fn get(&self, ds: ServiceType) -> i32 {
        self.values[ds.index()]
    }

    pub fn set(&mut self, ds: ServiceType, priority: i32) {
        self.values[ds.index()] = priority;
    }

    pub fn is_lower(&self, a: ServiceType, b: ServiceType) -> bool {
        self.get(a) < self.get(b)
    }

    /// All services, highest priority first; ties keep declaration order.
    pub fn sorted_descending(&self) -> [ServiceType; ServiceType::COUNT] {
        let mut out = ServiceType::ALL;
        // sort_by is stable, so equal priorities stay in declaration order
        out.sort_by(|a, b| self.get(*b).cmp(&self.get(*a)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priorities_sort_hipri_first() {
        let p = ServicePriorities::default();
        let order = p.sorted_descending();
        assert_eq!(order[0], ServiceType::Hipri);
        assert_eq!(order[1], ServiceType::Verizon);
        assert_eq!(order[5], ServiceType::Default);
    }

    #[test]
    fn ties_keep_declaration_order() {
        let mut p = ServicePriorities::default();
        for ds in ServiceType::ALL {
            p.set(ds, 1);
        }
        assert_eq!(p.sorted_descending(), ServiceType::ALL);
    }

    #[test]
    fn legacy_string_overrides_named_services_only() {
        let p = ServicePriorities::parse_legacy("0=99;1=5;").unwrap();
        assert_eq!(p.get(ServiceType::Default), 99);
        assert_eq!(p.get(ServiceType::Mms), 5);
        assert_eq!(p.get(ServiceType::Supl), 30);
    }

    #[test]
    fn legacy_string_rejects_garbage() {
        assert!(ServicePriorities::parse_legacy("0=ten").is_err());
        assert!(ServicePriorities::parse_legacy("17=3").is_err());
        assert!(ServicePriorities::parse_legacy("nonsense").is_err());
    }

    #[test]
    fn service_names_parse_case_insensitively() {
        assert_eq!("MMS".parse::<ServiceType>().unwrap(), ServiceType::Mms);
        assert!("wap".parse::<ServiceType>().is_err());
    }
}
