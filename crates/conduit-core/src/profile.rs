//! # Connection Profiles
//!
//! Candidate configurations a bearer can be brought up with, and the
//! registry that hands out the next one still believed to work for a
//! given service and IP version.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::service::{IpVersion, ServiceType};

/// Addressing scheme family of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    /// 3GPP access point name.
    Apn,
    /// 3GPP2 network access identifier.
    Nai,
}

/// Registry-assigned identity. Never reused, even across reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProfileId(pub u32);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dp#{}", self.0)
    }
}

/// Static description of a profile as loaded from configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ProfileSpec {
    pub name: String,
    pub kind: ProfileType,
    pub services: Vec<ServiceType>,
    pub ip_versions: Vec<IpVersion>,
    pub apn: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ProfileSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("services", &self.services)
            .field("ip_versions", &self.ip_versions)
            .field("apn", &self.apn)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProfileSpec {
    pub fn new(name: impl Into<String>, kind: ProfileType, services: &[ServiceType]) -> Self {
        Self {
            name: name.into(),
            kind,
            services: services.to_vec(),
            ip_versions: IpVersion::ALL.to_vec(),
            apn: None,
            user: None,
            password: None,
        }
    }

    pub fn with_ip_versions(mut self, ip_versions: &[IpVersion]) -> Self {
        self.ip_versions = ip_versions.to_vec();
        self
    }
}

/// A profile plus its sticky per-IP-version working flags.
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: ProfileId,
    pub spec: ProfileSpec,
    working: [bool; 2],
}

impl Profile {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn kind(&self) -> ProfileType {
        self.spec.kind
    }

    pub fn can_handle(&self, ds: ServiceType) -> bool {
        self.spec.services.contains(&ds)
    }

    pub fn supports(&self, ipv: IpVersion) -> bool {
        self.spec.ip_versions.contains(&ipv)
    }

    pub fn is_working(&self, ipv: IpVersion) -> bool {
        self.working[ipv.index()]
    }

    pub fn short_name(&self) -> String {
        format!("{}({})", self.spec.name, self.id)
    }
}

/// Ordered candidate list of all configured profiles.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: Vec<Profile>,
    next_id: u32,
}

impl ProfileRegistry {
    pub fn new(specs: Vec<ProfileSpec>) -> Self {
        let mut registry = Self::default();
        registry.reload(specs);
        registry
    }

    /// Replaces every profile. Ids of the previous generation become stale.
    pub fn reload(&mut self, specs: Vec<ProfileSpec>) {
        self.profiles = specs
            .into_iter()
            .map(|spec| {
                let id = ProfileId(self.next_id);
                self.next_id += 1;
                Profile {
                    id,
                    spec,
                    working: [true; 2],
                }
            })
            .collect();
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, id: ProfileId) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.iter()
    }

    /// First candidate, in declared order, that can serve `ds` on `ipv`, is
    /// still marked working for `ipv`, and matches `hint` (any type when
    /// `hint` is `None`).
    pub fn next_working(
        &self,
        ds: ServiceType,
        hint: Option<ProfileType>,
        ipv: IpVersion,
    ) -> Option<&Profile> {
        self.profiles.iter().find(|p| {
            p.can_handle(ds)
                && p.supports(ipv)
                && p.is_working(ipv)
                && hint.is_none_or(|kind| p.kind() == kind)
        })
    }

    /// Returns false if the id belongs to a previous generation.
    pub fn set_working(&mut self, id: ProfileId, working: bool, ipv: IpVersion) -> bool {
        match self.profiles.iter_mut().find(|p| p.id == id) {
            Some(profile) => {
                profile.working[ipv.index()] = working;
                true
            }
            None => false,
        }
    }

    pub fn reset_all_working(&mut self) {
        for profile in &mut self.profiles {
            profile.working = [true; 2];
        }
    }
}
