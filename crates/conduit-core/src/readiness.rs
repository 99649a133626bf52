//! # Data Readiness Gate
//!
//! Collates the external signals that decide whether any data activity is
//! allowed at all, and which profile family the current radio technology
//! wants.

use serde::{Deserialize, Serialize};

use crate::profile::ProfileType;

/// Radio access technology reported with the registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioTechnology {
    #[default]
    Unknown,
    Gprs,
    Edge,
    Umts,
    Hsdpa,
    Hsupa,
    Hspa,
    Lte,
    Is95a,
    Is95b,
    OneXRtt,
    Evdo0,
    EvdoA,
    EvdoB,
    Ehrpd,
}

impl RadioTechnology {
    pub fn is_unknown(self) -> bool {
        self == RadioTechnology::Unknown
    }

    /// 3GPP family.
    pub fn is_gsm(self) -> bool {
        matches!(
            self,
            RadioTechnology::Gprs
                | RadioTechnology::Edge
                | RadioTechnology::Umts
                | RadioTechnology::Hsdpa
                | RadioTechnology::Hsupa
                | RadioTechnology::Hspa
                | RadioTechnology::Lte
        )
    }

    pub fn is_evdo(self) -> bool {
        matches!(
            self,
            RadioTechnology::Evdo0 | RadioTechnology::EvdoA | RadioTechnology::EvdoB
        )
    }

    /// 3GPP2 family. eHRPD counts as both.
    pub fn is_cdma(self) -> bool {
        matches!(
            self,
            RadioTechnology::Is95a
                | RadioTechnology::Is95b
                | RadioTechnology::OneXRtt
                | RadioTechnology::Ehrpd
        ) || self.is_evdo()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionSource {
    /// Subscription held in non-volatile memory; no RUIM needed.
    Nv,
    #[default]
    Ruim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Sim,
    Ruim,
}

/// Every input of the readiness decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessSignals {
    pub radio_on: bool,
    pub desired_power: bool,
    pub in_service: bool,
    pub technology: RadioTechnology,
    pub roaming: bool,
    pub roaming_allowed: bool,
    pub sim_records_loaded: bool,
    pub ruim_records_loaded: bool,
    pub subscription_source: SubscriptionSource,
    pub ps_restricted: bool,
    pub master_data_enabled: bool,
    pub no_auto_attach: bool,
    pub ehrpd_capable: bool,
}

impl Default for ReadinessSignals {
    fn default() -> Self {
        Self {
            radio_on: false,
            desired_power: true,
            in_service: false,
            technology: RadioTechnology::Unknown,
            roaming: false,
            roaming_allowed: false,
            sim_records_loaded: false,
            ruim_records_loaded: false,
            subscription_source: SubscriptionSource::default(),
            ps_restricted: false,
            master_data_enabled: true,
            no_auto_attach: false,
            ehrpd_capable: false,
        }
    }
}

impl ReadinessSignals {
    /// Whether the device may carry any data right now.
    pub fn is_ready(&self) -> bool {
        let mut ready = self.master_data_enabled
            && (!self.roaming || self.roaming_allowed)
            && (self.in_service || self.no_auto_attach)
            && self.desired_power
            && self.radio_on;

        let r = self.technology;
        if r.is_gsm() || r == RadioTechnology::Ehrpd || (r.is_unknown() && self.no_auto_attach) {
            ready = ready && self.sim_records_loaded && !self.ps_restricted;
        }
        if r.is_cdma() {
            ready = ready
                && (self.subscription_source == SubscriptionSource::Nv
                    || self.ruim_records_loaded);
        }
        ready
    }

    /// Profile family to prefer; `None` means any.
    pub fn profile_type_hint(&self) -> Option<ProfileType> {
        let r = self.technology;
        if r.is_unknown() {
            None
        } else if r == RadioTechnology::Ehrpd || (self.ehrpd_capable && r.is_evdo()) {
            // EVDO and eHRPD are indistinguishable until a call is made
            Some(ProfileType::Apn)
        } else if r.is_gsm() {
            Some(ProfileType::Apn)
        } else {
            Some(ProfileType::Nai)
        }
    }

    /// Whether an NAI profile may stand in when no APN profile is left.
    pub fn allows_nai_fallback(&self) -> bool {
        self.ehrpd_capable && self.technology.is_evdo()
    }
}
