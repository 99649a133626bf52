//! # Setup Failure Classification
//!
//! Maps the cause a bearer layer reports for a failed setup onto the small
//! set of classes the orchestrator has a remedy for. The bearer layer is
//! not trusted to report precise causes, so anything unrecognised is
//! treated as transient.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Cause reported by the transport for a failed bearer setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailCause {
    OperatorBarred,
    InsufficientResources,
    MissingUnknownApn,
    UnknownPdpAddressType,
    UserAuthentication,
    ActivationRejectGgsn,
    ActivationRejectUnspecified,
    ServiceOptionNotSupported,
    ServiceOptionNotSubscribed,
    ServiceOptionOutOfOrder,
    NsapiInUse,
    OnlyIpv4Allowed,
    OnlyIpv6Allowed,
    IpVersionNotSupported,
    ProtocolErrors,
    RegistrationFail,
    GprsRegistrationFail,
    RadioNotAvailable,
    NoMoreBearers,
    Unknown,
}

/// What the orchestrator should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The profile may work, just not on this IP version.
    IpVersionUnsupported,
    /// The network refused this profile; try the next one.
    ProfileRejected,
    /// No bearer capacity left; free some by pre-emption.
    ResourceExhausted,
    /// Reported as permanent, but not clearly tied to anything; exhaust
    /// the remaining profiles before giving up.
    PermanentProfileFailure,
    /// Retry later with backoff.
    Transient,
}

impl FailCause {
    /// Maps a 3GPP TS 24.008 session management cause code.
    pub fn from_code(code: u32) -> Self {
        match code {
            8 => FailCause::OperatorBarred,
            26 => FailCause::InsufficientResources,
            27 => FailCause::MissingUnknownApn,
            28 => FailCause::UnknownPdpAddressType,
            29 => FailCause::UserAuthentication,
            30 => FailCause::ActivationRejectGgsn,
            31 => FailCause::ActivationRejectUnspecified,
            32 => FailCause::ServiceOptionNotSupported,
            33 => FailCause::ServiceOptionNotSubscribed,
            34 => FailCause::ServiceOptionOutOfOrder,
            35 => FailCause::NsapiInUse,
            50 => FailCause::OnlyIpv4Allowed,
            51 => FailCause::OnlyIpv6Allowed,
            111 => FailCause::ProtocolErrors,
            _ => FailCause::Unknown,
        }
    }

    pub fn classify(self) -> FailureClass {
        match self {
            FailCause::IpVersionNotSupported
            | FailCause::OnlyIpv4Allowed
            | FailCause::OnlyIpv6Allowed => FailureClass::IpVersionUnsupported,
            FailCause::MissingUnknownApn
            | FailCause::UnknownPdpAddressType
            | FailCause::UserAuthentication
            | FailCause::ActivationRejectGgsn => FailureClass::ProfileRejected,
            FailCause::InsufficientResources
            | FailCause::NsapiInUse
            | FailCause::NoMoreBearers => FailureClass::ResourceExhausted,
            FailCause::OperatorBarred
            | FailCause::ServiceOptionNotSupported
            | FailCause::ServiceOptionNotSubscribed
            | FailCause::ProtocolErrors => FailureClass::PermanentProfileFailure,
            FailCause::ActivationRejectUnspecified
            | FailCause::ServiceOptionOutOfOrder
            | FailCause::RegistrationFail
            | FailCause::GprsRegistrationFail
            | FailCause::RadioNotAvailable
            | FailCause::Unknown => FailureClass::Transient,
        }
    }

    /// Network-side rejections worth a warning with full context.
    pub fn is_event_loggable(self) -> bool {
        !matches!(
            self,
            FailCause::RadioNotAvailable | FailCause::NoMoreBearers | FailCause::Unknown
        )
    }
}

impl fmt::Display for FailCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
