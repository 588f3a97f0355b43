use thiserror::Error;

use crate::applier::ApplierError;
use crate::certifier::CertifierError;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::gcs::GcsError;
use crate::pipeline::PipelineError;
use crate::plugin::PluginError;
use crate::recovery::RecoveryError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (locally or remotely).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the per-module error enums; components keep their own
/// error types at the seams and callers that span modules use this one.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Applier(#[from] ApplierError),

    #[error(transparent)]
    Certifier(#[from] CertifierError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Gcs(#[from] GcsError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Config(_) => Transience::Permanent,
            Error::Applier(e) => e.transience(),
            Error::Certifier(e) => e.transience(),
            Error::Pipeline(_) => Transience::Permanent,
            Error::Recovery(e) => e.transience(),
            Error::Gcs(e) => e.transience(),
            Error::Engine(_) => Transience::Unknown,
            Error::Plugin(PluginError::AlreadyRunning) => Transience::Permanent,
            Error::Plugin(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Config(_) | Error::Pipeline(_) => Effect::None,
            Error::Certifier(_) => Effect::None,
            Error::Applier(_) | Error::Recovery(_) => Effect::Unknown,
            Error::Gcs(_) | Error::Engine(_) | Error::Plugin(_) => Effect::Unknown,
        }
    }
}
