use std::path::PathBuf;

/// Failure kinds surfaced by the provisioning engine.
///
/// Internals propagate `anyhow::Error`; callers recover the kind with
/// [`ProvisionError::find`], which walks the whole context chain.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("[PB100] unsupported platform {os}-{arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("[PB101] invalid python version constraint `{constraint}`: {reason}")]
    InvalidConstraint { constraint: String, reason: String },
    #[error("[PB110] no python release satisfies `{constraint}`")]
    NoMatchingRelease { constraint: String },
    #[error("[PB111] release asset {asset} has no published checksum")]
    NoChecksum { asset: String },
    #[error("[PB120] checksum mismatch for {asset} (expected {expected}, found {actual})")]
    ChecksumMismatch {
        asset: String,
        expected: String,
        actual: String,
    },
    #[error("[PB130] timed out waiting for lock on {} after {attempts} attempts", path.display())]
    LockTimeout { path: PathBuf, attempts: u32 },
    #[error(
        "[PB140] environment `{name}` is bound to python {found}, which does not satisfy `{constraint}`"
    )]
    VersionConflict {
        name: String,
        found: String,
        constraint: String,
    },
    #[error("[PB141] invalid environment name `{name}`")]
    InvalidEnvironmentName { name: String },
    #[error("[PB142] failed to create environment `{name}` (exit status {status}): {stderr}")]
    EnvironmentCreation {
        name: String,
        status: i32,
        stderr: String,
    },
    #[error("[PB150] pip {action} failed (exit status {status}): {detail}")]
    InstallFailure {
        action: String,
        status: i32,
        detail: String,
    },
}

impl ProvisionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedPlatform { .. } => "PB100",
            Self::InvalidConstraint { .. } => "PB101",
            Self::NoMatchingRelease { .. } => "PB110",
            Self::NoChecksum { .. } => "PB111",
            Self::ChecksumMismatch { .. } => "PB120",
            Self::LockTimeout { .. } => "PB130",
            Self::VersionConflict { .. } => "PB140",
            Self::InvalidEnvironmentName { .. } => "PB141",
            Self::EnvironmentCreation { .. } => "PB142",
            Self::InstallFailure { .. } => "PB150",
        }
    }

    /// Locate a provisioning failure anywhere in an error chain.
    #[must_use]
    pub fn find(err: &anyhow::Error) -> Option<&ProvisionError> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<ProvisionError>())
    }
}
