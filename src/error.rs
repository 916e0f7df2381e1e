use thiserror::Error;

use crate::model::Package;

#[derive(Error, Debug)]
pub enum Error {
    /// The name failed canonical-form validation. Raised locally before
    /// any round trip; the daemon never sees these.
    #[error("invalid canonical package name: {0}")]
    InvalidCanonicalName(String),

    /// The daemon channel could not be established, or the elevation
    /// helper failed to start.
    #[error("package service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Conflict resolution failed. Carries every irreconcilable family,
    /// not just the first, so a caller can present the whole choice.
    #[error("{} package famil{} could not be resolved to a single candidate",
            .0.len(), if .0.len() == 1 { "y" } else { "ies" })]
    ConflictedPackages(Vec<Vec<Package>>),

    /// An install found newer compatible versions and declines to
    /// proceed without explicit confirmation.
    #[error("package {} has {} potential upgrade(s)", .package.canonical_name, .upgrades.len())]
    PackageHasPotentialUpgrades {
        package: Box<Package>,
        upgrades: Vec<Package>,
    },

    /// A file or query matched nothing.
    #[error("unknown package: {0}")]
    UnknownPackage(String),

    /// Multiple independent per-item failures from a batch operation.
    #[error("{} operation(s) failed", .0.len())]
    Aggregate(Vec<Error>),

    /// A typed failure decoded from a daemon response frame.
    #[error("service error: {0}")]
    Remote(String),

    /// A frame that could not be decoded. Tears down the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures a caller can fix by re-issuing the operation
    /// with disambiguating parameters.
    pub fn is_planning_failure(&self) -> bool {
        matches!(
            self,
            Error::ConflictedPackages(_) | Error::PackageHasPotentialUpgrades { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
