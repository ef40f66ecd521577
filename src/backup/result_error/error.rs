use crate::backup::result_error::{AddFunctionName, AddMsg};
use itertools::Itertools;
use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;
use thiserror_ext::Construct;

#[derive(Error, Debug, Construct)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    Glob(#[from] globset::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Persist(#[from] tempfile::PersistError),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error("Invalid configuration:\n{}", indent::indent_all_with("  ", .0.to_string()))]
    ConfigInvalid(#[from] validator::ValidationErrors),
    #[error("Backup destination is locked by {holder}")]
    LockContention { holder: String },
    #[error("Source directory unavailable: {path:?}")]
    SourceUnavailable { path: PathBuf },
    #[error("Destination is not writable {path:?}: {reason}")]
    DestinationUnwritable { path: PathBuf, reason: String },
    #[error("{:?} still failing after {} attempts:\n{}", path, attempts, indent::indent_all_with("  ", error.to_string()))]
    TransientIo {
        path: PathBuf,
        attempts: u32,
        error: Box<Error>,
    },
    #[error("Insufficient space at {path:?}: {available} bytes available, {required} bytes required")]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("Invalid restore path {0:?}, must be relative and stay inside the snapshot")]
    InvalidRestorePath(PathBuf),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { fn_name: String, error: Box<Error> },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Error::with_msg(msg, self)
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Error::with_fn_name(fn_name, self)
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Peels context wrappers off until the error that actually happened.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. }
            | Error::WithFnName { error, .. }
            | Error::TransientIo { error, .. } => error.root_cause(),
            Error::LotsOfError(v) => v.first().map(Error::root_cause).unwrap_or(self),
            e => e,
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self.root_cause() {
            Error::Io(e) => !matches!(
                e.kind(),
                ErrorKind::NotFound
                    | ErrorKind::PermissionDenied
                    | ErrorKind::AlreadyExists
                    | ErrorKind::InvalidInput
            ),
            Error::WalkDir(e) => e
                .io_error()
                .map(|io| io.kind() != ErrorKind::NotFound && io.kind() != ErrorKind::PermissionDenied)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self.root_cause(), Error::LockContention { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Error::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        match self.root_cause() {
            Error::Io(e) => e.kind() == ErrorKind::NotFound,
            Error::WalkDir(e) => e
                .io_error()
                .map(|io| io.kind() == ErrorKind::NotFound)
                .unwrap_or(false),
            _ => false,
        }
    }
}
