use thiserror::Error;

/// Errors produced by host and guest drivers.
///
/// These are translated into the daemon's own error taxonomy (and from there into 9P errno
/// values and error-ring text) at the boundary where `fsd` calls into this crate; this type
/// does not know anything about 9P or errno.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no driver registered for tag {0:?}")]
    UnknownTag(String),

    #[error("driver {0:?} is not implemented in this build: {1}")]
    NotImplemented(String, &'static str),

    #[error("invalid configuration for driver {driver:?}")]
    InvalidConfig {
        driver: String,
        #[source]
        source: FieldError,
    },

    #[error("entry {0:?} does not exist")]
    NotFound(String),

    #[error("{0:?} is not a directory")]
    NotADirectory(String),

    #[error("host mount failed")]
    MountFailed(#[source] anyhow::Error),

    #[error("host unmount failed")]
    UnmountFailed(#[source] anyhow::Error),

    #[error("guest file system error")]
    Guest(#[source] anyhow::Error),
}

/// Maps a driver error onto the errno the daemon's 9P layer should reply with.
pub trait ToErrno {
    fn to_errno(&self) -> libc::c_int;
}

impl ToErrno for DriverError {
    fn to_errno(&self) -> libc::c_int {
        match self {
            DriverError::NotFound(_) => libc::ENOENT,
            DriverError::NotADirectory(_) => libc::ENOTDIR,
            DriverError::UnknownTag(_) => libc::ENODEV,
            DriverError::NotImplemented(..) => libc::ENOSYS,
            DriverError::InvalidConfig { .. } => libc::EINVAL,
            DriverError::MountFailed(_) | DriverError::UnmountFailed(_) => libc::EIO,
            DriverError::Guest(_) => libc::EIO,
        }
    }
}

/// A malformed or unrecognized field in a driver's JSON configuration.
///
/// `tried` lists the accepted field names closest to `key`, ranked by similarity, so the
/// client can be told "did you mean `host.point`?" instead of a bare parse failure.
#[derive(Debug, Error)]
pub struct FieldError {
    pub key: String,
    pub tried: Vec<String>,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.tried.is_empty() {
            write!(f, "unknown field {:?}", self.key)
        } else {
            write!(f, "unknown field {:?} (did you mean {}?)", self.key, self.tried.join(" or "))
        }
    }
}

impl FieldError {
    /// Builds a `FieldError` for `key`, ranking `accepted` by edit-distance similarity.
    pub fn new(key: impl Into<String>, accepted: &[&str]) -> Self {
        let key = key.into();
        let mut ranked: Vec<&str> = accepted.to_vec();
        ranked.sort_by_key(|candidate| strsim::levenshtein(&key, candidate));
        let tried = ranked.into_iter().take(3).map(str::to_owned).collect();
        Self { key, tried }
    }

    /// Builds a `FieldError` for a required field that was absent entirely.
    pub fn missing(key: impl Into<String>) -> Self {
        Self { key: key.into(), tried: Vec::new() }
    }
}

