//! The error taxonomy every operation in this crate returns through.
//!
//! Every variant carries the numeric code it must travel as on the wire
//! (see `code()`); the JSON-RPC dispatcher never invents a code of its
//! own beyond `-32700`/`-32600`/`-32601` (framing errors that occur
//! before a method body ever runs).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TargetdError>;

#[derive(Error, Debug)]
pub enum TargetdError {
    #[error("{0}")]
    Invalid(String),

    #[error("name conflict: {0}")]
    NameConflict(String),

    #[error("clone target '{0}' already exists")]
    ExistsCloneName(String),

    #[error("initiator '{0}' already configured")]
    ExistsInitiator(String),

    #[error("filesystem or snapshot '{0}' already exists")]
    ExistsFsName(String),

    #[error("no such volume '{0}'")]
    NotFoundVolume(String),

    #[error("no such filesystem '{0}'")]
    NotFoundFs(String),

    #[error("unknown pool '{0}'")]
    InvalidPool(String),

    #[error("no such snapshot '{0}'")]
    NotFoundSs(String),

    #[error("no such export for volume '{0}' and initiator '{1}'")]
    NotFoundVolumeExport(String, String),

    #[error("backing volume group or dataset '{0}' not found")]
    NotFoundVolumeGroup(String),

    #[error("{0}")]
    NoSupport(String),

    #[error("no such access group '{0}'")]
    NotFoundAccessGroup(String),

    #[error("volume '{0}' is masked by an existing export")]
    VolumeMasked(String),

    #[error("command {cmd:?} exited {code}: {output}")]
    UnexpectedExitCode {
        cmd: Vec<String>,
        code: i32,
        output: String,
    },

    #[error("no such NFS export for {host}:{path}")]
    NotFoundNfsExport { host: String, path: String },

    #[error("NFS export support unavailable: {0}")]
    NfsNoSupport(String),

    #[error("no free host LUN id available")]
    NoFreeHostLunId,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TargetdError {
    /// The numeric code this error travels as in a JSON-RPC error envelope.
    pub fn code(&self) -> i32 {
        match self {
            TargetdError::Invalid(_) => -1,
            TargetdError::NameConflict(_) => -50,
            TargetdError::ExistsCloneName(_) => -51,
            TargetdError::ExistsInitiator(_) => -52,
            TargetdError::ExistsFsName(_) => -53,
            TargetdError::NotFoundVolume(_) => -103,
            TargetdError::NotFoundFs(_) => -104,
            TargetdError::InvalidPool(_) => -110,
            TargetdError::NotFoundSs(_) => -112,
            TargetdError::NotFoundVolumeExport(_, _) => -151,
            TargetdError::NotFoundVolumeGroup(_) => -152,
            TargetdError::NoSupport(_) => -153,
            TargetdError::NotFoundAccessGroup(_) => -200,
            TargetdError::VolumeMasked(_) => -303,
            TargetdError::UnexpectedExitCode { .. } => -303,
            TargetdError::NotFoundNfsExport { .. } => -400,
            TargetdError::NfsNoSupport(_) => -401,
            TargetdError::NoFreeHostLunId => -1000,
            TargetdError::InvalidArgument(_) => -32602,
            TargetdError::Io(_) => -1,
        }
    }
}
