//! Operation errors.
//!
//! Every engine failure maps to one variant; `transience()` decides the
//! `temporary` flag on the wire. Message text is what operators see, so the
//! phrasing is part of the contract.

use thiserror::Error;

use crate::core::UnknownClass;
use crate::error::Transience;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OpError {
    #[error("no such host {0}")]
    NoSuchHost(String),

    #[error("no such class {0}")]
    NoSuchClass(String),

    #[error("class {0} already exists")]
    ClassExists(String),

    #[error("host {0} already exists")]
    HostExists(String),

    #[error("{host} is already reserved by {by}")]
    AlreadyReserved { host: String, by: String },

    #[error("not enough free hosts to get {wanted}, have {free} free")]
    NotEnoughFree { wanted: u64, free: u64 },

    #[error("user root may not reserve hosts")]
    RootForbidden,

    #[error("user must be a non-empty string")]
    EmptyUser,

    #[error("invalid host name {0}")]
    InvalidHostName(String),

    #[error("invalid class name {0}")]
    InvalidClassName(String),

    #[error("invalid expire value {0}")]
    InvalidExpire(String),

    #[error("invalid numhosts value {0}")]
    InvalidNumhosts(String),

    #[error("cannot delete class ALL")]
    CannotDeleteAll,

    #[error("class {0} is composite; only atomic classes may be used here")]
    CompositeNotAllowed(String),

    #[error("class {0} is composite and cannot be a member")]
    CompositeMember(String),

    #[error("class {0} is a resource class and cannot be a member")]
    ResourceMember(String),

    #[error("class {0} is a resource class; use add_resource")]
    ResourceClassNotAllowed(String),

    #[error("class {0} is not a resource class")]
    NotAResourceClass(String),

    #[error("{0} is a resource; use the resource commands")]
    IsResource(String),

    #[error("{0} is not a resource")]
    NotAResource(String),

    #[error("host {0} cannot mix resource and non-resource classes")]
    FlavorMismatch(String),

    #[error("host {0} may belong to at most one resource class")]
    TooManyResourceClasses(String),

    #[error("Wrong key provided to release host {host}: expected '{expected}'")]
    WrongKey { host: String, expected: String },

    #[error("{host} not reserved by {user}")]
    NotReservedBy { host: String, user: String },

    #[error("{0} is not reserved")]
    NotReserved(String),

    #[error("{host} already has next user {next}")]
    NextUserTaken { host: String, next: String },

    #[error("{user} already holds {host}")]
    AlreadyCurrentUser { host: String, user: String },

    #[error("{0} has no next user")]
    NoNextUser(String),

    #[error("{0} is not dead")]
    NotDead(String),

    #[error("invalid hostRegexp: {0}")]
    BadHostRegexp(String),

    #[error("unknown command {0}")]
    UnknownCommand(String),

    #[error("missing required parameter {key} for {cmd}")]
    MissingParam { cmd: String, key: String },

    #[error("unknown parameter {key} for {cmd}")]
    UnknownParam { cmd: String, key: String },

    #[error("bad parameter {key}: {reason}")]
    BadParam { key: String, reason: String },
}

impl OpError {
    /// Whether retrying may succeed. Contention is retryable; everything
    /// else needs different inputs or state.
    pub fn transience(&self) -> Transience {
        match self {
            OpError::AlreadyReserved { .. } | OpError::NotEnoughFree { .. } => {
                Transience::Retryable
            }
            _ => Transience::Permanent,
        }
    }
}

impl From<UnknownClass> for OpError {
    fn from(e: UnknownClass) -> Self {
        OpError::NoSuchClass(e.0)
    }
}
