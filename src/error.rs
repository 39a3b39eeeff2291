//! Structured errors surfaced at every public interface.
//!
//! Two disclosure-safety rules are invariants enforced by callers of this
//! module (see [`crate::store`] and [`crate::server`]):
//!
//! - a caller with *no* right on a path must receive [`Kind::Private`], never
//!   [`Kind::Permission`] or a detailed [`Kind::NotExist`];
//! - a caller with *some* right but not the one requested receives
//!   [`Kind::Permission`].

use std::fmt;

use crate::path::Name;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enumerated error kinds, matching the wire-level error codes of the
/// surrounding system.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    NotExist,
    Exist,
    NotDir,
    IsDir,
    NotEmpty,
    Permission,
    Private,
    Invalid,
    SequenceMismatch,
    Internal,
    Io,
    NotSupported,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::NotExist => "not-exist",
            Kind::Exist => "exist",
            Kind::NotDir => "not-dir",
            Kind::IsDir => "is-dir",
            Kind::NotEmpty => "not-empty",
            Kind::Permission => "permission",
            Kind::Private => "private",
            Kind::Invalid => "invalid",
            Kind::SequenceMismatch => "sequence-mismatch",
            Kind::Internal => "internal",
            Kind::Io => "io",
            Kind::NotSupported => "not-supported",
        };
        f.write_str(s)
    }
}

/// A structured error: the operation that failed, the path and user involved
/// (when known), the [`Kind`], and an optional wrapped cause.
#[derive(Debug, thiserror::Error)]
pub struct Error {
    pub op: &'static str,
    pub name: Option<Name>,
    pub user: Option<String>,
    pub kind: Kind,
    pub detail: Option<String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.kind)?;
        if let Some(name) = &self.name {
            write!(f, " ({name})")?;
        }
        if let Some(user) = &self.user {
            write!(f, " [{user}]")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl Error {
    /// Build a bare error with no path/user/cause attached.
    pub fn new(op: &'static str, kind: Kind) -> Self {
        Self { op, name: None, user: None, kind, detail: None, source: None }
    }

    pub fn with_name(mut self, name: Name) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }
}

/// Shorthand constructors used pervasively across the core modules.
pub fn private(op: &'static str, name: Name) -> Error {
    Error::new(op, Kind::Private).with_name(name)
}

pub fn permission(op: &'static str, name: Name) -> Error {
    Error::new(op, Kind::Permission).with_name(name)
}

pub fn not_exist(op: &'static str, name: Name) -> Error {
    Error::new(op, Kind::NotExist).with_name(name)
}

pub fn invalid(op: &'static str, msg: impl Into<String>) -> Error {
    Error::new(op, Kind::Invalid).with_detail(msg)
}
