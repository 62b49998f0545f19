//! Shared primitive identifiers, partitions, and operation kinds.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type TimestampMs = u64;
/// Operation priority; higher values are processed first.
pub type Priority = i32;
/// Number of failed delivery attempts for one operation.
pub type RetryCount = u32;

/// Client-generated, globally unique operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub uuid::Uuid);

impl OpId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of a store partition (one per data domain).
///
/// Partitions are normally declared as constants with [`Partition::named`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Partition(Cow<'static, str>);

impl Partition {
    /// Const constructor for compile-time partition names.
    pub const fn named(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Partition name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Partition {
    fn from(value: String) -> Self {
        Self(Cow::Owned(value))
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record identity: either a client placeholder or the server-issued key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum Identity {
    /// Placeholder assigned to records created while offline.
    Temporary(String),
    /// Key issued by the remote system.
    Canonical(String),
}

impl Identity {
    /// Allocates a new temporary identity.
    pub fn temporary() -> Self {
        Self::Temporary(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    /// Wraps a server-issued key.
    pub fn canonical(key: impl Into<String>) -> Self {
        Self::Canonical(key.into())
    }

    /// The raw key, regardless of kind.
    pub fn key(&self) -> &str {
        match self {
            Self::Temporary(key) | Self::Canonical(key) => key,
        }
    }

    /// True for client placeholders.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Kind of remote effect an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Create a new remote resource.
    Create,
    /// Replace an existing remote resource.
    Update,
    /// Remove a remote resource.
    Delete,
}

impl OpKind {
    /// Priority assigned by the write path. Deletes go first so removed
    /// records do not linger remotely behind queued edits.
    pub fn default_priority(self) -> Priority {
        match self {
            Self::Create => 1,
            Self::Update => 2,
            Self::Delete => 3,
        }
    }

    /// Transport verb used to deliver this kind.
    pub fn verb(self) -> Verb {
        match self {
            Self::Create => Verb::Create,
            Self::Update => Verb::Replace,
            Self::Delete => Verb::Remove,
        }
    }
}

/// Transport-level verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    /// Create a resource under a collection endpoint.
    Create,
    /// Replace the resource at an item endpoint.
    Replace,
    /// Remove the resource at an item endpoint.
    Remove,
}
