//! The provider boundary: opaque remote implementations of diff and apply
//!
//! Providers are external collaborators. The engine treats their calls as
//! blocking I/O with no retry of its own; retries, if any, are the
//! provider's responsibility.

use std::fmt;
use std::ops::Deref;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::diff::InstanceDiff;
use crate::state::InstanceState;

pub mod mock;

#[derive(Debug, Error)]
#[error(transparent)]
/// An error reported by a provider or provisioner call
pub struct Error(Box<dyn std::error::Error + Send + Sync>);

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self(Box::new(err))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Self(msg.into())
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Self(msg.into())
    }
}

impl Deref for Error {
    type Target = Box<dyn std::error::Error + Send + Sync>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Error)]
#[error("{source}")]
/// Failure of a provider apply call
///
/// The provider may have partially created or modified the real resource
/// before failing. Whatever state it can still report travels with the
/// error so the engine records it instead of orphaning the resource;
/// `None` means the resource no longer exists.
pub struct ApplyError {
    pub partial: Option<InstanceState>,
    #[source]
    pub source: Error,
}

impl ApplyError {
    pub fn new(source: impl Into<Error>) -> Self {
        ApplyError {
            partial: None,
            source: source.into(),
        }
    }

    /// Attach the state the resource was left in despite the failure
    pub fn with_partial(self, state: InstanceState) -> Self {
        ApplyError {
            partial: Some(state),
            ..self
        }
    }
}

/// Identifies the resource a provider call acts on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Stable resource address within its module
    pub address: String,

    pub resource_type: String,

    /// Path of the module holding the resource
    pub module_path: Vec<String>,
}

impl fmt::Display for ResourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Remote implementation of "compute a diff" and "apply a diff"
///
/// `prior` is `None` for a resource with no recorded instance. A returned
/// state of `None` means the resource does not (or no longer) exist.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Compute the change needed to move `prior` to the desired `config`
    async fn diff(
        &self,
        info: &ResourceInfo,
        prior: Option<&InstanceState>,
        config: &Value,
    ) -> Result<Option<InstanceDiff>, Error>;

    /// Apply `diff` to the real resource, returning its resulting state
    async fn apply(
        &self,
        info: &ResourceInfo,
        prior: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> Result<Option<InstanceState>, ApplyError>;

    /// Re-read the real resource's current state
    async fn refresh(
        &self,
        info: &ResourceInfo,
        prior: &InstanceState,
    ) -> Result<Option<InstanceState>, Error>;
}

/// A step run against a newly created resource instance
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, info: &ResourceInfo, state: &InstanceState) -> Result<(), Error>;
}
