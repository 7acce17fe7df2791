//! Errors shared across the apply engine
//!
//! Cancellation is deliberately absent from this module: a halted run is a
//! first-class outcome ([`crate::engine::RunStatus::Interrupted`]), not an
//! error.

use std::fmt::{self, Display};
use std::ops::Deref;

use thiserror::Error;

use crate::diff::InstanceDiff;
use crate::provider;

#[derive(Debug, Error)]
#[error(
    "diff for {address} no longer matches the plan; \
     the resource changed between plan and apply\nplanned:\n{planned}actual:\n{actual}"
)]
/// A diff recomputed at apply time is structurally different from the one
/// supplied by the plan. The resource's apply is aborted and its prior
/// state left untouched.
pub struct DriftError {
    pub address: String,
    pub planned: InstanceDiff,
    pub actual: InstanceDiff,
}

#[derive(Debug, Error)]
pub enum ResourceErrorKind {
    #[error(transparent)]
    Drift(#[from] DriftError),

    #[error("provider diff failed: {0}")]
    Diff(#[source] provider::Error),

    #[error("provider apply failed: {0}")]
    Apply(#[source] provider::Error),

    #[error("provisioner {name} failed: {source}")]
    Provision {
        name: String,
        #[source]
        source: provider::Error,
    },

    #[error("provider refresh failed: {0}")]
    Refresh(#[source] provider::Error),
}

#[derive(Debug, Error)]
#[error("{address}: {kind}")]
/// An error associated with a single resource address.
///
/// Per-resource errors are collected, never dropped, and do not stop the
/// processing of unrelated resources.
pub struct ResourceError {
    pub address: String,
    pub kind: ResourceErrorKind,
}

impl ResourceError {
    pub(crate) fn new(address: impl Into<String>, kind: ResourceErrorKind) -> Self {
        ResourceError {
            address: address.into(),
            kind,
        }
    }
}

/// The failures of all resources that went wrong within the same run,
/// one entry per resource
#[derive(Error, Debug)]
pub struct AggregateError<E>(#[from] pub Vec<E>);

impl<E> Default for AggregateError<E> {
    fn default() -> Self {
        AggregateError(Vec::new())
    }
}

impl<E> Display for AggregateError<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} resource(s) failed:", self.0.len())?;
        for e in &self.0 {
            writeln!(f, "- {e}")?;
        }
        Ok(())
    }
}

impl<E> Deref for AggregateError<E> {
    type Target = Vec<E>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_aggregate_error_lists_failures_by_address() {
        let errors = AggregateError(vec![
            ResourceError::new("test_instance.bar", ResourceErrorKind::Apply("boom".into())),
            ResourceError::new("test_instance.foo", ResourceErrorKind::Refresh("gone".into())),
        ]);

        let expected = "\
2 resource(s) failed:
- test_instance.bar: provider apply failed: boom
- test_instance.foo: provider refresh failed: gone
";
        assert_eq!(errors.to_string(), expected);
        assert_eq!(errors.len(), 2);
    }
}
