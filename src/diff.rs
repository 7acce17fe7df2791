//! The diff model: per-attribute, per-instance and whole-run change sets
//!
//! A [`Diff`] is the output of a planning pass: for every resource address it
//! records an [`InstanceDiff`] describing what must change to bring the real
//! resource in line with the desired configuration. Diffs are pure values
//! with no I/O of their own; they are produced by providers and consumed by
//! the apply engine.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel rendered in place of a value that is only known after apply
pub const COMPUTED: &str = "<computed>";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to encode diff: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode diff: {0}")]
    Decode(#[source] serde_json::Error),
}

/// The transition of a single resource attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDiff {
    /// Value currently recorded for the attribute
    #[serde(default)]
    pub old: String,

    /// Value the attribute should have after apply
    #[serde(default)]
    pub new: String,

    /// The new value is not known until the provider applies the change.
    /// A computed attribute renders as [`COMPUTED`], never as the literal
    /// (possibly empty) `new` string.
    #[serde(default)]
    pub new_computed: bool,

    /// Changing this attribute cannot be done in place: the resource must
    /// be destroyed and recreated
    #[serde(default)]
    pub requires_new: bool,

    /// The attribute is removed by this change
    #[serde(default)]
    pub new_removed: bool,
}

impl AttributeDiff {
    /// An attribute change with no visible or apply-time-resolved effect
    fn is_noop(&self) -> bool {
        self.old == self.new && !self.new_computed
    }
}

/// The set of attribute changes for one resource instance
///
/// The [`Default`] value means "no change" and every query on it is safe,
/// mirroring how an absent diff is treated by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDiff {
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeDiff>,

    /// The instance must be destroyed
    #[serde(default)]
    pub destroy: bool,
}

impl InstanceDiff {
    /// A diff that only destroys the instance
    pub fn for_destroy() -> Self {
        InstanceDiff {
            destroy: true,
            ..Default::default()
        }
    }

    /// Returns `true` if applying this diff would change nothing
    ///
    /// A diff is empty when it does not destroy the instance and every
    /// attribute entry is a no-op.
    pub fn is_empty(&self) -> bool {
        !self.destroy && self.attributes.values().all(AttributeDiff::is_noop)
    }

    /// Returns `true` if any attribute change forces the instance to be
    /// destroyed and recreated instead of updated in place
    pub fn requires_new(&self) -> bool {
        self.attributes.values().any(|attr| attr.requires_new)
    }

    /// Structural equality between two diffs, ignoring concrete values
    ///
    /// Two diffs are the same when they share the destroy flag, the set of
    /// attribute keys, and the `requires_new` flag of every shared key. The
    /// engine uses this to detect drift: a diff recomputed at apply time
    /// must still have the shape of the diff computed at plan time before
    /// any destructive operation proceeds.
    pub fn same(&self, other: &InstanceDiff) -> bool {
        if self.destroy != other.destroy {
            return false;
        }

        if self.attributes.len() != other.attributes.len() {
            return false;
        }

        self.attributes.iter().all(|(name, attr)| {
            other
                .attributes
                .get(name)
                .is_some_and(|o| o.requires_new == attr.requires_new)
        })
    }
}

/// The change set for a whole reconciliation pass, keyed by resource address
///
/// Rendering via [`Display`] is deterministic: resource addresses and
/// attribute names are in lexicographic order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    #[serde(default)]
    pub resources: BTreeMap<String, InstanceDiff>,
}

impl Diff {
    /// Returns `true` if every contained instance diff is empty
    pub fn is_empty(&self) -> bool {
        self.resources.values().all(InstanceDiff::is_empty)
    }

    /// Encode the diff for persistence or transport
    ///
    /// The encoding is lossless: [`Diff::read`] on the written bytes yields
    /// a value equal to `self`.
    pub fn write<W: io::Write>(&self, writer: W) -> Result<(), Error> {
        serde_json::to_writer(writer, self).map_err(Error::Encode)
    }

    /// Decode a diff previously written with [`Diff::write`]
    pub fn read<R: io::Read>(reader: R) -> Result<Diff, Error> {
        serde_json::from_reader(reader).map_err(Error::Decode)
    }
}

/// One aligned line per attribute, in lexicographic order
impl Display for InstanceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .attributes
            .keys()
            .map(String::len)
            .max()
            .unwrap_or_default();
        for (name, attr) in &self.attributes {
            let new = if attr.new_computed {
                COMPUTED
            } else {
                attr.new.as_str()
            };

            write!(
                f,
                "  {:<w$} {:?} => {:?}",
                format!("{name}:"),
                attr.old,
                new,
                w = width + 1
            )?;
            if attr.requires_new {
                write!(f, " (forces new resource)")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (address, diff) in &self.resources {
            let label = if diff.destroy {
                "DESTROY"
            } else if diff.requires_new() {
                "CREATE"
            } else {
                "UPDATE"
            };
            writeln!(f, "{label}: {address}")?;
            write!(f, "{diff}")?;
        }
        Ok(())
    }
}
