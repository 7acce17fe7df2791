//! The durable record of previously provisioned resources
//!
//! A [`State`] is loaded at the start of a run, mutated in place by the
//! apply engine one resource entry at a time, and persisted once at the end
//! of the run (or on halt) by [`crate::persist`]. The `serial` field
//! increments on every persisted change so stale writers can be detected.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version written into newly created state records
pub const STATE_VERSION: u64 = 1;

/// Path of the root module within the module tree
pub const ROOT_MODULE: &[&str] = &["root"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to encode state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode state: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Process-lifetime-only data attached to an instance
///
/// Ephemeral data is never serialized: a persisted or backed-up copy of the
/// state always carries an empty ephemeral payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EphemeralState {
    /// Connection parameters used while provisioning the instance
    pub conn_info: BTreeMap<String, String>,
}

/// The recorded state of a single resource instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Provider-assigned identifier; empty for an instance that does not
    /// exist yet
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(skip)]
    pub ephemeral: EphemeralState,
}

impl InstanceState {
    pub fn new(id: impl Into<String>) -> Self {
        InstanceState {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Returns `true` if the instance exists in the real world
    pub fn exists(&self) -> bool {
        !self.id.is_empty()
    }
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ID = {}", self.id)?;
        for (key, value) in &self.attributes {
            writeln!(f, "{key} = {value}")?;
        }
        Ok(())
    }
}

/// The recorded state of one resource address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    #[serde(rename = "type", default)]
    pub resource_type: String,

    /// Addresses this resource depends on, kept so a later destroy can be
    /// ordered even without the original configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    pub primary: InstanceState,

    /// Old instances parked during create-before-destroy replacement.
    /// Reconciled back to empty once the replacement is confirmed and the
    /// old instance destroyed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<InstanceState>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
}

/// Resources recorded for one module in the module tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleState {
    pub path: Vec<String>,

    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
}

impl ModuleState {
    pub fn new(path: Vec<String>) -> Self {
        ModuleState {
            path,
            resources: BTreeMap::new(),
        }
    }
}

/// The full record of reality as of the last confirmed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub version: u64,

    /// Incremented on every persisted change
    #[serde(default)]
    pub serial: u64,

    #[serde(default)]
    pub modules: Vec<ModuleState>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// An empty state containing only the root module
    pub fn new() -> Self {
        State {
            version: STATE_VERSION,
            serial: 0,
            modules: vec![ModuleState::new(
                ROOT_MODULE.iter().map(|s| s.to_string()).collect(),
            )],
        }
    }

    pub fn root_module(&self) -> Option<&ModuleState> {
        self.module(ROOT_MODULE)
    }

    pub fn root_module_mut(&mut self) -> &mut ModuleState {
        self.module_mut(ROOT_MODULE)
    }

    pub fn module<S: AsRef<str>>(&self, path: &[S]) -> Option<&ModuleState> {
        self.modules.iter().find(|m| {
            m.path.len() == path.len()
                && m.path.iter().zip(path).all(|(a, b)| a.as_str() == b.as_ref())
        })
    }

    /// Look up a module by path, creating it if missing
    pub fn module_mut<S: AsRef<str>>(&mut self, path: &[S]) -> &mut ModuleState {
        if let Some(index) = self.modules.iter().position(|m| {
            m.path.len() == path.len()
                && m.path.iter().zip(path).all(|(a, b)| a.as_str() == b.as_ref())
        }) {
            return &mut self.modules[index];
        }

        self.modules.push(ModuleState::new(
            path.iter().map(|s| s.as_ref().to_string()).collect(),
        ));
        self.modules.last_mut().expect("module was just inserted")
    }

    /// Decode a state previously written with [`State::write`]
    pub fn read<R: io::Read>(reader: R) -> Result<State, Error> {
        serde_json::from_reader(reader).map_err(Error::Decode)
    }

    /// Encode the state for persistence
    pub fn write<W: io::Write>(&self, writer: W) -> Result<(), Error> {
        serde_json::to_writer_pretty(writer, self).map_err(Error::Encode)
    }
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for module in &self.modules {
            for (address, resource) in &module.resources {
                writeln!(f, "{address}:")?;
                write!(f, "{}", indent(&resource.primary.to_string()))?;
                for deposed in &resource.deposed {
                    writeln!(f, "  (deposed)")?;
                    write!(f, "{}", indent(&deposed.to_string()))?;
                }
            }
        }
        Ok(())
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("  {line}\n"))
        .collect::<String>()
}
