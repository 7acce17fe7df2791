//! Diff-and-apply orchestration for externally managed resources
//!
//! This crate reconciles a desired configuration against the real world
//! through an opaque [`Provider`]: for each resource it computes an
//! [`InstanceDiff`], validates it against the plan, applies it, and records
//! the outcome in a durable [`State`]. The [`Engine`] drives the lifecycle,
//! [`Hook`]s observe (and may halt) every transition, and a [`Persistor`]
//! stores the resulting state with backup-then-atomic-write semantics.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use converge::{Engine, Persistor, Plan, ResourcePlan, State};
//! # use converge::provider::mock::MockProvider;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! # let provider = Arc::new(MockProvider::new());
//! let engine = Engine::new(provider);
//! let persistor = Persistor::new("converge.state");
//!
//! let state = persistor.load()?.unwrap_or_else(State::new);
//! let plan = Plan::new().resource(ResourcePlan::new("test_instance.foo", "test_instance"));
//!
//! let mut report = engine.apply(state, plan).await;
//! persistor.save(&mut report.state)?;
//! # Ok(())
//! # }
//! ```

pub mod diff;
pub mod engine;
pub mod errors;
pub mod hook;
pub mod persist;
pub mod provider;
pub mod state;

pub use diff::{AttributeDiff, Diff, InstanceDiff};
pub use engine::{Engine, Plan, ResourcePhase, ResourcePlan, RunReport, RunStatus};
pub use errors::{AggregateError, DriftError, ResourceError, ResourceErrorKind};
pub use hook::{Hook, HookAction, HookResult, StopHook};
pub use persist::Persistor;
pub use provider::{Provider, Provisioner, ResourceInfo};
pub use state::{InstanceState, ModuleState, ResourceState, State};
