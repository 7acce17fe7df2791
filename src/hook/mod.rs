//! Lifecycle instrumentation around diff, apply, provision and refresh
//!
//! Hooks are the engine's observation and cancellation channel: every state
//! transition of a resource is bracketed by a pre/post callback pair, and
//! any callback may answer [`HookAction::Halt`] to stop the operation it
//! brackets. Multiple hooks may be registered; they are invoked in
//! registration order and the first `Halt` wins.
//!
//! All callbacks have default no-op bodies, so an implementation only
//! overrides the ones it cares about. Hooks receive shared references and
//! must not (and cannot) mutate the state or diff they are shown.
//!
//! A hook may also return an error. Hook errors are logged and otherwise
//! ignored: a hook cannot force an abort through its error value, only
//! through the halt action. This is intentional, documented behavior.

use tracing::warn;

use crate::diff::InstanceDiff;
use crate::provider;
use crate::state::InstanceState;

mod mock;
mod stop;

pub use mock::MockHook;
pub use stop::StopHook;

/// Answer returned by every hook callback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookAction {
    /// Proceed with the operation
    #[default]
    Continue,

    /// Cancel the operation the callback brackets and stop invoking
    /// further hooks for it
    Halt,
}

impl HookAction {
    pub fn is_halt(&self) -> bool {
        matches!(self, HookAction::Halt)
    }
}

pub type HookResult = anyhow::Result<HookAction>;

/// Capability set of paired callbacks around the engine's state transitions
///
/// `address` identifies the resource the operation acts on. Provision-step
/// callbacks are identified by provisioner name instead of state.
#[allow(unused_variables)]
pub trait Hook: Send + Sync {
    /// Called before a resource is diffed
    fn pre_diff(&self, address: &str, state: Option<&InstanceState>) -> HookResult {
        Ok(HookAction::Continue)
    }

    /// Called after a resource is diffed
    fn post_diff(&self, address: &str, diff: &InstanceDiff) -> HookResult {
        Ok(HookAction::Continue)
    }

    /// Called before a diff is applied to a resource
    fn pre_apply(
        &self,
        address: &str,
        state: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> HookResult {
        Ok(HookAction::Continue)
    }

    /// Called after a diff is applied. `error` carries the provider's
    /// failure, if any; the returned action is informational only and does
    /// not re-attempt the call.
    fn post_apply(
        &self,
        address: &str,
        state: Option<&InstanceState>,
        error: Option<&provider::Error>,
    ) -> HookResult {
        Ok(HookAction::Continue)
    }

    /// Called before any provisioner runs on a newly created resource
    fn pre_provision_resource(&self, address: &str, state: &InstanceState) -> HookResult {
        Ok(HookAction::Continue)
    }

    /// Called after all provisioners ran on a resource
    fn post_provision_resource(&self, address: &str, state: &InstanceState) -> HookResult {
        Ok(HookAction::Continue)
    }

    /// Called before a single provisioner runs
    fn pre_provision(&self, address: &str, provisioner: &str) -> HookResult {
        Ok(HookAction::Continue)
    }

    /// Called after a single provisioner ran
    fn post_provision(&self, address: &str, provisioner: &str) -> HookResult {
        Ok(HookAction::Continue)
    }

    /// Called before a resource's state is refreshed
    fn pre_refresh(&self, address: &str, state: &InstanceState) -> HookResult {
        Ok(HookAction::Continue)
    }

    /// Called after a resource's state is refreshed
    fn post_refresh(&self, address: &str, state: Option<&InstanceState>) -> HookResult {
        Ok(HookAction::Continue)
    }
}

/// A [`Hook`] that does nothing
///
/// Useful as an explicit placeholder; concrete hook types normally just
/// rely on the trait's default bodies instead.
pub struct NilHook;

impl Hook for NilHook {}

/// Invoke one callback on every registered hook in order
///
/// Stops at the first [`HookAction::Halt`]. Hook errors are logged at
/// `warn` and treated as `Continue`.
pub(crate) fn dispatch<F>(hooks: &[std::sync::Arc<dyn Hook>], mut call: F) -> HookAction
where
    F: FnMut(&dyn Hook) -> HookResult,
{
    for hook in hooks {
        match call(hook.as_ref()) {
            Ok(HookAction::Continue) => {}
            Ok(HookAction::Halt) => return HookAction::Halt,
            Err(err) => {
                warn!("hook returned an error (ignored): {err:#}");
            }
        }
    }
    HookAction::Continue
}
