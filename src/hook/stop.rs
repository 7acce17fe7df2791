use std::sync::atomic::{AtomicBool, Ordering};

use crate::diff::InstanceDiff;
use crate::provider;
use crate::state::InstanceState;

use super::{Hook, HookAction, HookResult};

/// A [`Hook`] that turns the hook dispatch path into a cancellation channel
///
/// The engine installs one of these ahead of any user hook. An external
/// interrupt calls [`StopHook::stop`] and every subsequent callback, at any
/// checkpoint of any in-flight resource, answers [`HookAction::Halt`]
/// without threading a cancellation token through each call explicitly.
///
/// The flag is a single atomic word: checks are lock-free and never stall
/// the per-resource loop.
#[derive(Debug, Default)]
pub struct StopHook {
    stop: AtomicBool,
}

impl StopHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal every in-flight and future callback to halt
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Clear the flag for a new run
    ///
    /// Not synchronized against a concurrent [`StopHook::stop`]: callers
    /// must hold whatever external lock serializes run lifecycles, or a
    /// reset racing a stop from a prior run could swallow an intended
    /// cancellation.
    pub fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn check(&self) -> HookResult {
        if self.is_stopped() {
            return Ok(HookAction::Halt);
        }

        Ok(HookAction::Continue)
    }
}

impl Hook for StopHook {
    fn pre_diff(&self, _: &str, _: Option<&InstanceState>) -> HookResult {
        self.check()
    }

    fn post_diff(&self, _: &str, _: &InstanceDiff) -> HookResult {
        self.check()
    }

    fn pre_apply(&self, _: &str, _: Option<&InstanceState>, _: &InstanceDiff) -> HookResult {
        self.check()
    }

    fn post_apply(
        &self,
        _: &str,
        _: Option<&InstanceState>,
        _: Option<&provider::Error>,
    ) -> HookResult {
        self.check()
    }

    fn pre_provision_resource(&self, _: &str, _: &InstanceState) -> HookResult {
        self.check()
    }

    fn post_provision_resource(&self, _: &str, _: &InstanceState) -> HookResult {
        self.check()
    }

    fn pre_provision(&self, _: &str, _: &str) -> HookResult {
        self.check()
    }

    fn post_provision(&self, _: &str, _: &str) -> HookResult {
        self.check()
    }

    fn pre_refresh(&self, _: &str, _: &InstanceState) -> HookResult {
        self.check()
    }

    fn post_refresh(&self, _: &str, _: Option<&InstanceState>) -> HookResult {
        self.check()
    }
}
