use std::sync::Mutex;

use crate::diff::InstanceDiff;
use crate::provider;
use crate::state::InstanceState;

use super::{Hook, HookAction, HookResult};

/// Arguments observed by a [`MockHook`], one list per callback, in call
/// order. Provider errors are recorded by their display string.
#[derive(Debug, Clone, Default)]
pub struct RecordedCalls {
    pub pre_diff: Vec<(String, Option<InstanceState>)>,
    pub post_diff: Vec<(String, InstanceDiff)>,
    pub pre_apply: Vec<(String, Option<InstanceState>, InstanceDiff)>,
    pub post_apply: Vec<(String, Option<InstanceState>, Option<String>)>,
    pub pre_provision_resource: Vec<(String, InstanceState)>,
    pub post_provision_resource: Vec<(String, InstanceState)>,
    pub pre_provision: Vec<(String, String)>,
    pub post_provision: Vec<(String, String)>,
    pub pre_refresh: Vec<(String, InstanceState)>,
    pub post_refresh: Vec<(String, Option<InstanceState>)>,
}

/// A [`Hook`] for tests that records every call's arguments
#[derive(Debug, Default)]
pub struct MockHook {
    calls: Mutex<RecordedCalls>,
    action: HookAction,
}

impl MockHook {
    /// A recording hook answering [`HookAction::Continue`] on every call
    pub fn new() -> Self {
        Self::default()
    }

    /// A recording hook answering the given action on every call
    pub fn returning(action: HookAction) -> Self {
        MockHook {
            calls: Mutex::default(),
            action,
        }
    }

    /// A snapshot of everything recorded so far
    pub fn recorded(&self) -> RecordedCalls {
        self.calls.lock().expect("mock hook lock poisoned").clone()
    }

    fn record<F: FnOnce(&mut RecordedCalls)>(&self, record: F) -> HookResult {
        record(&mut self.calls.lock().expect("mock hook lock poisoned"));
        Ok(self.action)
    }
}

impl Hook for MockHook {
    fn pre_diff(&self, address: &str, state: Option<&InstanceState>) -> HookResult {
        self.record(|c| c.pre_diff.push((address.to_string(), state.cloned())))
    }

    fn post_diff(&self, address: &str, diff: &InstanceDiff) -> HookResult {
        self.record(|c| c.post_diff.push((address.to_string(), diff.clone())))
    }

    fn pre_apply(
        &self,
        address: &str,
        state: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> HookResult {
        self.record(|c| {
            c.pre_apply
                .push((address.to_string(), state.cloned(), diff.clone()))
        })
    }

    fn post_apply(
        &self,
        address: &str,
        state: Option<&InstanceState>,
        error: Option<&provider::Error>,
    ) -> HookResult {
        self.record(|c| {
            c.post_apply.push((
                address.to_string(),
                state.cloned(),
                error.map(|e| e.to_string()),
            ))
        })
    }

    fn pre_provision_resource(&self, address: &str, state: &InstanceState) -> HookResult {
        self.record(|c| {
            c.pre_provision_resource
                .push((address.to_string(), state.clone()))
        })
    }

    fn post_provision_resource(&self, address: &str, state: &InstanceState) -> HookResult {
        self.record(|c| {
            c.post_provision_resource
                .push((address.to_string(), state.clone()))
        })
    }

    fn pre_provision(&self, address: &str, provisioner: &str) -> HookResult {
        self.record(|c| {
            c.pre_provision
                .push((address.to_string(), provisioner.to_string()))
        })
    }

    fn post_provision(&self, address: &str, provisioner: &str) -> HookResult {
        self.record(|c| {
            c.post_provision
                .push((address.to_string(), provisioner.to_string()))
        })
    }

    fn pre_refresh(&self, address: &str, state: &InstanceState) -> HookResult {
        self.record(|c| c.pre_refresh.push((address.to_string(), state.clone())))
    }

    fn post_refresh(&self, address: &str, state: Option<&InstanceState>) -> HookResult {
        self.record(|c| c.post_refresh.push((address.to_string(), state.cloned())))
    }
}
