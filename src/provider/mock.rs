//! A scriptable [`Provider`] implementation for tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::diff::InstanceDiff;
use crate::state::InstanceState;

use super::{ApplyError, Error, Provider, Provisioner, ResourceInfo};

type DiffFn = Box<
    dyn Fn(&ResourceInfo, Option<&InstanceState>, &Value) -> Result<Option<InstanceDiff>, Error>
        + Send
        + Sync,
>;
type ApplyFn = Box<
    dyn Fn(
            &ResourceInfo,
            Option<&InstanceState>,
            &InstanceDiff,
        ) -> Result<Option<InstanceState>, ApplyError>
        + Send
        + Sync,
>;
type RefreshFn =
    Box<dyn Fn(&ResourceInfo, &InstanceState) -> Result<Option<InstanceState>, Error> + Send + Sync>;

/// A [`Provider`] scripted with closures, recording every call
///
/// Unscripted calls answer "no change": `diff` returns no diff, `apply`
/// echoes the prior state back and `refresh` reports the state unchanged.
#[derive(Default)]
pub struct MockProvider {
    diff_fn: Option<DiffFn>,
    apply_fn: Option<ApplyFn>,
    refresh_fn: Option<RefreshFn>,

    diff_calls: AtomicUsize,
    apply_calls: AtomicUsize,
    refresh_calls: AtomicUsize,

    // prior state most recently passed to each call
    diff_state: Mutex<Option<InstanceState>>,
    apply_state: Mutex<Option<InstanceState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_diff<F>(mut self, f: F) -> Self
    where
        F: Fn(&ResourceInfo, Option<&InstanceState>, &Value) -> Result<Option<InstanceDiff>, Error>
            + Send
            + Sync
            + 'static,
    {
        self.diff_fn = Some(Box::new(f));
        self
    }

    pub fn on_apply<F>(mut self, f: F) -> Self
    where
        F: Fn(
                &ResourceInfo,
                Option<&InstanceState>,
                &InstanceDiff,
            ) -> Result<Option<InstanceState>, ApplyError>
            + Send
            + Sync
            + 'static,
    {
        self.apply_fn = Some(Box::new(f));
        self
    }

    pub fn on_refresh<F>(mut self, f: F) -> Self
    where
        F: Fn(&ResourceInfo, &InstanceState) -> Result<Option<InstanceState>, Error>
            + Send
            + Sync
            + 'static,
    {
        self.refresh_fn = Some(Box::new(f));
        self
    }

    /// Script `diff` to always return the given diff
    pub fn diff_return(self, diff: InstanceDiff) -> Self {
        self.on_diff(move |_, _, _| Ok(Some(diff.clone())))
    }

    /// Script `apply` to always return the given state
    pub fn apply_return(self, state: Option<InstanceState>) -> Self {
        self.on_apply(move |_, _, _| Ok(state.clone()))
    }

    pub fn diff_calls(&self) -> usize {
        self.diff_calls.load(Ordering::SeqCst)
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Prior state passed to the most recent `diff` call
    pub fn last_diff_state(&self) -> Option<InstanceState> {
        self.diff_state.lock().expect("mock lock poisoned").clone()
    }

    /// Prior state passed to the most recent `apply` call
    pub fn last_apply_state(&self) -> Option<InstanceState> {
        self.apply_state.lock().expect("mock lock poisoned").clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn diff(
        &self,
        info: &ResourceInfo,
        prior: Option<&InstanceState>,
        config: &Value,
    ) -> Result<Option<InstanceDiff>, Error> {
        self.diff_calls.fetch_add(1, Ordering::SeqCst);
        *self.diff_state.lock().expect("mock lock poisoned") = prior.cloned();

        match &self.diff_fn {
            Some(f) => f(info, prior, config),
            None => Ok(None),
        }
    }

    async fn apply(
        &self,
        info: &ResourceInfo,
        prior: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> Result<Option<InstanceState>, ApplyError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        *self.apply_state.lock().expect("mock lock poisoned") = prior.cloned();

        match &self.apply_fn {
            Some(f) => f(info, prior, diff),
            None => Ok(prior.cloned()),
        }
    }

    async fn refresh(
        &self,
        info: &ResourceInfo,
        prior: &InstanceState,
    ) -> Result<Option<InstanceState>, Error> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        match &self.refresh_fn {
            Some(f) => f(info, prior),
            None => Ok(Some(prior.clone())),
        }
    }
}

type ProvisionFn =
    Box<dyn Fn(&ResourceInfo, &InstanceState) -> Result<(), Error> + Send + Sync>;

/// A scriptable [`Provisioner`] counterpart to [`MockProvider`]
#[derive(Default)]
pub struct MockProvisioner {
    provision_fn: Option<ProvisionFn>,
    calls: AtomicUsize,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_provision<F>(mut self, f: F) -> Self
    where
        F: Fn(&ResourceInfo, &InstanceState) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.provision_fn = Some(Box::new(f));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(&self, info: &ResourceInfo, state: &InstanceState) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match &self.provision_fn {
            Some(f) => f(info, state),
            None => Ok(()),
        }
    }
}
