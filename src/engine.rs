//! The apply engine: per-resource lifecycle orchestration
//!
//! For every resource in a [`Plan`] the engine walks a fixed lifecycle:
//! pre-diff hook, diff computation (or validation against a precomputed
//! plan), post-diff hook, pre-apply hook, provider apply, post-apply hook,
//! state update. Resources within one batch have no dependency relationship
//! and run concurrently; batches run in the order supplied. Within a single
//! address operations are strictly sequential.
//!
//! Cancellation is cooperative: a [`StopHook`] is installed ahead of any
//! user hook, so the flag is observed at every hook checkpoint and before
//! each batch is scheduled. It never interrupts an in-flight provider call,
//! and a halted run is a clean termination, not an error.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, instrument};

use crate::diff::InstanceDiff;
use crate::errors::{AggregateError, DriftError, ResourceError, ResourceErrorKind};
use crate::hook::{dispatch, Hook, StopHook};
use crate::provider::{Provider, Provisioner, ResourceInfo};
use crate::state::{InstanceState, State, ROOT_MODULE};

/// Everything the engine needs to know to reconcile one resource
#[derive(Debug, Clone)]
pub struct ResourcePlan {
    pub address: String,
    pub resource_type: String,
    pub module_path: Vec<String>,
    pub provider: String,
    pub dependencies: Vec<String>,

    /// Desired configuration handed to the provider's diff call
    pub config: Value,

    /// Diff computed at plan time, if any. The engine revalidates it
    /// against a freshly computed diff before applying.
    pub planned: Option<InstanceDiff>,

    /// Replace by creating the new instance before destroying the old one,
    /// parking the old instance as deposed in between
    pub create_before_destroy: bool,

    /// Names of provisioners to run after the instance is created
    pub provisioners: Vec<String>,
}

impl ResourcePlan {
    pub fn new(address: impl Into<String>, resource_type: impl Into<String>) -> Self {
        ResourcePlan {
            address: address.into(),
            resource_type: resource_type.into(),
            module_path: ROOT_MODULE.iter().map(|s| s.to_string()).collect(),
            provider: String::new(),
            dependencies: Vec::new(),
            config: Value::Null,
            planned: None,
            create_before_destroy: false,
            provisioners: Vec::new(),
        }
    }

    pub fn module_path(self, path: Vec<String>) -> Self {
        ResourcePlan {
            module_path: path,
            ..self
        }
    }

    pub fn provider(self, name: impl Into<String>) -> Self {
        ResourcePlan {
            provider: name.into(),
            ..self
        }
    }

    pub fn depends_on(mut self, address: impl Into<String>) -> Self {
        self.dependencies.push(address.into());
        self
    }

    pub fn config(self, config: Value) -> Self {
        ResourcePlan { config, ..self }
    }

    pub fn planned(self, diff: InstanceDiff) -> Self {
        ResourcePlan {
            planned: Some(diff),
            ..self
        }
    }

    pub fn create_before_destroy(self) -> Self {
        ResourcePlan {
            create_before_destroy: true,
            ..self
        }
    }

    pub fn provisioner(mut self, name: impl Into<String>) -> Self {
        self.provisioners.push(name.into());
        self
    }
}

/// An ordered sequence of batches of independent resources
///
/// Dependency ordering is the caller's responsibility: the engine assumes
/// every resource in a batch is independent of the others, and that a batch
/// only depends on resources from earlier batches.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub batches: Vec<Vec<ResourcePlan>>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch of mutually independent resources
    pub fn batch(mut self, resources: impl IntoIterator<Item = ResourcePlan>) -> Self {
        self.batches.push(resources.into_iter().collect());
        self
    }

    /// Append a single-resource batch
    pub fn resource(self, resource: ResourcePlan) -> Self {
        self.batch([resource])
    }
}

/// Position of a resource in its lifecycle
///
/// Transitions run `Pending` → `Diffing` → `Diffed` → `Applying` and end in
/// one of the three terminal phases. A run report only ever shows `Pending`
/// or a terminal phase; the transient phases are observable through hooks
/// while the run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePhase {
    /// Not scheduled yet (or never scheduled, if a halt stopped the run
    /// before its batch)
    Pending,
    /// The provider is computing the diff
    Diffing,
    /// Diff computed and validated against the plan
    Diffed,
    /// The provider is applying the diff
    Applying,
    /// Applied successfully, or no change was needed
    Applied,
    /// A diff, apply or provision step failed
    Failed,
    /// A hook halted the lifecycle at a checkpoint
    Halted,
}

/// Outcome of a whole run, distinguishable by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every scheduled resource applied cleanly
    Success,
    /// The run was halted by request; a clean, non-error termination
    Interrupted,
    /// At least one resource failed; the resulting state is still valid
    /// and reflects all partial progress
    Failed,
}

/// Result of an apply or refresh run
///
/// The final state is always present and valid, whatever the status: a
/// failed or interrupted run reflects all progress made before the failure
/// or halt.
#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub state: State,
    pub errors: AggregateError<ResourceError>,
    pub phases: BTreeMap<String, ResourcePhase>,
}

impl RunReport {
    pub fn phase(&self, address: &str) -> Option<ResourcePhase> {
        self.phases.get(address).copied()
    }
}

/// Orchestrates diff, apply, provision and refresh against a provider
pub struct Engine {
    provider: Arc<dyn Provider>,
    provisioners: BTreeMap<String, Arc<dyn Provisioner>>,
    hooks: Vec<Arc<dyn Hook>>,
    stop: Arc<StopHook>,
}

impl Engine {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        let stop = Arc::new(StopHook::new());
        Engine {
            provider,
            provisioners: BTreeMap::new(),
            // the stop hook runs ahead of any user hook so cancellation is
            // observed at every checkpoint
            hooks: vec![Arc::clone(&stop) as Arc<dyn Hook>],
            stop,
        }
    }

    /// Register a hook; hooks run in registration order at every call site
    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Register a provisioner under the name resource plans refer to it by
    pub fn provisioner(mut self, name: impl Into<String>, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioners.insert(name.into(), provisioner);
        self
    }

    /// Handle used to request cancellation of a run in progress
    ///
    /// [`StopHook::reset`] on the handle must only be called between runs.
    pub fn stop_handle(&self) -> Arc<StopHook> {
        Arc::clone(&self.stop)
    }

    /// Request cancellation of the run in progress
    ///
    /// Cooperative: in-flight provider calls complete, and every resource
    /// halts at its next checkpoint.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Reconcile the resources in `plan` against `state`
    ///
    /// The engine owns the state exclusively for the duration of the run
    /// and returns it in the report; persistence is the caller's next step
    /// (see [`crate::persist`]).
    #[instrument(name = "apply", skip_all, fields(batches = plan.batches.len()))]
    pub async fn apply(&self, state: State, plan: Plan) -> RunReport {
        let mut errors = Vec::new();
        let mut halted = false;

        let ctx = Arc::new(WorkerCtx {
            provider: Arc::clone(&self.provider),
            provisioners: self.provisioners.clone(),
            hooks: self.hooks.clone(),
            stop: Arc::clone(&self.stop),
            state: RwLock::new(state),
            phases: Mutex::new(
                plan.batches
                    .iter()
                    .flatten()
                    .map(|r| (r.address.clone(), ResourcePhase::Pending))
                    .collect(),
            ),
        });

        for batch in plan.batches {
            // halting stops scheduling of subsequent batches; resources
            // already applied or failed are not rolled back
            if self.stop.is_stopped() {
                halted = true;
                break;
            }

            let mut workers = JoinSet::new();
            for resource in batch {
                let ctx = Arc::clone(&ctx);
                workers.spawn(async move {
                    let address = resource.address.clone();
                    (address, ctx.run(resource).await)
                });
            }

            // phase barrier: the next batch (and, eventually, persistence)
            // only starts once every worker has finished
            while let Some(joined) = workers.join_next().await {
                let (address, (phase, error)) = joined.expect("resource worker panicked");
                ctx.set_phase(&address, phase);
                if let Some(error) = error {
                    errors.push(error);
                }
            }
        }

        if self.stop.is_stopped() {
            halted = true;
        }

        let ctx = Arc::try_unwrap(ctx)
            .ok()
            .expect("a resource worker outlived the run");
        let state = ctx.state.into_inner();
        let phases = ctx
            .phases
            .into_inner()
            .expect("phase map lock poisoned");

        let status = run_status(&errors, halted, &phases);
        RunReport {
            status,
            state,
            errors: AggregateError(errors),
            phases,
        }
    }

    /// Re-read the recorded resources from the real world, updating their
    /// primary instances in place
    #[instrument(name = "refresh", skip_all)]
    pub async fn refresh(&self, mut state: State) -> RunReport {
        let mut phases = BTreeMap::new();
        let mut errors = Vec::new();
        let mut halted = false;

        // collect addresses up front: entries may be removed as we go
        let targets: Vec<(Vec<String>, String)> = state
            .modules
            .iter()
            .flat_map(|m| m.resources.keys().map(|addr| (m.path.clone(), addr.clone())))
            .collect();

        for (path, address) in targets {
            if self.stop.is_stopped() {
                halted = true;
                break;
            }

            let Some(resource) = state
                .module(&path)
                .and_then(|m| m.resources.get(&address))
                .cloned()
            else {
                continue;
            };
            let info = ResourceInfo {
                address: address.clone(),
                resource_type: resource.resource_type.clone(),
                module_path: path.clone(),
            };

            if dispatch(&self.hooks, |h| h.pre_refresh(&address, &resource.primary)).is_halt() {
                phases.insert(address, ResourcePhase::Halted);
                continue;
            }

            debug!(address = %info, "refreshing");
            match self.provider.refresh(&info, &resource.primary).await {
                Ok(new_state) => {
                    let module = state.module_mut(&path);
                    match &new_state {
                        Some(instance) => {
                            if let Some(r) = module.resources.get_mut(&address) {
                                r.primary = instance.clone();
                            }
                        }
                        // the resource no longer exists
                        None => {
                            module.resources.remove(&address);
                        }
                    }
                    let _ = dispatch(&self.hooks, |h| h.post_refresh(&address, new_state.as_ref()));
                    phases.insert(address, ResourcePhase::Applied);
                }
                Err(err) => {
                    let _ = dispatch(&self.hooks, |h| {
                        h.post_refresh(&address, Some(&resource.primary))
                    });
                    errors.push(ResourceError::new(&address, ResourceErrorKind::Refresh(err)));
                    phases.insert(address, ResourcePhase::Failed);
                }
            }
        }

        let status = run_status(&errors, halted, &phases);
        RunReport {
            status,
            state,
            errors: AggregateError(errors),
            phases,
        }
    }
}

fn run_status(
    errors: &[ResourceError],
    halted: bool,
    phases: &BTreeMap<String, ResourcePhase>,
) -> RunStatus {
    if !errors.is_empty() {
        RunStatus::Failed
    } else if halted || phases.values().any(|p| matches!(p, ResourcePhase::Halted)) {
        RunStatus::Interrupted
    } else {
        RunStatus::Success
    }
}

/// Outcome of one diff/apply cycle within a resource's lifecycle
enum Cycle {
    Done(Option<InstanceState>),
    Halted,
    Failed(ResourceErrorKind),
}

/// Shared context for the per-resource workers of one run
struct WorkerCtx {
    provider: Arc<dyn Provider>,
    provisioners: BTreeMap<String, Arc<dyn Provisioner>>,
    hooks: Vec<Arc<dyn Hook>>,
    stop: Arc<StopHook>,
    state: RwLock<State>,
    phases: Mutex<BTreeMap<String, ResourcePhase>>,
}

impl WorkerCtx {
    fn set_phase(&self, address: &str, phase: ResourcePhase) {
        self.phases
            .lock()
            .expect("phase map lock poisoned")
            .insert(address.to_string(), phase);
    }

    /// Walk one resource through its lifecycle
    ///
    /// No other worker touches this address, so only wholesale inserts and
    /// removals of the resource entry take the state write lock.
    #[instrument(name = "resource", skip_all, fields(address = %plan.address))]
    async fn run(&self, plan: ResourcePlan) -> (ResourcePhase, Option<ResourceError>) {
        let info = ResourceInfo {
            address: plan.address.clone(),
            resource_type: plan.resource_type.clone(),
            module_path: plan.module_path.clone(),
        };

        let entry = {
            let state = self.state.read().await;
            state
                .module(&plan.module_path)
                .and_then(|m| m.resources.get(&plan.address))
                .map(|r| (r.primary.clone(), r.deposed.clone()))
        };
        let (prior, leftover) = match entry {
            Some((primary, deposed)) => (Some(primary), deposed),
            None => (None, Vec::new()),
        };

        if dispatch(&self.hooks, |h| h.pre_diff(&plan.address, prior.as_ref())).is_halt() {
            return (ResourcePhase::Halted, None);
        }

        // instances deposed by an earlier interrupted replacement are
        // destroyed before the primary is touched, so the record converges
        // back to one instance per address
        for old in &leftover {
            match self.destroy_deposed(&plan, &info, old).await {
                Cycle::Done(_) => {}
                Cycle::Halted => return (ResourcePhase::Halted, None),
                Cycle::Failed(kind) => {
                    return (
                        ResourcePhase::Failed,
                        Some(ResourceError::new(&plan.address, kind)),
                    )
                }
            }
        }
        if !leftover.is_empty() {
            let mut state = self.state.write().await;
            let module = state.module_mut(&plan.module_path);
            // the catch-up may leave an entry that tracks nothing at all
            if module
                .resources
                .get(&plan.address)
                .is_some_and(|r| !r.primary.exists() && r.deposed.is_empty())
            {
                module.resources.remove(&plan.address);
            }
        }

        debug!("computing diff");
        self.set_phase(&plan.address, ResourcePhase::Diffing);
        let diff = match self.provider.diff(&info, prior.as_ref(), &plan.config).await {
            Ok(diff) => diff.unwrap_or_default(),
            Err(err) => {
                return (
                    ResourcePhase::Failed,
                    Some(ResourceError::new(&plan.address, ResourceErrorKind::Diff(err))),
                )
            }
        };

        // halt takes precedence over a drift mismatch at this checkpoint
        if self.stop.is_stopped() {
            return (ResourcePhase::Halted, None);
        }

        if let Some(planned) = &plan.planned {
            if !planned.same(&diff) {
                let drift = DriftError {
                    address: plan.address.clone(),
                    planned: planned.clone(),
                    actual: diff,
                };
                return (
                    ResourcePhase::Failed,
                    Some(ResourceError::new(&plan.address, drift.into())),
                );
            }
        }

        if dispatch(&self.hooks, |h| h.post_diff(&plan.address, &diff)).is_halt() {
            return (ResourcePhase::Halted, None);
        }
        self.set_phase(&plan.address, ResourcePhase::Diffed);

        if diff.is_empty() {
            debug!("no changes");
            return (ResourcePhase::Applied, None);
        }

        let replace = diff.requires_new() && prior.as_ref().is_some_and(InstanceState::exists);
        let created = replace || !prior.as_ref().is_some_and(InstanceState::exists);

        self.set_phase(&plan.address, ResourcePhase::Applying);
        let outcome = if !replace {
            self.apply_cycle(&plan, &info, prior.as_ref(), &diff).await
        } else if plan.create_before_destroy {
            let old = prior.clone().expect("replacement requires a prior instance");
            self.replace_create_first(&plan, &info, old, &diff).await
        } else {
            let old = prior.as_ref().expect("replacement requires a prior instance");
            self.replace_destroy_first(&plan, &info, old, &diff).await
        };

        match outcome {
            Cycle::Halted => (ResourcePhase::Halted, None),
            Cycle::Failed(kind) => (
                ResourcePhase::Failed,
                Some(ResourceError::new(&plan.address, kind)),
            ),
            Cycle::Done(new_state) => {
                if created && !plan.provisioners.is_empty() {
                    if let Some(instance) = &new_state {
                        match self.provision(&plan, &info, instance).await {
                            Cycle::Done(_) => {}
                            Cycle::Halted => return (ResourcePhase::Halted, None),
                            Cycle::Failed(kind) => {
                                return (
                                    ResourcePhase::Failed,
                                    Some(ResourceError::new(&plan.address, kind)),
                                )
                            }
                        }
                    }
                }
                (ResourcePhase::Applied, None)
            }
        }
    }

    /// One pre-apply → provider apply → state update → post-apply cycle
    async fn apply_cycle(
        &self,
        plan: &ResourcePlan,
        info: &ResourceInfo,
        prior: Option<&InstanceState>,
        diff: &InstanceDiff,
    ) -> Cycle {
        // a halt here skips the provider call, leaving prior state untouched
        if dispatch(&self.hooks, |h| h.pre_apply(&plan.address, prior, diff)).is_halt() {
            return Cycle::Halted;
        }

        debug!(destroy = diff.destroy, "applying diff");
        let (new_state, error) = match self.provider.apply(info, prior, diff).await {
            Ok(new_state) => (new_state, None),
            Err(failure) => (failure.partial, Some(failure.source)),
        };

        // Whatever the provider reported replaces the recorded state even
        // on failure: the call may have partially succeeded in the real
        // world, and dropping the result would orphan the resource.
        self.record_instance(plan, new_state.clone()).await;

        // informational only: the returned action does not re-attempt the call
        let _ = dispatch(&self.hooks, |h| {
            h.post_apply(&plan.address, new_state.as_ref(), error.as_ref())
        });

        match error {
            Some(err) => Cycle::Failed(ResourceErrorKind::Apply(err)),
            None => Cycle::Done(new_state),
        }
    }

    /// Replace by destroying the old instance before creating the new one
    async fn replace_destroy_first(
        &self,
        plan: &ResourcePlan,
        info: &ResourceInfo,
        old: &InstanceState,
        diff: &InstanceDiff,
    ) -> Cycle {
        match self
            .apply_cycle(plan, info, Some(old), &InstanceDiff::for_destroy())
            .await
        {
            Cycle::Done(_) => {}
            other => return other,
        }

        self.apply_cycle(plan, info, None, &creation_diff(diff)).await
    }

    /// Replace by creating the new instance first, parking the old one as
    /// deposed until the replacement is confirmed and the old destroyed
    async fn replace_create_first(
        &self,
        plan: &ResourcePlan,
        info: &ResourceInfo,
        old: InstanceState,
        diff: &InstanceDiff,
    ) -> Cycle {
        {
            let mut state = self.state.write().await;
            let module = state.module_mut(&plan.module_path);
            if let Some(resource) = module.resources.get_mut(&plan.address) {
                resource.deposed.push(old.clone());
            }
        }

        let new_state = match self.apply_cycle(plan, info, None, &creation_diff(diff)).await {
            Cycle::Done(new_state) => new_state,
            // the old instance stays deposed; the next run picks it up
            other => return other,
        };

        match self.destroy_deposed(plan, info, &old).await {
            Cycle::Done(_) => Cycle::Done(new_state),
            other => other,
        }
    }

    /// Destroy one deposed instance and reconcile the deposed list
    ///
    /// On success the instance is dropped from `deposed`; on failure the
    /// provider-reported remnant takes its place (or the record is dropped
    /// when the provider reports the instance gone). The primary entry is
    /// never touched, so a failure here cannot clobber a freshly created
    /// replacement.
    async fn destroy_deposed(
        &self,
        plan: &ResourcePlan,
        info: &ResourceInfo,
        old: &InstanceState,
    ) -> Cycle {
        let destroy = InstanceDiff::for_destroy();
        if dispatch(&self.hooks, |h| h.pre_apply(&plan.address, Some(old), &destroy)).is_halt() {
            return Cycle::Halted;
        }

        debug!("destroying deposed instance");
        let (remnant, error) = match self.provider.apply(info, Some(old), &destroy).await {
            Ok(_) => (None, None),
            Err(failure) => (failure.partial, Some(failure.source)),
        };

        {
            let mut state = self.state.write().await;
            if let Some(resource) = state
                .module_mut(&plan.module_path)
                .resources
                .get_mut(&plan.address)
            {
                if let Some(index) = resource.deposed.iter().position(|d| d == old) {
                    match remnant.clone() {
                        Some(partial) => resource.deposed[index] = partial,
                        None => {
                            resource.deposed.remove(index);
                        }
                    }
                }
            }
        }

        let _ = dispatch(&self.hooks, |h| {
            h.post_apply(&plan.address, remnant.as_ref(), error.as_ref())
        });

        match error {
            Some(err) => Cycle::Failed(ResourceErrorKind::Apply(err)),
            None => Cycle::Done(None),
        }
    }

    /// Run the plan's provisioners against a newly created instance
    async fn provision(
        &self,
        plan: &ResourcePlan,
        info: &ResourceInfo,
        instance: &InstanceState,
    ) -> Cycle {
        if dispatch(&self.hooks, |h| {
            h.pre_provision_resource(&plan.address, instance)
        })
        .is_halt()
        {
            return Cycle::Halted;
        }

        for name in &plan.provisioners {
            if dispatch(&self.hooks, |h| h.pre_provision(&plan.address, name)).is_halt() {
                return Cycle::Halted;
            }

            let Some(provisioner) = self.provisioners.get(name) else {
                return Cycle::Failed(ResourceErrorKind::Provision {
                    name: name.clone(),
                    source: format!("no provisioner registered under {name:?}").into(),
                });
            };

            debug!(provisioner = %name, "provisioning");
            if let Err(source) = provisioner.provision(info, instance).await {
                return Cycle::Failed(ResourceErrorKind::Provision {
                    name: name.clone(),
                    source,
                });
            }

            if dispatch(&self.hooks, |h| h.post_provision(&plan.address, name)).is_halt() {
                return Cycle::Halted;
            }
        }

        let _ = dispatch(&self.hooks, |h| {
            h.post_provision_resource(&plan.address, instance)
        });
        Cycle::Done(Some(instance.clone()))
    }

    /// Insert, replace or remove the resource entry for `plan`
    async fn record_instance(&self, plan: &ResourcePlan, new_state: Option<InstanceState>) {
        let mut state = self.state.write().await;
        let module = state.module_mut(&plan.module_path);
        match new_state {
            Some(instance) => {
                let resource = module.resources.entry(plan.address.clone()).or_default();
                resource.resource_type = plan.resource_type.clone();
                resource.provider = plan.provider.clone();
                resource.dependencies = plan.dependencies.clone();
                resource.primary = instance;
            }
            None => {
                // the resource no longer exists; keep the entry only while
                // an old instance is still deposed
                if module
                    .resources
                    .get(&plan.address)
                    .is_some_and(|r| !r.deposed.is_empty())
                {
                    if let Some(resource) = module.resources.get_mut(&plan.address) {
                        resource.primary = InstanceState::default();
                    }
                } else {
                    module.resources.remove(&plan.address);
                }
            }
        }
    }
}

/// The creation half of a replacement: the computed diff without any
/// destroy flag
fn creation_diff(diff: &InstanceDiff) -> InstanceDiff {
    InstanceDiff {
        attributes: diff.attributes.clone(),
        destroy: false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use tracing_subscriber::{prelude::*, EnvFilter};

    use super::*;
    use crate::diff::AttributeDiff;
    use crate::hook::{HookAction, HookResult, MockHook};
    use crate::provider::mock::{MockProvider, MockProvisioner};
    use crate::provider::ApplyError;
    use crate::state::ResourceState;

    fn init() {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().pretty().with_target(false))
            .with(EnvFilter::from_default_env())
            .try_init()
            .unwrap_or(());
    }

    fn attr_update(name: &str, old: &str, new: &str) -> InstanceDiff {
        InstanceDiff {
            attributes: BTreeMap::from([(
                name.to_string(),
                AttributeDiff {
                    old: old.to_string(),
                    new: new.to_string(),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        }
    }

    fn attr_replace(name: &str, old: &str, new: &str) -> InstanceDiff {
        let mut diff = attr_update(name, old, new);
        diff.attributes.get_mut(name).unwrap().requires_new = true;
        diff
    }

    fn existing_state(address: &str, id: &str) -> State {
        let mut state = State::new();
        state.module_mut(ROOT_MODULE).resources.insert(
            address.to_string(),
            ResourceState {
                resource_type: "test_instance".to_string(),
                primary: InstanceState::new(id),
                ..Default::default()
            },
        );
        state
    }

    #[tokio::test]
    async fn test_apply_updates_state() {
        init();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(attr_update("ami", "abc", "xyz"))
                .on_apply(|_, prior, diff| {
                    let mut state = prior.cloned().unwrap_or_default();
                    for (name, attr) in &diff.attributes {
                        state.attributes.insert(name.clone(), attr.new.clone());
                    }
                    Ok(Some(state))
                }),
        );
        let hook = Arc::new(MockHook::new());
        let engine = Engine::new(provider.clone()).hook(hook.clone());

        let report = engine
            .apply(
                existing_state("test_instance.foo", "bar"),
                Plan::new().resource(ResourcePlan::new("test_instance.foo", "test_instance")),
            )
            .await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.phase("test_instance.foo"), Some(ResourcePhase::Applied));
        assert!(report.errors.is_empty());

        let resource = &report.state.root_module().unwrap().resources["test_instance.foo"];
        assert_eq!(resource.primary.id, "bar");
        assert_eq!(resource.primary.attributes["ami"], "xyz");

        // the provider saw the prior state
        assert_eq!(provider.last_diff_state().unwrap().id, "bar");
        assert_eq!(provider.last_apply_state().unwrap().id, "bar");

        // hooks bracketed every transition
        let calls = hook.recorded();
        assert_eq!(calls.pre_diff.len(), 1);
        assert_eq!(calls.post_diff.len(), 1);
        assert_eq!(calls.pre_apply.len(), 1);
        assert_eq!(calls.post_apply.len(), 1);
        assert_eq!(calls.post_apply[0].2, None);
    }

    #[tokio::test]
    async fn test_empty_diff_skips_apply() {
        init();
        let provider = Arc::new(MockProvider::new());
        let engine = Engine::new(provider.clone());

        let report = engine
            .apply(
                existing_state("test_instance.foo", "bar"),
                Plan::new().resource(ResourcePlan::new("test_instance.foo", "test_instance")),
            )
            .await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.phase("test_instance.foo"), Some(ResourcePhase::Applied));
        assert_eq!(provider.apply_calls(), 0);
    }

    struct HaltOnPreApply;

    impl Hook for HaltOnPreApply {
        fn pre_apply(
            &self,
            _: &str,
            _: Option<&InstanceState>,
            _: &InstanceDiff,
        ) -> HookResult {
            Ok(HookAction::Halt)
        }
    }

    #[tokio::test]
    async fn test_pre_apply_halt_leaves_prior_state() {
        init();
        let provider = Arc::new(MockProvider::new().diff_return(attr_update("ami", "abc", "xyz")));
        let engine = Engine::new(provider.clone()).hook(Arc::new(HaltOnPreApply));

        let state = existing_state("test_instance.foo", "bar");
        let report = engine
            .apply(
                state.clone(),
                Plan::new().resource(ResourcePlan::new("test_instance.foo", "test_instance")),
            )
            .await;

        assert_eq!(report.status, RunStatus::Interrupted);
        assert_eq!(report.phase("test_instance.foo"), Some(ResourcePhase::Halted));
        assert_eq!(provider.apply_calls(), 0);
        assert_eq!(report.state, state);
    }

    #[tokio::test]
    async fn test_failed_apply_records_partial_state() {
        init();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(attr_update("ami", "", "bar"))
                .on_apply(|_, _, _| {
                    Err(ApplyError::new("apply blew up")
                        .with_partial(InstanceState::new("foo")))
                }),
        );
        let engine = Engine::new(provider.clone());

        let report = engine
            .apply(
                State::new(),
                Plan::new().resource(ResourcePlan::new("test_instance.foo", "test_instance")),
            )
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.phase("test_instance.foo"), Some(ResourcePhase::Failed));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].address, "test_instance.foo");

        // the partial result is recorded, not orphaned
        let resource = &report.state.root_module().unwrap().resources["test_instance.foo"];
        assert_eq!(resource.primary.id, "foo");
    }

    #[tokio::test]
    async fn test_failed_apply_does_not_stop_independent_resources() {
        init();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(attr_update("ami", "", "bar"))
                .on_apply(|info, _, _| {
                    if info.address == "test_instance.bad" {
                        return Err(ApplyError::new("boom"));
                    }
                    Ok(Some(InstanceState::new("ok")))
                }),
        );
        let engine = Engine::new(provider.clone());

        let report = engine
            .apply(
                State::new(),
                Plan::new().batch([
                    ResourcePlan::new("test_instance.bad", "test_instance"),
                    ResourcePlan::new("test_instance.good", "test_instance"),
                ]),
            )
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.phase("test_instance.bad"), Some(ResourcePhase::Failed));
        assert_eq!(report.phase("test_instance.good"), Some(ResourcePhase::Applied));
        assert_eq!(provider.apply_calls(), 2);
    }

    #[tokio::test]
    async fn test_drift_mismatch_aborts_resource() {
        init();
        let provider = Arc::new(MockProvider::new().diff_return(attr_update("ami", "abc", "xyz")));
        let engine = Engine::new(provider.clone());

        let state = existing_state("test_instance.foo", "bar");
        let report = engine
            .apply(
                state.clone(),
                Plan::new().resource(
                    ResourcePlan::new("test_instance.foo", "test_instance")
                        // the plan promised a different change
                        .planned(attr_replace("instance_type", "small", "large")),
                ),
            )
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            report.errors[0].kind,
            ResourceErrorKind::Drift(_)
        ));
        assert_eq!(provider.apply_calls(), 0);
        // prior state untouched
        assert_eq!(report.state, state);
    }

    #[tokio::test]
    async fn test_stop_during_diff_wins_over_drift() {
        init();
        let engine_stop: Arc<Mutex<Option<Arc<StopHook>>>> = Arc::default();
        let stop_ref = engine_stop.clone();
        let provider = Arc::new(MockProvider::new().on_diff(move |_, _, _| {
            // the interrupt lands while the diff is being computed
            if let Some(stop) = stop_ref.lock().unwrap().as_ref() {
                stop.stop();
            }
            Ok(Some(attr_update("ami", "abc", "xyz")))
        }));
        let engine = Engine::new(provider.clone());
        *engine_stop.lock().unwrap() = Some(engine.stop_handle());

        let report = engine
            .apply(
                existing_state("test_instance.foo", "bar"),
                Plan::new().resource(
                    ResourcePlan::new("test_instance.foo", "test_instance")
                        // the recomputed diff would not match this plan
                        .planned(attr_replace("instance_type", "small", "large")),
                ),
            )
            .await;

        // the halt is reported, not the mismatch
        assert_eq!(report.status, RunStatus::Interrupted);
        assert!(report.errors.is_empty());
        assert_eq!(report.phase("test_instance.foo"), Some(ResourcePhase::Halted));
        assert_eq!(provider.apply_calls(), 0);
    }

    #[tokio::test]
    async fn test_matching_plan_is_applied() {
        init();
        let diff = attr_update("ami", "abc", "xyz");
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(diff.clone())
                .apply_return(Some(InstanceState::new("bar"))),
        );
        let engine = Engine::new(provider.clone());

        let report = engine
            .apply(
                existing_state("test_instance.foo", "bar"),
                Plan::new().resource(
                    ResourcePlan::new("test_instance.foo", "test_instance").planned(diff),
                ),
            )
            .await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(provider.apply_calls(), 1);
    }

    #[tokio::test]
    async fn test_destroy_removes_resource() {
        init();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(InstanceDiff::for_destroy())
                .apply_return(None),
        );
        let engine = Engine::new(provider.clone());

        let report = engine
            .apply(
                existing_state("test_instance.foo", "bar"),
                Plan::new().resource(ResourcePlan::new("test_instance.foo", "test_instance")),
            )
            .await;

        assert_eq!(report.status, RunStatus::Success);
        assert!(report
            .state
            .root_module()
            .unwrap()
            .resources
            .is_empty());
    }

    #[tokio::test]
    async fn test_replacement_destroys_then_creates() {
        init();
        let applied: Arc<Mutex<Vec<(bool, Option<String>)>>> = Arc::default();
        let record = applied.clone();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(attr_replace("ami", "abc", "xyz"))
                .on_apply(move |_, prior, diff| {
                    record
                        .lock()
                        .unwrap()
                        .push((diff.destroy, prior.map(|s| s.id.clone())));
                    if diff.destroy {
                        Ok(None)
                    } else {
                        Ok(Some(InstanceState::new("new-id")))
                    }
                }),
        );
        let engine = Engine::new(provider.clone());

        let report = engine
            .apply(
                existing_state("test_instance.foo", "old-id"),
                Plan::new().resource(ResourcePlan::new("test_instance.foo", "test_instance")),
            )
            .await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(
            *applied.lock().unwrap(),
            vec![
                (true, Some("old-id".to_string())),
                (false, None),
            ]
        );
        let resource = &report.state.root_module().unwrap().resources["test_instance.foo"];
        assert_eq!(resource.primary.id, "new-id");
        assert!(resource.deposed.is_empty());
    }

    #[tokio::test]
    async fn test_replacement_create_before_destroy() {
        init();
        let applied: Arc<Mutex<Vec<(bool, Option<String>)>>> = Arc::default();
        let record = applied.clone();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(attr_replace("ami", "abc", "xyz"))
                .on_apply(move |_, prior, diff| {
                    record
                        .lock()
                        .unwrap()
                        .push((diff.destroy, prior.map(|s| s.id.clone())));
                    if diff.destroy {
                        Ok(None)
                    } else {
                        Ok(Some(InstanceState::new("new-id")))
                    }
                }),
        );
        let engine = Engine::new(provider.clone());

        let report = engine
            .apply(
                existing_state("test_instance.foo", "old-id"),
                Plan::new().resource(
                    ResourcePlan::new("test_instance.foo", "test_instance")
                        .create_before_destroy(),
                ),
            )
            .await;

        assert_eq!(report.status, RunStatus::Success);
        // create first, then destroy of the deposed instance
        assert_eq!(
            *applied.lock().unwrap(),
            vec![
                (false, None),
                (true, Some("old-id".to_string())),
            ]
        );
        let resource = &report.state.root_module().unwrap().resources["test_instance.foo"];
        assert_eq!(resource.primary.id, "new-id");
        assert!(resource.deposed.is_empty());
    }

    #[tokio::test]
    async fn test_create_before_destroy_keeps_deposed_on_failure() {
        init();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(attr_replace("ami", "abc", "xyz"))
                .on_apply(|_, _, diff| {
                    if diff.destroy {
                        // the old instance could not be destroyed
                        return Err(ApplyError::new("destroy failed")
                            .with_partial(InstanceState::new("old-id")));
                    }
                    Ok(Some(InstanceState::new("new-id")))
                }),
        );
        let engine = Engine::new(provider.clone());

        let report = engine
            .apply(
                existing_state("test_instance.foo", "old-id"),
                Plan::new().resource(
                    ResourcePlan::new("test_instance.foo", "test_instance")
                        .create_before_destroy(),
                ),
            )
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        let resource = &report.state.root_module().unwrap().resources["test_instance.foo"];
        // the replacement is primary, the undestroyed old instance stays deposed
        assert_eq!(resource.primary.id, "new-id");
        assert_eq!(resource.deposed.len(), 1);
        assert_eq!(resource.deposed[0].id, "old-id");
    }

    #[tokio::test]
    async fn test_leftover_deposed_destroyed_on_next_run() {
        init();
        let applied: Arc<Mutex<Vec<(bool, Option<String>)>>> = Arc::default();
        let record = applied.clone();
        let provider = Arc::new(MockProvider::new().on_apply(move |_, prior, diff| {
            record
                .lock()
                .unwrap()
                .push((diff.destroy, prior.map(|s| s.id.clone())));
            Ok(None)
        }));
        let engine = Engine::new(provider.clone());

        // a previous replacement created the new primary but never got to
        // destroy the old instance
        let mut state = existing_state("test_instance.foo", "new-id");
        state
            .root_module_mut()
            .resources
            .get_mut("test_instance.foo")
            .unwrap()
            .deposed
            .push(InstanceState::new("old-id"));

        let report = engine
            .apply(
                state,
                Plan::new().resource(ResourcePlan::new("test_instance.foo", "test_instance")),
            )
            .await;

        assert_eq!(report.status, RunStatus::Success);
        // the only provider apply is the destroy of the old instance
        assert_eq!(
            *applied.lock().unwrap(),
            vec![(true, Some("old-id".to_string()))]
        );
        let resource = &report.state.root_module().unwrap().resources["test_instance.foo"];
        assert_eq!(resource.primary.id, "new-id");
        assert!(resource.deposed.is_empty());
    }

    #[tokio::test]
    async fn test_leftover_deposed_kept_when_destroy_fails() {
        init();
        let provider = Arc::new(MockProvider::new().on_apply(|_, _, _| {
            Err(ApplyError::new("still in use").with_partial(InstanceState::new("old-id")))
        }));
        let engine = Engine::new(provider.clone());

        let mut state = existing_state("test_instance.foo", "new-id");
        state
            .root_module_mut()
            .resources
            .get_mut("test_instance.foo")
            .unwrap()
            .deposed
            .push(InstanceState::new("old-id"));

        let report = engine
            .apply(
                state,
                Plan::new().resource(ResourcePlan::new("test_instance.foo", "test_instance")),
            )
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(matches!(
            report.errors[0].kind,
            ResourceErrorKind::Apply(_)
        ));
        let resource = &report.state.root_module().unwrap().resources["test_instance.foo"];
        // the primary is untouched and the remnant stays tracked
        assert_eq!(resource.primary.id, "new-id");
        assert_eq!(resource.deposed.len(), 1);
        assert_eq!(resource.deposed[0].id, "old-id");
    }

    #[tokio::test]
    async fn test_deposed_only_entry_removed_once_reconciled() {
        init();
        let provider = Arc::new(MockProvider::new().on_apply(|_, _, _| Ok(None)));
        let engine = Engine::new(provider.clone());

        // nothing but a deposed instance survived the previous run
        let mut state = State::new();
        state.root_module_mut().resources.insert(
            "test_instance.foo".to_string(),
            ResourceState {
                resource_type: "test_instance".to_string(),
                deposed: vec![InstanceState::new("old-id")],
                ..Default::default()
            },
        );

        let report = engine
            .apply(
                state,
                Plan::new().resource(ResourcePlan::new("test_instance.foo", "test_instance")),
            )
            .await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(provider.apply_calls(), 1);
        assert!(report.state.root_module().unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn test_provisioners_run_on_create() {
        init();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(attr_update("ami", "", "bar"))
                .apply_return(Some(InstanceState::new("foo"))),
        );
        let provisioner = Arc::new(MockProvisioner::new());
        let hook = Arc::new(MockHook::new());
        let engine = Engine::new(provider.clone())
            .provisioner("shell", provisioner.clone())
            .hook(hook.clone());

        let report = engine
            .apply(
                State::new(),
                Plan::new().resource(
                    ResourcePlan::new("test_instance.foo", "test_instance")
                        .provisioner("shell"),
                ),
            )
            .await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(provisioner.calls(), 1);

        let calls = hook.recorded();
        assert_eq!(calls.pre_provision_resource.len(), 1);
        assert_eq!(calls.post_provision_resource.len(), 1);
        assert_eq!(
            calls.pre_provision,
            vec![("test_instance.foo".to_string(), "shell".to_string())]
        );
        assert_eq!(
            calls.post_provision,
            vec![("test_instance.foo".to_string(), "shell".to_string())]
        );
    }

    #[tokio::test]
    async fn test_provisioners_skipped_on_update() {
        init();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(attr_update("ami", "abc", "xyz"))
                .apply_return(Some(InstanceState::new("bar"))),
        );
        let provisioner = Arc::new(MockProvisioner::new());
        let engine = Engine::new(provider.clone()).provisioner("shell", provisioner.clone());

        let report = engine
            .apply(
                existing_state("test_instance.foo", "bar"),
                Plan::new().resource(
                    ResourcePlan::new("test_instance.foo", "test_instance")
                        .provisioner("shell"),
                ),
            )
            .await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(provisioner.calls(), 0);
    }

    #[tokio::test]
    async fn test_provision_failure_keeps_new_state() {
        init();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(attr_update("ami", "", "bar"))
                .apply_return(Some(InstanceState::new("foo"))),
        );
        let provisioner = Arc::new(
            MockProvisioner::new().on_provision(|_, _| Err("provisioning failed".into())),
        );
        let engine = Engine::new(provider.clone()).provisioner("shell", provisioner.clone());

        let report = engine
            .apply(
                State::new(),
                Plan::new().resource(
                    ResourcePlan::new("test_instance.foo", "test_instance")
                        .provisioner("shell"),
                ),
            )
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(matches!(
            report.errors[0].kind,
            ResourceErrorKind::Provision { .. }
        ));
        // the instance exists in the real world; it stays recorded
        let resource = &report.state.root_module().unwrap().resources["test_instance.foo"];
        assert_eq!(resource.primary.id, "foo");
    }

    #[tokio::test]
    async fn test_stop_skips_subsequent_batches() {
        init();
        let engine_stop: Arc<Mutex<Option<Arc<StopHook>>>> = Arc::default();
        let stop_ref = engine_stop.clone();
        let provider = Arc::new(
            MockProvider::new()
                .diff_return(attr_update("ami", "", "bar"))
                .on_apply(move |_, _, _| {
                    // an external interrupt arrives while the first apply
                    // is in flight
                    if let Some(stop) = stop_ref.lock().unwrap().as_ref() {
                        stop.stop();
                    }
                    Ok(Some(InstanceState::new("foo")))
                }),
        );
        let engine = Engine::new(provider.clone());
        *engine_stop.lock().unwrap() = Some(engine.stop_handle());

        let report = engine
            .apply(
                State::new(),
                Plan::new()
                    .resource(ResourcePlan::new("test_instance.one", "test_instance"))
                    .resource(ResourcePlan::new("test_instance.two", "test_instance")),
            )
            .await;

        assert_eq!(report.status, RunStatus::Interrupted);
        assert!(report.errors.is_empty());
        // the in-flight apply completed, the second batch never started
        assert_eq!(provider.apply_calls(), 1);
        assert_eq!(report.phase("test_instance.one"), Some(ResourcePhase::Applied));
        assert_eq!(report.phase("test_instance.two"), Some(ResourcePhase::Pending));
        assert_eq!(report.state.root_module().unwrap().resources.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_updates_state() {
        init();
        let provider = Arc::new(MockProvider::new().on_refresh(|_, prior| {
            let mut state = prior.clone();
            state
                .attributes
                .insert("ami".to_string(), "refreshed".to_string());
            Ok(Some(state))
        }));
        let hook = Arc::new(MockHook::new());
        let engine = Engine::new(provider.clone()).hook(hook.clone());

        let report = engine.refresh(existing_state("test_instance.foo", "bar")).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(provider.refresh_calls(), 1);
        let resource = &report.state.root_module().unwrap().resources["test_instance.foo"];
        assert_eq!(resource.primary.attributes["ami"], "refreshed");

        let calls = hook.recorded();
        assert_eq!(calls.pre_refresh.len(), 1);
        assert_eq!(calls.post_refresh.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_removes_vanished_resource() {
        init();
        let provider = Arc::new(MockProvider::new().on_refresh(|_, _| Ok(None)));
        let engine = Engine::new(provider.clone());

        let report = engine.refresh(existing_state("test_instance.foo", "bar")).await;

        assert_eq!(report.status, RunStatus::Success);
        assert!(report.state.root_module().unwrap().resources.is_empty());
    }
}
