//! Reconciler for driving a deployment to its desired state.
//!
//! This module implements the core reconciliation loop: build the declared
//! dependency graph, classify every resource against the snapshot, and run
//! the resulting provider steps through the scheduler. Every completed
//! provider operation is written to the snapshot before dependents start.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, StackConfig};
use crate::deployment::{Deployment, DeploymentParts, ResourceNode};
use crate::error::{InfraError, ProviderError, ReconcileError, Result};
use crate::graph::DependencyGraph;
use crate::output::{Output, OutputResolver};
use crate::planner::{
    effective_inputs, ChangeKind, DiffEngine, NodeChange, PlanStep, ReconcilePlan, Scheduler,
    StepKind, StepRecord, StepStatus,
};
use crate::provider::{ProviderInvoker, ReplacementPolicy, ResourceRequest, TypeRegistry};
use crate::report::{NodeReport, NodeStatus, RunReport};
use crate::state::{
    generate_holder_id, LockInfo, PendingDelete, ResourceState, RunHistoryEntry, RunOperation,
    SnapshotJournal, StateSnapshot, StateStore,
};

/// Resolvers of resource output cells, by logical name.
type Resolvers = HashMap<String, OutputResolver<Value>>;

/// Reconciler for maintaining desired state.
pub struct Reconciler {
    /// State store.
    store: Arc<dyn StateStore>,
    /// Provider invoker.
    invoker: Arc<ProviderInvoker>,
    /// Replacement rules per type.
    types: TypeRegistry,
    /// Concurrency settings.
    engine: EngineConfig,
    /// Lock holder identity.
    holder: String,
}

/// Report of drift detection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Resources whose live outputs differ from the snapshot.
    pub drifted_resources: Vec<String>,
    /// Recorded resources the provider no longer knows.
    pub missing_resources: Vec<String>,
    /// Declared resources that were never applied.
    pub undeployed_resources: Vec<String>,
    /// Number of recorded resources.
    pub total_resources: usize,
    /// Number of recorded resources the provider returned.
    pub observed_count: usize,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("backend", &self.store.backend_type())
            .field("engine", &self.engine)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, invoker: Arc<ProviderInvoker>) -> Self {
        Self {
            store,
            invoker,
            types: TypeRegistry::new(),
            engine: EngineConfig::default(),
            holder: generate_holder_id(),
        }
    }

    /// Creates a reconciler with the type rules and engine settings of a
    /// stack file.
    #[must_use]
    pub fn for_stack(
        config: &StackConfig,
        store: Arc<dyn StateStore>,
        invoker: Arc<ProviderInvoker>,
    ) -> Self {
        Self::new(store, invoker)
            .with_types(TypeRegistry::from_config(&config.types))
            .with_engine(config.engine)
    }

    /// Sets the replacement rules.
    #[must_use]
    pub fn with_types(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    /// Sets the concurrency settings.
    #[must_use]
    pub const fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the identity used for the state lock.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// The token that cancels a running apply or destroy.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        self.invoker.cancellation_token()
    }

    /// Computes what an apply would do, without mutating anything.
    ///
    /// Provider functions the planner needs may still be invoked.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid or the snapshot cannot be
    /// loaded.
    pub async fn preview(&self, deployment: Deployment) -> Result<ReconcilePlan> {
        let DeploymentParts {
            project,
            environment,
            nodes,
            mut resolvers,
            ..
        } = deployment.into_parts();
        let desired = DependencyGraph::build(&nodes)?;
        let snapshot = self.load_snapshot(&project, &environment).await?;
        Ok(self
            .plan(&project, &environment, &nodes, &desired, &snapshot, &mut resolvers)
            .await)
    }

    /// Applies a deployment.
    ///
    /// Node failures do not make this return an error; they are reported
    /// in the [`RunReport`].
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the state lock is held
    /// elsewhere, or the snapshot cannot be loaded.
    pub async fn apply(&self, deployment: Deployment) -> Result<RunReport> {
        let parts = deployment.into_parts();
        let desired = DependencyGraph::build(&parts.nodes)?;

        info!(
            "Applying {}/{} ({} resources)",
            parts.project,
            parts.environment,
            parts.nodes.len()
        );

        let lock = self.store.acquire_lock(&self.holder).await?;
        let result = self.apply_locked(parts, &desired).await;
        self.release(&lock).await;
        result
    }

    /// Deletes every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is held elsewhere or the snapshot
    /// cannot be loaded.
    pub async fn destroy(&self, project: &str, environment: &str) -> Result<RunReport> {
        info!("Destroying {project}/{environment}");

        let lock = self.store.acquire_lock(&self.holder).await?;
        let result = self.destroy_locked(project, environment).await;
        self.release(&lock).await;
        result
    }

    /// Checks for drift without applying changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded or a read fails
    /// for any reason other than the resource being gone.
    pub async fn check_drift(&self, deployment: &Deployment) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            deployment.project(),
            deployment.environment()
        );

        let snapshot = self
            .load_snapshot(deployment.project(), deployment.environment())
            .await?;
        let mut report = DriftReport {
            total_resources: snapshot.resources.len(),
            ..DriftReport::default()
        };

        for resource in snapshot.resources.values() {
            let request = ResourceRequest::new(
                &resource.type_token,
                &resource.name,
                resource.inputs.clone(),
            )
            .with_id(resource.id.clone())
            .with_old_outputs(resource.outputs.clone());

            match self.invoker.read(&request).await {
                Ok(response) => {
                    report.observed_count += 1;
                    let mut observed = response.outputs;
                    observed.insert(String::from("id"), Value::String(response.id.clone()));
                    if response.id != resource.id || observed != resource.outputs {
                        debug!("{} drifted from its recorded outputs", resource.name);
                        report.drifted_resources.push(resource.name.clone());
                    }
                }
                Err(InfraError::Provider(ProviderError::NotFound { .. })) => {
                    debug!("{} ({}) no longer exists", resource.name, resource.id);
                    report.missing_resources.push(resource.name.clone());
                }
                Err(err) => return Err(err),
            }
        }

        report.undeployed_resources = deployment
            .nodes()
            .iter()
            .filter(|n| snapshot.get_resource(&n.name).is_none())
            .map(|n| n.name.clone())
            .collect();
        report.has_drift = !report.drifted_resources.is_empty()
            || !report.missing_resources.is_empty()
            || !report.undeployed_resources.is_empty();

        Ok(report)
    }

    async fn apply_locked(
        &self,
        parts: DeploymentParts,
        desired: &DependencyGraph,
    ) -> Result<RunReport> {
        let DeploymentParts {
            project,
            environment,
            nodes,
            exports,
            mut resolvers,
        } = parts;

        let snapshot = self.load_snapshot(&project, &environment).await?;
        let plan = self
            .plan(&project, &environment, &nodes, desired, &snapshot, &mut resolvers)
            .await;
        let journal = SnapshotJournal::new(Arc::clone(&self.store), snapshot);
        refresh_records(&journal, &plan, &nodes).await?;

        let (mut report, leftovers) = self
            .run_plan(&plan, &nodes, resolvers, &journal, RunOperation::Apply)
            .await;

        for (name, resolver) in leftovers {
            let reason = report
                .node(&name)
                .and_then(|n| n.error.clone())
                .unwrap_or_else(|| format!("'{name}' was not applied"));
            resolver.reject(reason);
        }

        resolve_exports(&exports, &mut report).await;
        if let Err(err) = journal.set_outputs(report.outputs.clone()).await {
            error!("Failed to persist stack outputs: {err}");
        }

        record_history(&journal, &mut report).await;
        Ok(report)
    }

    async fn destroy_locked(&self, project: &str, environment: &str) -> Result<RunReport> {
        let snapshot = self.load_snapshot(project, environment).await?;
        let changes = snapshot
            .resources
            .values()
            .map(|r| NodeChange {
                name: r.name.clone(),
                type_token: r.type_token.clone(),
                kind: ChangeKind::Delete,
                details: Vec::new(),
                replacement: None,
            })
            .collect();
        let prior = DependencyGraph::from_edges(snapshot.dependency_edges());
        let plan = ReconcilePlan::build(
            project,
            environment,
            changes,
            &DependencyGraph::default(),
            &prior,
            &snapshot.pending_deletes,
        );

        let journal = SnapshotJournal::new(Arc::clone(&self.store), snapshot);
        let (mut report, _) = self
            .run_plan(&plan, &[], HashMap::new(), &journal, RunOperation::Destroy)
            .await;

        if let Err(err) = journal.set_outputs(BTreeMap::new()).await {
            error!("Failed to clear stack outputs: {err}");
        }

        record_history(&journal, &mut report).await;
        Ok(report)
    }

    /// Classifies every resource and builds the steps.
    ///
    /// Walks the graph in topological order. Resources found unchanged have
    /// their cells resolved from the snapshot, so their dependents can be
    /// diffed against real values.
    async fn plan(
        &self,
        project: &str,
        environment: &str,
        nodes: &[ResourceNode],
        desired: &DependencyGraph,
        snapshot: &StateSnapshot,
        resolvers: &mut Resolvers,
    ) -> ReconcilePlan {
        let diff = DiffEngine::new(&self.types);
        let by_name: HashMap<&str, &ResourceNode> =
            nodes.iter().map(|n| (n.name.as_str(), n)).collect();
        let mut settled: HashSet<String> = HashSet::new();
        let mut changes = Vec::with_capacity(nodes.len());

        for name in desired.topological_order() {
            let Some(&node) = by_name.get(name.as_str()) else {
                continue;
            };
            let prior = snapshot.get_resource(&name);

            let inputs = match node.inputs.resolve_settled(&settled).await {
                Ok(inputs) => inputs,
                Err(err) => {
                    debug!("Inputs of {name} not resolvable while planning: {err}");
                    node.inputs.iter().map(|(key, _)| (key.clone(), None)).collect()
                }
            };

            let result = diff.diff(&node.type_token, &node.options, prior, &inputs);
            if result.kind == ChangeKind::Unchanged
                && let Some(prior) = prior
            {
                if let Some(resolver) = resolvers.remove(&name) {
                    resolver.resolve(prior.output_value());
                }
                settled.insert(name.clone());
            }

            let replacement = (result.kind == ChangeKind::Replace)
                .then(|| self.types.replacement_policy(&node.type_token, &node.options));
            changes.push(NodeChange {
                name,
                type_token: node.type_token.clone(),
                kind: result.kind,
                details: result.details,
                replacement,
            });
        }

        for resource in snapshot.resources.values() {
            if !desired.contains(&resource.name) {
                changes.push(NodeChange {
                    name: resource.name.clone(),
                    type_token: resource.type_token.clone(),
                    kind: ChangeKind::Delete,
                    details: Vec::new(),
                    replacement: None,
                });
            }
        }

        let prior = DependencyGraph::from_edges(snapshot.dependency_edges());
        let plan = ReconcilePlan::build(
            project,
            environment,
            changes,
            desired,
            &prior,
            &snapshot.pending_deletes,
        );

        info!(
            "Plan for {project}/{environment}: {} to create, {} to update, {} to replace, \
             {} to delete, {} unchanged",
            plan.count(ChangeKind::Create),
            plan.count(ChangeKind::Update),
            plan.count(ChangeKind::Replace),
            plan.count(ChangeKind::Delete),
            plan.count(ChangeKind::Unchanged)
        );
        plan
    }

    /// Runs the steps of `plan` and collects one report entry per resource.
    ///
    /// Returns the report and the resolvers no step settled.
    async fn run_plan(
        &self,
        plan: &ReconcilePlan,
        nodes: &[ResourceNode],
        resolvers: Resolvers,
        journal: &SnapshotJournal,
        operation: RunOperation,
    ) -> (RunReport, Resolvers) {
        let mut report = RunReport::new(&plan.project, &plan.environment, operation);
        let context = StepContext {
            invoker: &self.invoker,
            journal,
            diff: DiffEngine::new(&self.types),
            plan,
            nodes: nodes.iter().map(|n| (n.name.as_str(), n)).collect(),
            leftover_ids: plan
                .steps
                .iter()
                .filter_map(|s| s.target_id.as_deref())
                .collect(),
            resolvers: Mutex::new(resolvers),
        };

        let scheduler = Scheduler::from_engine(&self.engine)
            .with_cancellation(self.invoker.cancellation_token().clone());
        let records = scheduler
            .run(&plan.steps, |index| context.execute(index))
            .await;

        let snapshot = journal.snapshot().await;
        for change in &plan.changes {
            report.push(node_report(change, plan, &records, &snapshot));
        }
        for (step, record) in plan.steps.iter().zip(&records) {
            if step.kind == StepKind::DeletePending {
                report.push(pending_report(step, record));
            }
        }

        info!(
            "{operation} of {}/{} finished: {} changed, {} failed, {} skipped",
            plan.project,
            plan.environment,
            report.changed_resources().len(),
            report.count(NodeStatus::Failed),
            report.count(NodeStatus::Skipped)
        );

        (report, context.resolvers.into_inner())
    }

    async fn load_snapshot(&self, project: &str, environment: &str) -> Result<StateSnapshot> {
        match self.store.load().await? {
            Some(snapshot) => {
                snapshot.check_compatible(project, environment)?;
                debug!(
                    "Loaded snapshot serial {} with {} resources",
                    snapshot.serial,
                    snapshot.resources.len()
                );
                Ok(snapshot)
            }
            None => {
                debug!("No snapshot for {project}/{environment}, starting empty");
                Ok(StateSnapshot::new(project, environment))
            }
        }
    }

    async fn release(&self, lock: &LockInfo) {
        if let Err(err) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {err}", lock.lock_id);
        }
    }
}

/// Everything a step needs while the scheduler runs it.
struct StepContext<'a> {
    invoker: &'a ProviderInvoker,
    journal: &'a SnapshotJournal,
    diff: DiffEngine<'a>,
    plan: &'a ReconcilePlan,
    nodes: HashMap<&'a str, &'a ResourceNode>,
    /// Instances deleted by their own `DeletePending` step.
    leftover_ids: HashSet<&'a str>,
    resolvers: Mutex<Resolvers>,
}

impl<'a> StepContext<'a> {
    async fn execute(&self, index: usize) -> Result<NodeStatus> {
        let step = self
            .plan
            .steps
            .get(index)
            .ok_or_else(|| InfraError::internal(format!("plan has no step {index}")))?;

        match step.kind {
            StepKind::Create => self.create(step).await,
            StepKind::Update => self.update(step).await,
            StepKind::CreateReplacement => self.replace(step).await,
            StepKind::DeleteReplaced => self.delete_replaced(step).await,
            StepKind::Delete => self.delete(step).await,
            StepKind::DeletePending => self.delete_pending(step).await,
        }
    }

    async fn create(&self, step: &PlanStep) -> Result<NodeStatus> {
        let node = self.node(step)?;
        let inputs = resolve_inputs(node).await?;
        let record = self.create_instance(node, inputs).await?;
        info!("Created {} ({})", node.name, record.id);

        self.journal.record(record.clone()).await?;
        self.settle(&record).await;
        Ok(NodeStatus::Created)
    }

    async fn update(&self, step: &PlanStep) -> Result<NodeStatus> {
        let node = self.node(step)?;
        let prior = self.prior(&node.name).await?;
        let inputs = resolve_inputs(node).await?;

        if self.rediff(node, &prior, &inputs) == ChangeKind::Unchanged {
            debug!("{} unchanged once its inputs resolved", node.name);
            self.settle(&prior).await;
            return Ok(NodeStatus::Unchanged);
        }
        self.update_in_place(node, &prior, inputs).await
    }

    async fn replace(&self, step: &PlanStep) -> Result<NodeStatus> {
        let node = self.node(step)?;
        let inputs = resolve_inputs(node).await?;

        // Delete-before-create already removed the old instance.
        let Some(prior) = self.journal.get(&node.name).await else {
            let record = self.create_instance(node, inputs).await?;
            info!("Created replacement {} ({})", node.name, record.id);
            self.journal.record(record.clone()).await?;
            self.settle(&record).await;
            return Ok(NodeStatus::Replaced);
        };

        match self.rediff(node, &prior, &inputs) {
            ChangeKind::Unchanged => {
                debug!("{} unchanged once its inputs resolved", node.name);
                self.settle(&prior).await;
                Ok(NodeStatus::Unchanged)
            }
            ChangeKind::Replace => {
                ensure_unprotected(&node.name, prior.protect || node.options.protect, "replaced")?;
                let record = self.create_instance(node, inputs).await?;
                info!(
                    "Created replacement {} ({} -> {})",
                    node.name, prior.id, record.id
                );
                self.journal
                    .record_replacement(record.clone(), prior.to_pending_delete())
                    .await?;
                self.settle(&record).await;
                Ok(NodeStatus::Replaced)
            }
            ChangeKind::Create | ChangeKind::Update | ChangeKind::Delete => {
                self.update_in_place(node, &prior, inputs).await
            }
        }
    }

    async fn delete_replaced(&self, step: &PlanStep) -> Result<NodeStatus> {
        let policy = self
            .plan
            .change(&step.resource)
            .and_then(|c| c.replacement)
            .unwrap_or_default();

        match policy {
            ReplacementPolicy::DeleteBeforeCreate => {
                let Some(prior) = self.journal.get(&step.resource).await else {
                    return Ok(NodeStatus::Deleted);
                };
                let protected = prior.protect
                    || self
                        .nodes
                        .get(step.resource.as_str())
                        .is_some_and(|n| n.options.protect);
                ensure_unprotected(&prior.name, protected, "replaced")?;

                self.invoker.delete(&deletion_request(&prior)).await?;
                info!("Deleted {} ({}) ahead of its replacement", prior.name, prior.id);
                self.journal.forget(&prior.name).await?;
                Ok(NodeStatus::Deleted)
            }
            ReplacementPolicy::CreateBeforeDelete => {
                let current = self.journal.get(&step.resource).await.map(|r| r.id);
                let superseded: Vec<PendingDelete> = self
                    .journal
                    .pending(&step.resource)
                    .await
                    .into_iter()
                    .filter(|p| current.as_deref() != Some(p.id.as_str()))
                    .filter(|p| !self.leftover_ids.contains(p.id.as_str()))
                    .collect();

                if superseded.is_empty() {
                    debug!("{} kept its instance, nothing to delete", step.resource);
                    return Ok(NodeStatus::Unchanged);
                }
                for old in &superseded {
                    self.delete_superseded(old).await?;
                }
                Ok(NodeStatus::Deleted)
            }
        }
    }

    async fn delete(&self, step: &PlanStep) -> Result<NodeStatus> {
        let Some(prior) = self.journal.get(&step.resource).await else {
            warn!("{} is already gone from the snapshot", step.resource);
            return Ok(NodeStatus::Deleted);
        };
        ensure_unprotected(&prior.name, prior.protect, "deleted")?;

        self.invoker.delete(&deletion_request(&prior)).await?;
        info!("Deleted {} ({})", prior.name, prior.id);
        self.journal.forget(&prior.name).await?;
        Ok(NodeStatus::Deleted)
    }

    async fn delete_pending(&self, step: &PlanStep) -> Result<NodeStatus> {
        let id = step
            .target_id
            .as_deref()
            .ok_or_else(|| InfraError::internal(format!("{step} has no target")))?;
        let old = self
            .journal
            .pending(&step.resource)
            .await
            .into_iter()
            .find(|p| p.id == id);

        if let Some(old) = old {
            self.delete_superseded(&old).await?;
        }
        Ok(NodeStatus::Deleted)
    }

    async fn update_in_place(
        &self,
        node: &ResourceNode,
        prior: &ResourceState,
        inputs: Map<String, Value>,
    ) -> Result<NodeStatus> {
        let inputs = effective_inputs(Some(prior), inputs, &node.options.ignore_changes);
        let request = ResourceRequest::new(&node.type_token, &node.name, inputs)
            .with_id(prior.id.clone())
            .with_old_outputs(prior.outputs.clone());
        let response = self.invoker.update(&request).await?;

        let record = ResourceState::new(
            &node.name,
            &node.type_token,
            &response.id,
            request.properties,
            response.outputs,
            node.dependencies(),
        )
        .with_protect(node.options.protect)
        .created_at(prior.created_at);
        info!("Updated {} ({})", node.name, record.id);

        self.journal.record(record.clone()).await?;
        self.settle(&record).await;
        Ok(NodeStatus::Updated)
    }

    async fn create_instance(
        &self,
        node: &ResourceNode,
        inputs: Map<String, Value>,
    ) -> Result<ResourceState> {
        // One key per step, shared by every retry of this create.
        let key = format!("{}-{}", node.name, Uuid::new_v4().simple());
        let request =
            ResourceRequest::new(&node.type_token, &node.name, inputs).with_idempotency_key(key);
        let response = self.invoker.create(&request).await?;
        Ok(ResourceState::new(
            &node.name,
            &node.type_token,
            &response.id,
            request.properties,
            response.outputs,
            node.dependencies(),
        )
        .with_protect(node.options.protect))
    }

    async fn delete_superseded(&self, old: &PendingDelete) -> Result<()> {
        let request = ResourceRequest::new(&old.type_token, &old.name, Map::new())
            .with_id(old.id.clone())
            .with_old_outputs(old.outputs.clone());
        self.invoker.delete(&request).await?;
        info!("Deleted superseded {} ({})", old.name, old.id);
        self.journal.finish_delete(&old.id).await
    }

    /// Diffs fully resolved inputs against the recorded state.
    fn rediff(
        &self,
        node: &ResourceNode,
        prior: &ResourceState,
        inputs: &Map<String, Value>,
    ) -> ChangeKind {
        let known = inputs
            .iter()
            .map(|(key, value)| (key.clone(), Some(value.clone())))
            .collect();
        self.diff
            .diff(&node.type_token, &node.options, Some(prior), &known)
            .kind
    }

    /// Resolves the outputs cell of `record`'s resource.
    async fn settle(&self, record: &ResourceState) {
        if let Some(resolver) = self.resolvers.lock().await.remove(&record.name) {
            resolver.resolve(record.output_value());
        }
    }

    fn node(&self, step: &PlanStep) -> Result<&'a ResourceNode> {
        self.nodes
            .get(step.resource.as_str())
            .copied()
            .ok_or_else(|| InfraError::internal(format!("'{}' is not declared", step.resource)))
    }

    async fn prior(&self, name: &str) -> Result<ResourceState> {
        self.journal.get(name).await.ok_or_else(|| {
            ReconcileError::MissingState {
                resource: name.to_string(),
            }
            .into()
        })
    }
}

async fn resolve_inputs(node: &ResourceNode) -> Result<Map<String, Value>> {
    node.inputs.resolve().await.map_err(|err| {
        ReconcileError::InputResolution {
            resource: node.name.clone(),
            reason: err.to_string(),
        }
        .into()
    })
}

fn ensure_unprotected(name: &str, protected: bool, action: &str) -> Result<()> {
    if protected {
        return Err(ReconcileError::Protected {
            resource: name.to_string(),
            action: action.to_string(),
        }
        .into());
    }
    Ok(())
}

fn deletion_request(resource: &ResourceState) -> ResourceRequest {
    ResourceRequest::new(&resource.type_token, &resource.name, resource.inputs.clone())
        .with_id(resource.id.clone())
        .with_old_outputs(resource.outputs.clone())
}

/// Rewrites records of unchanged resources whose protection or recorded
/// dependencies changed. No provider call is needed for that.
async fn refresh_records(
    journal: &SnapshotJournal,
    plan: &ReconcilePlan,
    nodes: &[ResourceNode],
) -> Result<()> {
    for node in nodes {
        if plan.change(&node.name).map(|c| c.kind) != Some(ChangeKind::Unchanged) {
            continue;
        }
        let Some(prior) = journal.get(&node.name).await else {
            continue;
        };
        let dependencies = node.dependencies();
        if prior.protect != node.options.protect || prior.dependencies != dependencies {
            let mut record = prior;
            record.protect = node.options.protect;
            record.dependencies = dependencies;
            debug!("Refreshing recorded options of {}", node.name);
            journal.record(record).await?;
        }
    }
    Ok(())
}

async fn resolve_exports(exports: &BTreeMap<String, Output<Value>>, report: &mut RunReport) {
    for (name, output) in exports {
        match output.resolve().await {
            Ok(value) => {
                if output.is_secret() {
                    report.secret_outputs.insert(name.clone());
                }
                report.outputs.insert(name.clone(), value);
            }
            Err(err) => {
                warn!("Output {name} could not be resolved: {err}");
                report.output_errors.insert(name.clone(), err.to_string());
            }
        }
    }
}

async fn record_history(journal: &SnapshotJournal, report: &mut RunReport) {
    let changed = report.changed_resources();
    let entry = match report.error_summary() {
        Some(summary) if !report.is_success() => {
            RunHistoryEntry::failed(report.operation, changed, &summary)
        }
        _ => RunHistoryEntry::new(report.operation, changed),
    };
    if let Err(err) = journal.add_history(entry).await {
        error!("Failed to record run history: {err}");
    }
    report.finish(journal.serial().await);
}

/// Folds the step records of one resource into its report entry.
fn node_report(
    change: &NodeChange,
    plan: &ReconcilePlan,
    records: &[StepRecord<NodeStatus>],
    snapshot: &StateSnapshot,
) -> NodeReport {
    let mut outcome = None;
    let mut failure = None;
    let mut skipped = None;
    let mut sequence: Option<usize> = None;
    let mut duration = Duration::ZERO;

    for (step, record) in plan.steps.iter().zip(records) {
        if step.resource != change.name || step.kind == StepKind::DeletePending {
            continue;
        }
        if let Some(launched) = record.sequence {
            sequence = Some(sequence.map_or(launched, |s| s.min(launched)));
        }
        duration += record.duration;

        match &record.status {
            StepStatus::Succeeded(status) => {
                // The producing step decides how a replacement is reported.
                if !step.is_delete() || outcome.is_none() {
                    outcome = Some(*status);
                }
            }
            StepStatus::Failed(err) => {
                failure.get_or_insert_with(|| err.to_string());
            }
            StepStatus::Skipped(reason) => {
                skipped.get_or_insert_with(|| reason.to_string());
            }
        }
    }

    let (status, error) = match (failure, skipped) {
        (Some(err), _) => (NodeStatus::Failed, Some(err)),
        (None, Some(reason)) => (NodeStatus::Skipped, Some(reason)),
        (None, None) => (outcome.unwrap_or(NodeStatus::Unchanged), None),
    };

    let id = snapshot.get_resource(&change.name).map(|r| r.id.clone());
    let node = NodeReport::new(&change.name, &change.type_token, status)
        .with_id(id)
        .with_timing(sequence, duration);
    match error {
        Some(error) => node.with_error(error),
        None => node,
    }
}

fn pending_report(step: &PlanStep, record: &StepRecord<NodeStatus>) -> NodeReport {
    let (status, error) = match &record.status {
        StepStatus::Succeeded(_) => (NodeStatus::Deleted, None),
        StepStatus::Failed(err) => (NodeStatus::Failed, Some(err.to_string())),
        StepStatus::Skipped(reason) => (NodeStatus::Skipped, Some(reason.to_string())),
    };
    let node = NodeReport::new(&step.resource, &step.type_token, status)
        .with_id(step.target_id.clone())
        .with_timing(record.sequence, record.duration);
    match error {
        Some(error) => node.with_error(error),
        None => node,
    }
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_drift {
            writeln!(f, "Drift detected:")?;
            for resource in &self.drifted_resources {
                writeln!(f, "  - {resource}")?;
            }
            for resource in &self.missing_resources {
                writeln!(f, "  - {resource} (missing)")?;
            }
            for resource in &self.undeployed_resources {
                writeln!(f, "  - {resource} (not deployed)")?;
            }
        } else {
            write!(f, "No drift detected - state is converged")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GraphError, StateError};
    use crate::output::Properties;
    use crate::provider::testing::RecordingProvider;
    use crate::provider::{InMemoryProvider, Operation, ProviderRegistry, RetryPolicy, TypeSpec};
    use crate::state::LocalStateStore;
    use serde_json::json;
    use tempfile::TempDir;

    const RG: &str = "azure-native:resources:ResourceGroup";
    const WORKSPACE: &str = "azure-native:operationalinsights:Workspace";
    const REGISTRY: &str = "azure-native:containerregistry:Registry";
    const ENV: &str = "azure-native:app:ManagedEnvironment";

    struct Harness {
        provider: Arc<RecordingProvider>,
        invoker: Arc<ProviderInvoker>,
        store: Arc<LocalStateStore>,
        _temp: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let provider = Arc::new(RecordingProvider::new(Arc::new(InMemoryProvider::new())));
            let invoker = Arc::new(
                ProviderInvoker::new(ProviderRegistry::single(provider.clone())).with_retry_policy(
                    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
                ),
            );
            Self {
                provider,
                invoker,
                store: Arc::new(LocalStateStore::with_base_dir(temp.path())),
                _temp: temp,
            }
        }

        fn reconciler(&self) -> Reconciler {
            Reconciler::new(self.store.clone(), self.invoker.clone()).with_holder("test-runner")
        }

        fn with_registry_policy(&self, policy: ReplacementPolicy) -> Reconciler {
            self.reconciler().with_types(
                TypeRegistry::new()
                    .with_type(REGISTRY, TypeSpec::immutable(["sku"]).with_replacement(policy)),
            )
        }

        async fn snapshot(&self) -> StateSnapshot {
            self.store.load().await.unwrap().unwrap()
        }

        fn stack(&self, retention: i64, sku: &str) -> Deployment {
            let mut deployment = Deployment::new("node-app", "dev", self.invoker.clone());
            let rg = deployment
                .resource(RG, "rg", Properties::new().with("location", "westeurope"))
                .unwrap();
            let workspace = deployment
                .resource(
                    WORKSPACE,
                    "workspace",
                    Properties::new()
                        .with("resourceGroupName", rg.output("name"))
                        .with("retentionInDays", retention),
                )
                .unwrap();
            deployment
                .resource(
                    REGISTRY,
                    "registry",
                    Properties::new()
                        .with("resourceGroupName", rg.output("name"))
                        .with("sku", sku),
                )
                .unwrap();
            deployment
                .resource(
                    ENV,
                    "env",
                    Properties::new()
                        .with("resourceGroupName", rg.output("name"))
                        .with("workspaceId", workspace.id()),
                )
                .unwrap();
            deployment.export("workspaceId", workspace.id());
            deployment
        }
    }

    fn position(names: &[String], name: &str) -> usize {
        names.iter().position(|n| n == name).unwrap()
    }

    #[tokio::test]
    async fn test_apply_creates_in_dependency_order() {
        let harness = Harness::new();
        let report = harness
            .reconciler()
            .apply(harness.stack(30, "Basic"))
            .await
            .unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.count(NodeStatus::Created), 4);

        let creates = harness.provider.names_for(Operation::Create);
        assert_eq!(position(&creates, "rg"), 0);
        assert!(position(&creates, "workspace") < position(&creates, "env"));

        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.resources.len(), 4);
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(
            snapshot.get_resource("env").unwrap().inputs["workspaceId"],
            json!(snapshot.get_resource("workspace").unwrap().id)
        );
        assert_eq!(
            report.outputs["workspaceId"],
            json!(snapshot.get_resource("workspace").unwrap().id)
        );
        assert_eq!(snapshot.outputs, report.outputs);
        assert_eq!(report.serial, snapshot.serial);
    }

    #[tokio::test]
    async fn test_rerun_is_unchanged() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();
        reconciler.apply(harness.stack(30, "Basic")).await.unwrap();
        let calls = harness.provider.calls().len();

        let plan = reconciler.preview(harness.stack(30, "Basic")).await.unwrap();
        assert!(!plan.has_changes());
        assert_eq!(plan.count(ChangeKind::Unchanged), 4);

        let report = reconciler.apply(harness.stack(30, "Basic")).await.unwrap();
        assert_eq!(report.count(NodeStatus::Unchanged), 4);
        assert!(report.changed_resources().is_empty());
        assert_eq!(harness.provider.calls().len(), calls);
        assert!(report.outputs["workspaceId"].is_string());
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_provider_call() {
        let harness = Harness::new();
        let mut deployment = Deployment::new("node-app", "dev", harness.invoker.clone());
        let later = deployment.reference("b");
        let a = deployment
            .resource(RG, "a", Properties::new().with("peer", later))
            .unwrap();
        deployment
            .resource(RG, "b", Properties::new().with("peer", a.id()))
            .unwrap();

        let result = harness.reconciler().apply(deployment).await;
        assert!(matches!(
            result,
            Err(InfraError::Graph(GraphError::CyclicDependency { .. }))
        ));
        assert!(harness.provider.calls().is_empty());
        assert!(harness.store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dependent_of_failed_node_is_skipped() {
        let harness = Harness::new();
        harness.provider.fail_always(Operation::Create, "workspace");

        let report = harness
            .reconciler()
            .apply(harness.stack(30, "Basic"))
            .await
            .unwrap();

        assert_eq!(report.status("rg"), Some(NodeStatus::Created));
        assert_eq!(report.status("registry"), Some(NodeStatus::Created));
        assert_eq!(report.status("workspace"), Some(NodeStatus::Failed));
        assert_eq!(report.status("env"), Some(NodeStatus::Skipped));
        assert!(report.node("env").unwrap().error.as_deref().unwrap().contains("workspace"));
        assert!(report.output_errors.contains_key("workspaceId"));
        assert_eq!(report.exit_code(), 1);
        assert!(!harness.provider.names_for(Operation::Create).contains(&String::from("env")));

        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.resource_names(), vec!["registry", "rg"]);
        assert!(!snapshot.history[0].success);
    }

    #[tokio::test]
    async fn test_snapshot_after_failure_converges_on_rerun() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();
        harness.provider.fail_next(
            Operation::Create,
            "workspace",
            vec![ProviderError::Rejected {
                status: 400,
                message: String::from("quota"),
            }],
        );
        let first = reconciler.apply(harness.stack(30, "Basic")).await.unwrap();
        assert_eq!(first.exit_code(), 1);
        let rg_id = harness.snapshot().await.get_resource("rg").unwrap().id.clone();

        let second = reconciler.apply(harness.stack(30, "Basic")).await.unwrap();
        assert_eq!(second.exit_code(), 0);
        assert_eq!(second.status("rg"), Some(NodeStatus::Unchanged));
        assert_eq!(second.status("registry"), Some(NodeStatus::Unchanged));
        assert_eq!(second.status("workspace"), Some(NodeStatus::Created));
        assert_eq!(second.status("env"), Some(NodeStatus::Created));
        assert_eq!(harness.snapshot().await.get_resource("rg").unwrap().id, rg_id);
        assert_eq!(harness.provider.inner().resource_count(), 4);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let harness = Harness::new();
        harness.provider.fail_next(
            Operation::Create,
            "workspace",
            vec![
                ProviderError::Unavailable {
                    status: 503,
                    message: String::from("busy"),
                },
                ProviderError::Timeout {
                    operation: String::from("create"),
                },
            ],
        );

        let report = harness
            .reconciler()
            .apply(harness.stack(30, "Basic"))
            .await
            .unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.count(NodeStatus::Created), 4);
        let attempts = harness
            .provider
            .names_for(Operation::Create)
            .iter()
            .filter(|n| n.as_str() == "workspace")
            .count();
        assert_eq!(attempts, 3);
        assert_eq!(harness.provider.inner().resource_count(), 4);
    }

    #[tokio::test]
    async fn test_retried_create_after_lost_response_makes_one_instance() {
        let harness = Harness::new();
        harness.provider.fail_after_commit(
            Operation::Create,
            "rg",
            vec![ProviderError::Timeout {
                operation: String::from("create"),
            }],
        );

        let report = harness
            .reconciler()
            .apply(harness.stack(30, "Basic"))
            .await
            .unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.status("rg"), Some(NodeStatus::Created));
        let live = harness.provider.inner().ids_named("rg");
        assert_eq!(live.len(), 1);
        assert_eq!(harness.snapshot().await.get_resource("rg").unwrap().id, live[0]);
        assert_eq!(harness.provider.inner().resource_count(), 4);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fail_the_node() {
        let harness = Harness::new();
        harness.provider.fail_next(
            Operation::Create,
            "registry",
            vec![ProviderError::network("reset"); 3],
        );

        let report = harness
            .reconciler()
            .apply(harness.stack(30, "Basic"))
            .await
            .unwrap();

        assert_eq!(report.status("registry"), Some(NodeStatus::Failed));
        assert!(report
            .node("registry")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("Maximum retry attempts"));
        assert_eq!(report.status("env"), Some(NodeStatus::Created));
    }

    #[tokio::test]
    async fn test_update_in_place_settles_dependents() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();
        reconciler.apply(harness.stack(30, "Basic")).await.unwrap();
        let before = harness.snapshot().await;

        let plan = reconciler.preview(harness.stack(60, "Basic")).await.unwrap();
        assert_eq!(plan.change("workspace").unwrap().kind, ChangeKind::Update);
        assert_eq!(plan.change("env").unwrap().kind, ChangeKind::Update);

        let report = reconciler.apply(harness.stack(60, "Basic")).await.unwrap();
        assert_eq!(report.status("workspace"), Some(NodeStatus::Updated));
        assert_eq!(report.status("env"), Some(NodeStatus::Unchanged));
        assert_eq!(harness.provider.names_for(Operation::Update), vec!["workspace"]);

        let after = harness.snapshot().await;
        let workspace = after.get_resource("workspace").unwrap();
        assert_eq!(workspace.inputs["retentionInDays"], json!(60));
        assert_eq!(workspace.id, before.get_resource("workspace").unwrap().id);
        assert_eq!(
            workspace.created_at,
            before.get_resource("workspace").unwrap().created_at
        );
    }

    #[tokio::test]
    async fn test_ignored_changes_are_not_applied() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();
        let declare = |retention: i64| {
            let mut deployment = Deployment::new("node-app", "dev", harness.invoker.clone());
            deployment
                .resource_with(
                    WORKSPACE,
                    "workspace",
                    Properties::new().with("retentionInDays", retention),
                    crate::deployment::ResourceOptions::new().ignore_changes("retentionInDays"),
                )
                .unwrap();
            deployment
        };

        reconciler.apply(declare(30)).await.unwrap();
        let report = reconciler.apply(declare(90)).await.unwrap();
        assert_eq!(report.status("workspace"), Some(NodeStatus::Unchanged));
        assert!(harness.provider.names_for(Operation::Update).is_empty());
    }

    #[tokio::test]
    async fn test_create_before_delete_replacement() {
        let harness = Harness::new();
        let reconciler = harness.with_registry_policy(ReplacementPolicy::CreateBeforeDelete);
        reconciler.apply(harness.stack(30, "Basic")).await.unwrap();
        let old_id = harness.snapshot().await.get_resource("registry").unwrap().id.clone();

        let plan = reconciler.preview(harness.stack(30, "Premium")).await.unwrap();
        let change = plan.change("registry").unwrap();
        assert_eq!(change.kind, ChangeKind::Replace);
        assert_eq!(change.replacement, Some(ReplacementPolicy::CreateBeforeDelete));

        let report = reconciler.apply(harness.stack(30, "Premium")).await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.status("registry"), Some(NodeStatus::Replaced));

        let calls = harness.provider.calls();
        let create = calls
            .iter()
            .rposition(|c| *c == (Operation::Create, String::from("registry")))
            .unwrap();
        let delete = calls
            .iter()
            .position(|c| *c == (Operation::Delete, String::from("registry")))
            .unwrap();
        assert!(create < delete);

        let snapshot = harness.snapshot().await;
        let new_id = &snapshot.get_resource("registry").unwrap().id;
        assert_ne!(new_id, &old_id);
        assert!(snapshot.pending_deletes.is_empty());
        assert!(harness.provider.inner().get(&old_id).is_none());
        assert!(harness.provider.inner().get(new_id).is_some());
    }

    #[tokio::test]
    async fn test_delete_before_create_replacement() {
        let harness = Harness::new();
        let reconciler = harness.with_registry_policy(ReplacementPolicy::DeleteBeforeCreate);
        let declare = |sku: &str| {
            let mut deployment = Deployment::new("node-app", "dev", harness.invoker.clone());
            let registry = deployment
                .resource(
                    REGISTRY,
                    "registry",
                    Properties::new().with("name", "acrnodeapp").with("sku", sku),
                )
                .unwrap();
            deployment
                .resource(
                    "azure-native:app:ContainerApp",
                    "app",
                    Properties::new().with("registryName", registry.output("name")),
                )
                .unwrap();
            deployment
        };

        reconciler.apply(declare("Basic")).await.unwrap();
        let report = reconciler.apply(declare("Premium")).await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.status("registry"), Some(NodeStatus::Replaced));

        let calls = harness.provider.calls();
        let delete = calls
            .iter()
            .position(|c| *c == (Operation::Delete, String::from("registry")))
            .unwrap();
        let create = calls
            .iter()
            .rposition(|c| *c == (Operation::Create, String::from("registry")))
            .unwrap();
        assert!(delete < create);

        let snapshot = harness.snapshot().await;
        assert_eq!(
            snapshot.get_resource("registry").unwrap().inputs["sku"],
            json!("Premium")
        );
        assert!(snapshot.pending_deletes.is_empty());
        assert_eq!(harness.provider.inner().resource_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_superseded_delete_is_retried_next_run() {
        let harness = Harness::new();
        let reconciler = harness.with_registry_policy(ReplacementPolicy::CreateBeforeDelete);
        reconciler.apply(harness.stack(30, "Basic")).await.unwrap();
        let old_id = harness.snapshot().await.get_resource("registry").unwrap().id.clone();

        harness.provider.fail_next(
            Operation::Delete,
            "registry",
            vec![ProviderError::Rejected {
                status: 409,
                message: String::from("in use"),
            }],
        );
        let report = reconciler.apply(harness.stack(30, "Premium")).await.unwrap();
        assert_eq!(report.status("registry"), Some(NodeStatus::Failed));
        assert_eq!(harness.snapshot().await.pending_deletes[0].id, old_id);

        let report = reconciler.apply(harness.stack(30, "Premium")).await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.status("registry"), Some(NodeStatus::Unchanged));
        let leftover = report
            .nodes
            .iter()
            .find(|n| n.id.as_deref() == Some(old_id.as_str()))
            .unwrap();
        assert_eq!(leftover.status, NodeStatus::Deleted);
        assert!(harness.snapshot().await.pending_deletes.is_empty());
        assert!(harness.provider.inner().get(&old_id).is_none());
    }

    #[tokio::test]
    async fn test_protected_resource_is_not_deleted() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();
        let mut deployment = Deployment::new("node-app", "dev", harness.invoker.clone());
        deployment
            .resource_with(
                RG,
                "rg",
                Properties::new().with("location", "westeurope"),
                crate::deployment::ResourceOptions::new().protect(),
            )
            .unwrap();
        reconciler.apply(deployment).await.unwrap();

        let empty = Deployment::new("node-app", "dev", harness.invoker.clone());
        let report = reconciler.apply(empty).await.unwrap();
        assert_eq!(report.status("rg"), Some(NodeStatus::Failed));
        assert!(report
            .node("rg")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("protected"));
        assert!(harness.provider.names_for(Operation::Delete).is_empty());
        assert!(harness.snapshot().await.get_resource("rg").is_some());
    }

    #[tokio::test]
    async fn test_removed_resources_are_deleted_dependents_first() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();
        reconciler.apply(harness.stack(30, "Basic")).await.unwrap();

        let mut deployment = Deployment::new("node-app", "dev", harness.invoker.clone());
        deployment
            .resource(RG, "rg", Properties::new().with("location", "westeurope"))
            .unwrap();
        let report = reconciler.apply(deployment).await.unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.status("rg"), Some(NodeStatus::Unchanged));
        assert_eq!(report.count(NodeStatus::Deleted), 3);
        let deletes = harness.provider.names_for(Operation::Delete);
        assert!(position(&deletes, "env") < position(&deletes, "workspace"));
        assert_eq!(harness.snapshot().await.resource_names(), vec!["rg"]);
    }

    #[tokio::test]
    async fn test_destroy_is_reverse_of_creation() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();
        let mut deployment = Deployment::new("node-app", "dev", harness.invoker.clone());
        let mut previous: Option<Output<Value>> = None;
        for name in ["a", "b", "c", "d"] {
            let mut inputs = Properties::new().with("tier", name);
            if let Some(upstream) = previous.take() {
                inputs.insert("upstream", upstream);
            }
            let handle = deployment.resource(RG, name, inputs).unwrap();
            previous = Some(handle.id());
        }
        reconciler.apply(deployment).await.unwrap();

        let report = reconciler.destroy("node-app", "dev").await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.count(NodeStatus::Deleted), 4);

        let mut creates = harness.provider.names_for(Operation::Create);
        creates.reverse();
        assert_eq!(harness.provider.names_for(Operation::Delete), creates);

        let snapshot = harness.snapshot().await;
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.history.last().unwrap().operation, RunOperation::Destroy);
        assert_eq!(harness.provider.inner().resource_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_everything() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();
        reconciler.cancellation_token().cancel();

        let report = reconciler.apply(harness.stack(30, "Basic")).await.unwrap();
        assert_eq!(report.count(NodeStatus::Skipped), 4);
        assert_eq!(report.exit_code(), 1);
        assert!(harness.provider.calls().is_empty());
        assert!(report.node("rg").unwrap().error.as_deref().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_during_provider_call_skips_dependents() {
        let temp = TempDir::new().unwrap();
        let provider = Arc::new(
            RecordingProvider::new(Arc::new(InMemoryProvider::new()))
                .with_delay(Duration::from_secs(30)),
        );
        let invoker = Arc::new(ProviderInvoker::new(ProviderRegistry::single(provider.clone())));
        let store = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let reconciler = Reconciler::new(store.clone(), invoker.clone());

        let mut deployment = Deployment::new("node-app", "dev", invoker);
        let rg = deployment
            .resource(RG, "rg", Properties::new().with("location", "westeurope"))
            .unwrap();
        deployment
            .resource(
                REGISTRY,
                "registry",
                Properties::new().with("resourceGroupName", rg.output("name")),
            )
            .unwrap();

        let token = reconciler.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let report = tokio::time::timeout(Duration::from_secs(5), reconciler.apply(deployment))
            .await
            .expect("cancellation did not interrupt the run")
            .unwrap();

        assert_eq!(report.status("rg"), Some(NodeStatus::Failed));
        assert!(report
            .node("rg")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains(&ProviderError::Cancelled.to_string()));
        assert_eq!(report.status("registry"), Some(NodeStatus::Skipped));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(provider.names_for(Operation::Create), vec![String::from("rg")]);
        assert_eq!(provider.inner().resource_count(), 0);
        assert!(store.get_lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let temp = TempDir::new().unwrap();
        let provider = Arc::new(
            RecordingProvider::new(Arc::new(InMemoryProvider::new()))
                .with_delay(Duration::from_millis(20)),
        );
        let invoker = Arc::new(ProviderInvoker::new(ProviderRegistry::single(provider.clone())));
        let reconciler = Reconciler::new(
            Arc::new(LocalStateStore::with_base_dir(temp.path())),
            invoker.clone(),
        )
        .with_engine(EngineConfig {
            parallelism: 2,
            ..EngineConfig::default()
        });

        let mut deployment = Deployment::new("node-app", "dev", invoker);
        for i in 0..6_i64 {
            deployment
                .resource(RG, &format!("rg{i}"), Properties::new().with("index", i))
                .unwrap();
        }
        let report = reconciler.apply(deployment).await.unwrap();

        assert_eq!(report.count(NodeStatus::Created), 6);
        assert_eq!(provider.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_aborts() {
        let harness = Harness::new();
        harness.store.acquire_lock("other-host").await.unwrap();

        let result = harness.reconciler().apply(harness.stack(30, "Basic")).await;
        assert!(matches!(
            result,
            Err(InfraError::State(StateError::LockedByOther { .. }))
        ));
        assert!(harness.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_after_run() {
        let harness = Harness::new();
        harness
            .reconciler()
            .apply(harness.stack(30, "Basic"))
            .await
            .unwrap();
        assert!(!harness.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_check_drift() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();
        reconciler.apply(harness.stack(30, "Basic")).await.unwrap();

        let drift = reconciler.check_drift(&harness.stack(30, "Basic")).await.unwrap();
        assert!(drift.is_converged());
        assert_eq!(drift.total_resources, 4);
        assert_eq!(drift.observed_count, 4);

        let registry_id = harness.snapshot().await.get_resource("registry").unwrap().id.clone();
        harness.provider.inner().forget(&registry_id);

        let drift = reconciler.check_drift(&harness.stack(30, "Basic")).await.unwrap();
        assert!(!drift.is_converged());
        assert_eq!(drift.missing_resources, vec!["registry"]);
        assert_eq!(drift.observed_count, 3);
    }

    #[tokio::test]
    async fn test_demo_stack_converges() {
        let config = crate::config::ConfigParser::new()
            .parse_yaml(include_str!("../demos/azure-container-app.stack.yaml"), None)
            .unwrap();
        crate::config::ConfigValidator::new().validate(&config).unwrap();

        let provider = Arc::new(
            InMemoryProvider::new()
                .with_function("azure-native:operationalinsights:getSharedKeys", |args| {
                    Ok(json!({ "primarySharedKey": format!("key-{}", args["workspaceName"]) }))
                })
                .with_function("azure-native:containerregistry:listRegistryCredentials", |args| {
                    Ok(json!({
                        "username": args["registryName"],
                        "passwords": [{ "name": "password", "value": "s3cret" }],
                    }))
                })
                .with_function("azure-native:authorization:getClientConfig", |_| {
                    Ok(json!({ "subscriptionId": "0000-sub" }))
                })
                .with_output_hook(
                    "azure-native:managedidentity:UserAssignedIdentity",
                    |request, outputs| {
                        let principal = format!("principal-{}", request.name);
                        outputs.insert("principalId".into(), json!(principal));
                    },
                )
                .with_output_hook(WORKSPACE, |request, outputs| {
                    outputs.insert("customerId".into(), json!(format!("cust-{}", request.name)));
                })
                .with_output_hook(REGISTRY, |request, outputs| {
                    let server = format!("{}.azurecr.io", request.name);
                    outputs.insert("loginServer".into(), json!(server));
                })
                .with_output_hook("azure-native:app:ContainerApp", |request, outputs| {
                    outputs.insert(
                        "latestRevisionFqdn".into(),
                        json!(format!("{}.westeurope.azurecontainerapps.io", request.name)),
                    );
                }),
        );
        let invoker = Arc::new(
            ProviderInvoker::new(ProviderRegistry::single(provider.clone()))
                .with_retry_policy(RetryPolicy::from_engine(&config.engine)),
        );
        let temp = TempDir::new().unwrap();
        let store = Arc::new(LocalStateStore::for_stack(temp.path(), "node-app", "dev"));
        let reconciler = Reconciler::for_stack(&config, store.clone(), invoker.clone());

        let first = reconciler
            .apply(Deployment::from_config(&config, invoker.clone()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.exit_code(), 0, "{:?}", first.error_summary());
        assert_eq!(first.count(NodeStatus::Created), 9);
        assert_eq!(provider.resource_count(), 9);
        assert!(first.outputs["url"].as_str().unwrap().starts_with("https://"));
        assert!(first.secret_outputs.contains("workspaceKey"));

        let snapshot = store.load().await.unwrap().unwrap();
        let resource = |name: &str| snapshot.get_resource(name).unwrap();
        let login_server = resource("registry").outputs["loginServer"].clone();
        let storage_name = resource("newsto1").outputs["name"].as_str().unwrap().to_string();
        let rg_name = resource("rg").outputs["name"].as_str().unwrap().to_string();

        let role = &resource("roleAssignment").inputs;
        assert_eq!(role["principalId"], json!("principal-nodeAppIdentity"));
        let scope = format!(
            "/subscriptions/0000-sub/resourceGroups/{rg_name}/providers/\
             Microsoft.Storage/storageAccounts/{storage_name}"
        );
        assert_eq!(role["scope"], json!(scope));
        assert!(role["roleDefinitionId"]
            .as_str()
            .unwrap()
            .starts_with("/subscriptions/0000-sub/"));

        let image = &resource("node-app").inputs;
        let image_name = format!("{}/node-app:v1.0.0", login_server.as_str().unwrap());
        assert_eq!(image["imageName"], json!(image_name));
        assert_eq!(image["registry"]["password"], json!("s3cret"));

        let app = &resource("app").inputs;
        assert_eq!(app["template"]["containers"][0]["image"], json!(image_name));
        let configuration = &app["configuration"];
        assert_eq!(configuration["registries"][0]["username"], image["registry"]["username"]);
        assert_eq!(configuration["registries"][0]["passwordSecretRef"], json!("pwd"));
        assert_eq!(configuration["secrets"][0], json!({ "name": "pwd", "value": "s3cret" }));

        let second = reconciler
            .apply(Deployment::from_config(&config, invoker.clone()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.exit_code(), 0);
        assert_eq!(second.count(NodeStatus::Unchanged), 9);
        assert_eq!(second.outputs["url"], first.outputs["url"]);

        let destroyed = reconciler.destroy("node-app", "dev").await.unwrap();
        assert_ne!(destroyed.exit_code(), 0);
        assert_eq!(destroyed.status("rg"), Some(NodeStatus::Failed));
        assert_eq!(destroyed.count(NodeStatus::Deleted), 8);
        assert_eq!(provider.resource_count(), 1);
    }
}
