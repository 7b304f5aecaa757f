//! Plan executor.
//!
//! Operations run as soon as every operation they depend on has settled,
//! bounded by a semaphore. Each success is written to state before any
//! dependent is scheduled. A failure marks every transitive dependent as
//! skipped while independent operations carry on.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RetryPolicy, StackHasher};
use crate::error::{ProviderError, Result};
use crate::graph::{NodeStatus, Outputs, ResourceGraph, ResourceId};
use crate::provider::{Provider, ProviderRegistry, ProviderRequest};
use crate::state::{RunSession, StackState, StateRecord};

use super::plan::{OperationKind, Plan, PlannedOperation};

/// Executor for plans.
#[derive(Debug)]
pub struct PlanExecutor {
    registry: ProviderRegistry,
    retry: RetryPolicy,
    concurrency: usize,
}

/// How a single operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationOutcome {
    /// The resource was created.
    Created,
    /// The resource was updated.
    Updated,
    /// The resource was deleted.
    Deleted,
    /// The resolved properties matched the record; no provider call.
    Unchanged,
    /// The operation was attempted and failed.
    Failed {
        /// Provider error or other cause.
        reason: String,
    },
    /// The operation was never attempted because something it needed failed.
    Skipped {
        /// The upstream failure.
        reason: String,
        /// Dependency chain from the failed operation to this one.
        path: Vec<String>,
    },
    /// The run was cancelled before the operation started.
    NotAttempted,
}

/// Result of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    /// Plan index.
    pub index: usize,
    /// Operation kind.
    pub kind: OperationKind,
    /// Resource identity.
    pub id: ResourceId,
    /// Outcome.
    #[serde(flatten)]
    pub outcome: OperationOutcome,
    /// Provider calls made.
    pub attempts: u32,
    /// Wall time spent, in milliseconds.
    pub duration_ms: u64,
}

/// Result of executing a whole plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    /// Per-operation results, in plan order.
    pub operations: Vec<OperationReport>,
    /// Resources created.
    pub created: usize,
    /// Resources updated.
    pub updated: usize,
    /// Resources deleted.
    pub deleted: usize,
    /// Resources left as they were, planned or not.
    pub unchanged: usize,
    /// Operations that failed.
    pub failed: usize,
    /// Operations skipped after an upstream failure.
    pub skipped: usize,
    /// Operations not started because the run was cancelled.
    pub not_attempted: usize,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Total wall time, in milliseconds.
    pub duration_ms: u64,
}

/// An operation ready to hand to a provider.
struct Job {
    request: ProviderRequest,
    provider: Arc<dyn Provider>,
    previous: Option<StateRecord>,
    dependencies: Vec<String>,
    properties_hash: String,
    /// Only the recorded dependencies changed; rewrite the record without
    /// calling the provider.
    refresh_only: bool,
}

/// How an operation settled, before it is turned into a report.
enum Settled {
    Applied(Outputs),
    Unchanged,
    Failed(String),
    NotAttempted,
}

struct Finished {
    settled: Settled,
    attempts: u32,
    elapsed: Duration,
}

/// Bookkeeping for one execution.
struct Progress<'a> {
    plan: &'a Plan,
    graph: &'a mut ResourceGraph,
    waiting_on: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    reports: Vec<Option<OperationReport>>,
    ready: BTreeSet<usize>,
}

impl PlanExecutor {
    /// Creates an executor running at most `concurrency` operations at once.
    #[must_use]
    pub fn new(registry: ProviderRegistry, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            registry,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Returns the concurrency limit.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Executes a plan, updating node outputs and statuses in `graph`.
    ///
    /// Never fails as a whole: provider and state errors are reported per
    /// operation in the returned report.
    pub async fn execute(
        &self,
        plan: Plan,
        graph: &mut ResourceGraph,
        session: Arc<RunSession>,
    ) -> ExecutionReport {
        let started = Instant::now();
        info!(
            "Executing plan with {} operations (concurrency {})",
            plan.len(),
            self.concurrency
        );

        let snapshot = session.snapshot().await;
        seed_graph(graph, &snapshot, &plan);

        let cancel = session.cancellation().clone();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut running: HashMap<Id, usize> = HashMap::new();
        let mut progress = Progress::new(&plan, graph);

        loop {
            while !cancel.is_cancelled() {
                let Some(index) = progress.ready.pop_first() else {
                    break;
                };

                match self.prepare(&plan.operations[index], progress.graph, &snapshot) {
                    Ok(job) => {
                        debug!("Dispatching {}", plan.operations[index].description());
                        let handle = tasks.spawn(run_job(
                            job,
                            self.retry.clone(),
                            Arc::clone(&semaphore),
                            Arc::clone(&session),
                        ));
                        running.insert(handle.id(), index);
                    }
                    Err(settled) => progress.settle(index, settled, 0, Duration::ZERO),
                }
            }

            match tasks.join_next_with_id().await {
                Some(Ok((id, finished))) => {
                    if let Some(index) = running.remove(&id) {
                        progress.settle(index, finished.settled, finished.attempts, finished.elapsed);
                    }
                }
                Some(Err(e)) => {
                    if let Some(index) = running.remove(&e.id()) {
                        error!("Executor task for operation {index} died: {e}");
                        progress.settle(index, Settled::Failed(task_failure(e)), 1, Duration::ZERO);
                    }
                }
                None => break,
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!("Run cancelled, remaining operations were not attempted");
        }

        let report = progress.finish(cancelled, started.elapsed());
        info!("{report}");
        report
    }

    /// Resolves an operation's properties and builds its provider request.
    ///
    /// Returns `Err` when the operation settles without a provider call.
    fn prepare(
        &self,
        operation: &PlannedOperation,
        graph: &ResourceGraph,
        snapshot: &StackState,
    ) -> std::result::Result<Job, Settled> {
        let (_, provider) = self
            .registry
            .resolve(&operation.id.resource_type)
            .map_err(|e| Settled::Failed(e.to_string()))?;
        let previous = snapshot.get(operation.name()).cloned();

        let (request, dependencies, refresh_only) = match operation.kind {
            OperationKind::Delete => {
                let request = ProviderRequest::delete(
                    operation.id.clone(),
                    operation.physical_id.clone().unwrap_or_default(),
                    operation.before.clone().unwrap_or_default(),
                );
                (request, Vec::new(), false)
            }
            OperationKind::Create | OperationKind::Update => {
                let Some(node) = operation.node else {
                    return Err(Settled::Failed(format!("{} has no declared node", operation.id)));
                };
                let Some((properties, unknown)) = graph.resolve_node(node) else {
                    return Err(Settled::Failed(format!("{} has no declared node", operation.id)));
                };
                if !unknown.is_empty() {
                    let refs: Vec<String> = unknown.iter().map(ToString::to_string).collect();
                    return Err(Settled::Failed(format!(
                        "unresolved reference after apply: {}",
                        refs.join(", ")
                    )));
                }

                let dependencies = graph.dependency_names(node);
                let mut refresh_only = false;
                let request = match (&operation.kind, &previous) {
                    (OperationKind::Update, Some(record)) => {
                        if record.properties == properties
                            && record.id.resource_type == operation.id.resource_type
                        {
                            if record.has_dependencies(&dependencies) {
                                debug!("{} resolved to its recorded properties", operation.id);
                                return Err(Settled::Unchanged);
                            }
                            refresh_only = true;
                        }
                        ProviderRequest::update(
                            operation.id.clone(),
                            record.physical_id.clone(),
                            properties,
                            record.properties.clone(),
                        )
                    }
                    _ => ProviderRequest::create(operation.id.clone(), properties),
                };
                (request, dependencies, refresh_only)
            }
        };

        let properties_hash = StackHasher::new().hash_properties(&request.properties);
        Ok(Job {
            request,
            provider,
            previous,
            dependencies,
            properties_hash,
            refresh_only,
        })
    }
}

/// Loads recorded outputs into the graph so references to resources that
/// are not planned resolve at dispatch.
fn seed_graph(graph: &mut ResourceGraph, snapshot: &StackState, plan: &Plan) {
    let recorded: Vec<(usize, Outputs)> = graph
        .nodes()
        .iter()
        .filter_map(|n| snapshot.get(n.name()).map(|r| (n.index, r.to_outputs())))
        .collect();
    for (index, outputs) in recorded {
        graph.set_outputs(index, outputs);
    }

    for name in plan.unchanged() {
        if let Some(index) = graph.index_of(name) {
            graph.set_status(index, NodeStatus::Unchanged);
        }
    }
}

async fn run_job(
    job: Job,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    session: Arc<RunSession>,
) -> Finished {
    let cancel = session.cancellation().clone();
    let permit = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        permit = semaphore.acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        return Finished {
            settled: Settled::NotAttempted,
            attempts: 0,
            elapsed: Duration::ZERO,
        };
    };

    let started = Instant::now();
    if job.refresh_only {
        let settled = match refresh_dependencies(&job, &session).await {
            Ok(()) => Settled::Unchanged,
            Err(e) => Settled::Failed(format!("state write failed: {e}")),
        };
        return Finished {
            settled,
            attempts: 0,
            elapsed: started.elapsed(),
        };
    }

    let (result, attempts) = call_with_retry(&job, &retry, &cancel).await;

    let settled = match result {
        Ok(outputs) => match persist(&job, &outputs, &session).await {
            Ok(()) => Settled::Applied(outputs),
            Err(e) => {
                error!("{} was applied but its record could not be written: {e}", job.request.id);
                Settled::Failed(format!("state write failed: {e}"))
            }
        },
        Err(e) => Settled::Failed(e.to_string()),
    };

    Finished {
        settled,
        attempts,
        elapsed: started.elapsed(),
    }
}

/// Calls the provider, retrying transient errors per the policy.
///
/// Every attempt runs in its own task so a panicking provider only fails
/// the one operation.
async fn call_with_retry(
    job: &Job,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> (std::result::Result<Outputs, ProviderError>, u32) {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let provider = Arc::clone(&job.provider);
        let request = job.request.clone();
        let result = match tokio::spawn(async move { provider.apply(&request).await }).await {
            Ok(result) => result,
            Err(e) => Err(ProviderError::Aborted {
                message: task_failure(e),
            }),
        };

        match result {
            Ok(outputs) => return (Ok(outputs), attempt),
            Err(e) if e.is_retryable() && attempt < max_attempts && !cancel.is_cancelled() => {
                let delay = e
                    .retry_after()
                    .map_or_else(|| retry.backoff(attempt), |asked| asked.min(retry.max_backoff()));
                warn!(
                    "{} attempt {attempt}/{max_attempts} failed: {e}; retrying in {delay:?}",
                    job.request.id
                );
                tokio::select! {
                    () = cancel.cancelled() => return (Err(e), attempt),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

/// Writes the outcome of a successful provider call to state.
async fn persist(job: &Job, outputs: &Outputs, session: &RunSession) -> Result<()> {
    let name = &job.request.id.name;
    let guard = session.record_locks().lock(name).await;

    if job.request.operation == OperationKind::Delete {
        return session.delete_record(&guard, name).await;
    }

    let record = StateRecord::new(
        job.request.id.clone(),
        outputs.clone(),
        job.request.properties.clone(),
        job.dependencies.clone(),
        job.properties_hash.clone(),
    )
    .replacing(job.previous.as_ref());
    session.save_record(&guard, record).await
}

/// Rewrites a record whose properties still match with its current
/// dependencies, so deletes are ordered by the edges that exist now.
async fn refresh_dependencies(job: &Job, session: &RunSession) -> Result<()> {
    let Some(previous) = &job.previous else {
        return Ok(());
    };
    let guard = session.record_locks().lock(&previous.id.name).await;
    debug!(
        "{} now depends on [{}]",
        previous.id,
        job.dependencies.join(", ")
    );

    let mut record = previous.clone();
    record.dependencies.clone_from(&job.dependencies);
    session.save_record(&guard, record).await
}

fn task_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return String::from("provider task was cancelled");
    }

    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map_or_else(
            || String::from("provider panicked"),
            |message| format!("provider panicked: {message}"),
        )
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl<'a> Progress<'a> {
    fn new(plan: &'a Plan, graph: &'a mut ResourceGraph) -> Self {
        let n = plan.operations.len();
        let mut dependents = vec![Vec::new(); n];
        for (index, operation) in plan.operations.iter().enumerate() {
            for &dependency in &operation.dependencies {
                if let Some(list) = dependents.get_mut(dependency) {
                    list.push(index);
                }
            }
        }

        let waiting_on: Vec<usize> = plan.operations.iter().map(|o| o.dependencies.len()).collect();
        let ready = (0..n).filter(|&i| waiting_on[i] == 0).collect();

        Self {
            plan,
            graph,
            waiting_on,
            dependents,
            reports: (0..n).map(|_| None).collect(),
            ready,
        }
    }

    fn settle(&mut self, index: usize, settled: Settled, attempts: u32, elapsed: Duration) {
        let plan = self.plan;
        let operation = &plan.operations[index];

        let outcome = match settled {
            Settled::Applied(outputs) => {
                let (outcome, status) = match operation.kind {
                    OperationKind::Create => (OperationOutcome::Created, NodeStatus::Created),
                    OperationKind::Update => (OperationOutcome::Updated, NodeStatus::Updated),
                    OperationKind::Delete => (OperationOutcome::Deleted, NodeStatus::Deleted),
                };
                info!("{} {} ({})", outcome_verb(&outcome), operation.id, outputs.physical_id);
                if let Some(node) = operation.node {
                    self.graph.set_outputs(node, outputs);
                    self.graph.set_status(node, status);
                }
                outcome
            }
            Settled::Unchanged => {
                if let Some(node) = operation.node {
                    self.graph.set_status(node, NodeStatus::Unchanged);
                }
                OperationOutcome::Unchanged
            }
            Settled::Failed(reason) => {
                error!("Failed to {} {}: {reason}", operation.kind, operation.id);
                if let Some(node) = operation.node {
                    self.graph.set_status(
                        node,
                        NodeStatus::Failed {
                            reason: reason.clone(),
                            path: Vec::new(),
                        },
                    );
                }
                OperationOutcome::Failed { reason }
            }
            Settled::NotAttempted => OperationOutcome::NotAttempted,
        };

        let succeeded = matches!(
            outcome,
            OperationOutcome::Created
                | OperationOutcome::Updated
                | OperationOutcome::Deleted
                | OperationOutcome::Unchanged
        );
        let failed = matches!(outcome, OperationOutcome::Failed { .. });

        self.record(index, outcome, attempts, elapsed);

        if succeeded {
            for &dependent in &self.dependents[index] {
                self.waiting_on[dependent] = self.waiting_on[dependent].saturating_sub(1);
                if self.waiting_on[dependent] == 0 && self.reports[dependent].is_none() {
                    self.ready.insert(dependent);
                }
            }
        } else if failed {
            self.cascade(index);
        }
    }

    /// Marks every transitive dependent of a failed operation as skipped.
    fn cascade(&mut self, root: usize) {
        let plan = self.plan;
        let failed = &plan.operations[root];
        let reason = match failed.kind {
            OperationKind::Delete => format!("dependent resource failed to delete: {}", failed.name()),
            OperationKind::Create | OperationKind::Update => {
                format!("upstream dependency failed: {}", failed.name())
            }
        };

        let mut queue = VecDeque::from([(root, vec![failed.name().to_string()])]);
        while let Some((current, path)) = queue.pop_front() {
            for dependent in self.dependents[current].clone() {
                if self.reports[dependent].is_some() {
                    continue;
                }
                let operation = &plan.operations[dependent];
                let mut path = path.clone();
                path.push(operation.name().to_string());

                warn!("Skipping {}: {reason} ({})", operation.id, path.join(" -> "));
                if let Some(node) = operation.node {
                    self.graph.set_status(
                        node,
                        NodeStatus::Failed {
                            reason: reason.clone(),
                            path: path.clone(),
                        },
                    );
                }
                self.ready.remove(&dependent);
                self.record(
                    dependent,
                    OperationOutcome::Skipped {
                        reason: reason.clone(),
                        path: path.clone(),
                    },
                    0,
                    Duration::ZERO,
                );
                queue.push_back((dependent, path));
            }
        }
    }

    fn record(&mut self, index: usize, outcome: OperationOutcome, attempts: u32, elapsed: Duration) {
        let plan = self.plan;
        let operation = &plan.operations[index];
        self.reports[index] = Some(OperationReport {
            index,
            kind: operation.kind,
            id: operation.id.clone(),
            outcome,
            attempts,
            duration_ms: millis(elapsed),
        });
    }

    fn finish(self, cancelled: bool, elapsed: Duration) -> ExecutionReport {
        let mut report = ExecutionReport {
            unchanged: self.plan.unchanged().len(),
            cancelled,
            duration_ms: millis(elapsed),
            ..ExecutionReport::default()
        };

        for (index, slot) in self.reports.into_iter().enumerate() {
            let operation = &self.plan.operations[index];
            let entry = slot.unwrap_or_else(|| OperationReport {
                index,
                kind: operation.kind,
                id: operation.id.clone(),
                outcome: OperationOutcome::NotAttempted,
                attempts: 0,
                duration_ms: 0,
            });

            match entry.outcome {
                OperationOutcome::Created => report.created += 1,
                OperationOutcome::Updated => report.updated += 1,
                OperationOutcome::Deleted => report.deleted += 1,
                OperationOutcome::Unchanged => report.unchanged += 1,
                OperationOutcome::Failed { .. } => report.failed += 1,
                OperationOutcome::Skipped { .. } => report.skipped += 1,
                OperationOutcome::NotAttempted => report.not_attempted += 1,
            }
            report.operations.push(entry);
        }

        report
    }
}

const fn outcome_verb(outcome: &OperationOutcome) -> &'static str {
    match outcome {
        OperationOutcome::Created => "Created",
        OperationOutcome::Updated => "Updated",
        OperationOutcome::Deleted => "Deleted",
        _ => "Settled",
    }
}

impl ExecutionReport {
    /// Returns true if every operation succeeded and the run was not cancelled.
    #[must_use]
    pub const fn success(&self) -> bool {
        !self.cancelled && self.failed == 0 && self.skipped == 0 && self.not_attempted == 0
    }

    /// Returns the names of resources that were created, updated or deleted.
    #[must_use]
    pub fn changed_resources(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter(|o| {
                matches!(
                    o.outcome,
                    OperationOutcome::Created | OperationOutcome::Updated | OperationOutcome::Deleted
                )
            })
            .map(|o| o.id.name.clone())
            .collect()
    }

    /// Returns the operations that failed or were skipped.
    #[must_use]
    pub fn failures(&self) -> Vec<&OperationReport> {
        self.operations
            .iter()
            .filter(|o| {
                matches!(
                    o.outcome,
                    OperationOutcome::Failed { .. } | OperationOutcome::Skipped { .. }
                )
            })
            .collect()
    }

    /// Returns the report for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OperationReport> {
        self.operations.iter().find(|o| o.id.name == name)
    }
}

impl std::fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Skipped { reason, path } => write!(f, "skipped: {reason} ({})", path.join(" -> ")),
            Self::NotAttempted => write!(f, "not attempted"),
        }
    }
}

impl std::fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted, {} unchanged, {} failed, {} skipped",
            self.created, self.updated, self.deleted, self.unchanged, self.failed, self.skipped
        )?;
        if self.not_attempted > 0 {
            write!(f, ", {} not attempted", self.not_attempted)?;
        }
        Ok(())
    }
}
