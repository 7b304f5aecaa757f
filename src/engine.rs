//! Run orchestration.
//!
//! The [`Engine`] ties the stages of a run together: build the graph, take
//! the run lock, plan against recorded state, execute, record the run,
//! resolve stack outputs and run compliance validators. The graph is built
//! before the lock is taken, so a broken stack never touches state.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compliance::{ComplianceReport, ComplianceValidator, ControlSet, ResourceSnapshot, run_validators};
use crate::config::{StackConfig, StackHasher, StackParser, StackValidator, StateBackend, StateConfig};
use crate::error::{ConfigError, ConvergeError, Result};
use crate::graph::{GraphBuilder, NodeStatus, ResourceGraph};
use crate::planner::{ExecutionReport, Plan, PlanExecutor, Planner};
use crate::provider::ProviderRegistry;
use crate::state::{
    LocalStateStore, LockInfo, RunHistoryEntry, RunOperation, RunSession, S3StateStore, STATE_DIR,
    StackState, StateStore,
};

/// Runs plans for one stack.
pub struct Engine {
    config: StackConfig,
    store: Arc<dyn StateStore>,
    registry: ProviderRegistry,
    validators: Vec<Arc<dyn ComplianceValidator>>,
    concurrency: usize,
    hasher: StackHasher,
}

/// A declared resource and how it ended up.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    /// Logical name.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Physical id, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Final status.
    #[serde(flatten)]
    pub status: NodeStatus,
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: String,
    /// What kind of run it was.
    pub operation: RunOperation,
    /// Hash of the applied stack program; empty for destroy.
    pub stack_hash: String,
    /// Per-operation results and counts.
    pub execution: ExecutionReport,
    /// Declared resources with their final status.
    pub resources: Vec<ResourceSummary>,
    /// Resolved stack outputs.
    pub outputs: BTreeMap<String, Value>,
    /// Compliance results, when controls are declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compliance: Option<ComplianceReport>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stack", &self.config.qualified_name())
            .field("backend", &self.store.backend_type())
            .field("registry", &self.registry)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine from parts.
    #[must_use]
    pub fn new(config: StackConfig, store: Arc<dyn StateStore>, registry: ProviderRegistry) -> Self {
        let validators: Vec<Arc<dyn ComplianceValidator>> = config
            .compliance
            .as_ref()
            .map(ControlSet::from_config)
            .filter(|controls| !controls.is_empty())
            .map(|controls| {
                debug!("Loaded {} compliance controls", controls.len());
                vec![Arc::new(controls) as Arc<dyn ComplianceValidator>]
            })
            .unwrap_or_default();

        Self {
            concurrency: config.execution.concurrency,
            config,
            store,
            registry,
            validators,
            hasher: StackHasher::new(),
        }
    }

    /// Loads, validates and wires up the stack at `path`.
    ///
    /// A `.env` next to the stack file is loaded first, and `CONVERGE_*`
    /// variables override the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack cannot be parsed or validated, or the
    /// state backend or providers cannot be set up.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let base = stack_dir(path);
        let config = load_stack(path)?;

        let store = create_store(&config.state, &base).await?;
        let registry = ProviderRegistry::from_config(&config.providers)?;
        debug!("Providers: {:?}", registry.keys());

        Ok(Self::new(config, store, registry))
    }

    /// Overrides the concurrency limit.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// The stack configuration.
    #[must_use]
    pub const fn config(&self) -> &StackConfig {
        &self.config
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Builds the resource graph.
    ///
    /// # Errors
    ///
    /// Returns a graph error for broken references, duplicates or cycles.
    pub fn graph(&self) -> Result<ResourceGraph> {
        Ok(GraphBuilder::new().build_stack(&self.config)?)
    }

    /// Computes a plan against the current state without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be built, state cannot be read
    /// or the recorded state is inconsistent.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.graph()?;
        let state = self.current_state().await?;
        let stack_hash = self.hasher.hash_stack(&self.config);
        if StackHasher::hashes_match(&state.stack_hash, &stack_hash) {
            debug!("Stack program unchanged since the last successful apply");
        }
        Planner::new().plan(&graph, &state, &stack_hash)
    }

    /// Converges the stack to its declaration.
    ///
    /// `approve` sees the plan computed under the run lock and decides
    /// whether to execute it; `Ok(None)` means it declined.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, another run holds the lock,
    /// planning fails or state cannot be written. Provider failures are not
    /// errors; they are reported in the summary.
    pub async fn apply<F>(&self, cancel: CancellationToken, approve: F) -> Result<Option<RunSummary>>
    where
        F: FnOnce(&Plan) -> Result<bool>,
    {
        let graph = self.graph()?;
        let stack_hash = self.hasher.hash_stack(&self.config);
        info!("Applying {} ({})", self.config.qualified_name(), self.hasher.short_hash(&stack_hash));

        self.run(cancel, RunOperation::Apply, graph, approve, |state, graph| {
            Planner::new().plan(graph, state, &stack_hash)
        })
        .await
    }

    /// Deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// See [`Engine::apply`].
    pub async fn destroy<F>(&self, cancel: CancellationToken, approve: F) -> Result<Option<RunSummary>>
    where
        F: FnOnce(&Plan) -> Result<bool>,
    {
        info!("Destroying {}", self.config.qualified_name());
        self.run(cancel, RunOperation::Destroy, ResourceGraph::default(), approve, |state, _| {
            Planner::new().plan_destroy(state)
        })
        .await
    }

    async fn run<F, P>(
        &self,
        cancel: CancellationToken,
        operation: RunOperation,
        mut graph: ResourceGraph,
        approve: F,
        make_plan: P,
    ) -> Result<Option<RunSummary>>
    where
        F: FnOnce(&Plan) -> Result<bool>,
        P: FnOnce(&StackState, &ResourceGraph) -> Result<Plan>,
    {
        let session = Arc::new(
            RunSession::start(
                Arc::clone(&self.store),
                &self.config.project.name,
                &self.config.project.environment,
                cancel,
            )
            .await?,
        );

        let result = self
            .plan_and_execute(&session, &mut graph, operation, approve, make_plan)
            .await;

        let closed = session.close().await;
        let summary = result?;
        closed?;
        Ok(summary)
    }

    async fn plan_and_execute<F, P>(
        &self,
        session: &Arc<RunSession>,
        graph: &mut ResourceGraph,
        operation: RunOperation,
        approve: F,
        make_plan: P,
    ) -> Result<Option<RunSummary>>
    where
        F: FnOnce(&Plan) -> Result<bool>,
        P: FnOnce(&StackState, &ResourceGraph) -> Result<Plan>,
    {
        let state = session.snapshot().await;
        let plan = make_plan(&state, graph)?;
        if !approve(&plan)? {
            info!("Run declined");
            return Ok(None);
        }
        self.execute(session, plan, graph, operation).await.map(Some)
    }

    async fn execute(
        &self,
        session: &Arc<RunSession>,
        plan: Plan,
        graph: &mut ResourceGraph,
        operation: RunOperation,
    ) -> Result<RunSummary> {
        let stack_hash = plan.stack_hash.clone();
        let executor = PlanExecutor::new(
            self.registry.clone(),
            self.config.execution.retry.clone(),
            self.concurrency,
        );
        let execution = executor.execute(plan, graph, Arc::clone(session)).await;

        let entry = RunHistoryEntry::new(
            session.run_id(),
            operation,
            &stack_hash,
            execution.changed_resources(),
        );
        let entry = if execution.success() {
            entry
        } else {
            entry.failed(failure_summary(&execution))
        };
        session.record_run(entry).await?;

        let state = session.snapshot().await;
        let compliance = if operation == RunOperation::Apply && !self.validators.is_empty() {
            let report = run_validators(&self.validators, &ResourceSnapshot::from_state(&state)).await;
            info!("Compliance: {report}");
            Some(report)
        } else {
            None
        };

        let outputs = graph
            .resolve_outputs()
            .into_iter()
            .map(|(name, resolved)| (name, resolved.value))
            .collect();

        let resources = graph
            .nodes()
            .iter()
            .map(|node| ResourceSummary {
                name: node.name().to_string(),
                resource_type: node.resource_type().to_string(),
                physical_id: node.outputs.as_ref().map(|o| o.physical_id.clone()),
                status: node.status.clone(),
            })
            .collect();

        Ok(RunSummary {
            run_id: session.run_id().to_string(),
            operation,
            stack_hash,
            execution,
            resources,
            outputs,
            compliance,
        })
    }

    /// Loads the recorded state, or an empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub async fn current_state(&self) -> Result<StackState> {
        Ok(self.store.load().await?.unwrap_or_else(|| {
            StackState::new(&self.config.project.name, &self.config.project.environment)
        }))
    }

    /// Returns the current run lock, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be read.
    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.store.lock_info().await
    }

    /// Releases the run lock by id, or unconditionally with `force`.
    ///
    /// Returns false if there was nothing to release.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock id does not match or the release fails.
    pub async fn unlock(&self, lock_id: Option<&str>, force: bool) -> Result<bool> {
        if force {
            let held = self.store.is_locked().await?;
            self.store.force_unlock().await?;
            return Ok(held);
        }

        match lock_id {
            Some(id) => {
                self.store.release_lock(id).await?;
                Ok(true)
            }
            None => Err(ConvergeError::internal("a lock id is required unless --force is given")),
        }
    }
}

impl RunSummary {
    /// Returns true if every operation succeeded.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.execution.success()
    }

    /// Returns true if any compliance control failed.
    #[must_use]
    pub fn compliance_failed(&self) -> bool {
        self.compliance.as_ref().is_some_and(ComplianceReport::has_failures)
    }
}

fn failure_summary(execution: &ExecutionReport) -> String {
    if execution.cancelled {
        return format!(
            "cancelled with {} operations not attempted",
            execution.not_attempted
        );
    }
    format!(
        "{} failed, {} skipped",
        execution.failed, execution.skipped
    )
}

/// Loads and validates the stack file at `path`, logging any warnings.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_stack(path: &Path) -> Result<StackConfig> {
    let parser = StackParser::new().with_base_path(stack_dir(path));
    parser.load_dotenv()?;

    let config = parser.load_with_env(path)?;
    let validation = StackValidator::new().validate(&config)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }
    Ok(config)
}

fn stack_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf()
}

/// Creates the state store described by the stack's `state` section.
///
/// Relative local paths are resolved against `base`, the stack file's
/// directory.
///
/// # Errors
///
/// Returns an error if an S3 backend has no bucket or cannot be set up.
pub async fn create_store(state: &StateConfig, base: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match state.backend {
        StateBackend::Local => {
            let path = state
                .path
                .as_ref()
                .map_or_else(|| base.join(STATE_DIR), |p| base.join(PathBuf::from(p)));
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = state.bucket.as_deref().ok_or_else(|| {
                ConvergeError::Config(ConfigError::validation("S3 bucket not configured", "state.bucket"))
            })?;
            Arc::new(S3StateStore::new(bucket, state.prefix.as_deref(), state.region.as_deref()).await?)
        }
        StateBackend::Memory => Arc::new(crate::state::MemoryStateStore::new()),
    };

    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}
