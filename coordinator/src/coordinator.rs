//! Named-operation surface over one cluster session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use clusteradmin_common::{
    warning_codes, ClusterAdminError, OperationId, QuorumState, Result, Warning,
};
use clusteradmin_session::ClusterSession;

use crate::add_instance::{AddInstance, ADD_INSTANCE, CREATE_CLUSTER};
use crate::command::{
    metadata_error, run_command, CancelToken, Command, CommandContext, OperationFailure,
    OperationPhase,
};
use crate::config::CoordinatorConfig;
use crate::lock_manager::LockManager;
use crate::metrics::{Metrics, MetricsSnapshot, SharedMetrics};
use crate::options::{
    parse_no_options, AddInstanceOptions, CreateClusterOptions, RemoveInstanceOptions,
    StatusOptions,
};
use crate::preconditions::{AvailabilityTable, PreconditionReport};
use crate::remove_instance::{RemoveInstance, REMOVE_INSTANCE};
use crate::state::CoordinatorState;
use crate::status::{cluster_status, describe_cluster};

const STATUS: &str = "Cluster.status";
const DESCRIBE: &str = "Cluster.describe";

/// Result of a successful named operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub operation: String,
    pub operation_id: OperationId,
    /// Quorum observed when the operation was admitted.
    pub quorum: QuorumState,
    pub warnings: Vec<Warning>,
    pub result: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Parsed options, one variant per operation the coordinator runs.
enum Request {
    CreateCluster(CreateClusterOptions),
    AddInstance(AddInstanceOptions),
    RemoveInstance(RemoveInstanceOptions),
    Status(StatusOptions),
    Describe,
    /// Table entries without an implementation here: admission only.
    CheckOnly,
}

impl Request {
    fn parse(operation: &str, options: &Value) -> Result<Self> {
        match operation {
            CREATE_CLUSTER => Ok(Request::CreateCluster(CreateClusterOptions::parse(options)?)),
            ADD_INSTANCE => Ok(Request::AddInstance(AddInstanceOptions::parse(options)?)),
            REMOVE_INSTANCE => Ok(Request::RemoveInstance(RemoveInstanceOptions::parse(options)?)),
            STATUS => Ok(Request::Status(StatusOptions::parse(options)?)),
            DESCRIBE => {
                parse_no_options(options)?;
                Ok(Request::Describe)
            }
            _ => Ok(Request::CheckOnly),
        }
    }

    /// Whether the request changes the cluster and so needs its lock.
    fn needs_lock(&self) -> bool {
        matches!(
            self,
            Request::CreateCluster(_) | Request::AddInstance(_) | Request::RemoveInstance(_)
        )
    }
}

/// What a run produced, before it becomes a report.
struct Completed {
    result: Value,
    warnings: Vec<Warning>,
}

/// Runs named operations against a cluster, one mutating operation per
/// cluster at a time.
pub struct Coordinator {
    config: CoordinatorConfig,
    session: ClusterSession,
    table: Arc<AvailabilityTable>,
    /// Current coordinator state.
    state: Arc<RwLock<CoordinatorState>>,
    /// Per-cluster operation locks.
    lock_manager: Arc<LockManager>,
    metrics: SharedMetrics,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Arc<RwLock<Option<mpsc::Receiver<()>>>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, session: ClusterSession, table: AvailabilityTable) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let lock_manager = Arc::new(LockManager::new(config.lock_config.clone()));

        Self {
            config,
            session,
            table: Arc::new(table),
            state: Arc::new(RwLock::new(CoordinatorState::Starting)),
            lock_manager,
            metrics: Arc::new(Metrics::new()),
            shutdown_tx,
            shutdown_rx: Arc::new(RwLock::new(Some(shutdown_rx))),
        }
    }

    /// Start background tasks and accept operations.
    #[instrument(skip(self), fields(source = %self.session.source.address()))]
    pub async fn start(&self) -> Result<()> {
        info!("Starting coordinator");

        *self.state.write() = CoordinatorState::Running;
        self.start_background_tasks();

        info!("Coordinator started successfully");
        Ok(())
    }

    /// Stop accepting operations and wait for running ones.
    #[instrument(skip(self), fields(source = %self.session.source.address()))]
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping coordinator");

        *self.state.write() = CoordinatorState::ShuttingDown;
        let _ = self.shutdown_tx.send(()).await;
        self.drain_active_operations().await;
        *self.state.write() = CoordinatorState::Stopped;

        info!("Coordinator stopped");
        Ok(())
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn table(&self) -> &AvailabilityTable {
        &self.table
    }

    pub fn session(&self) -> &ClusterSession {
        &self.session
    }

    /// Admission check only, against a fresh snapshot.
    pub async fn check(&self, operation: &str) -> Result<PreconditionReport> {
        self.context(CancelToken::never()).check(operation).await
    }

    /// Run `operation` with `options` to completion.
    pub async fn invoke(
        &self,
        operation: &str,
        options: Value,
    ) -> std::result::Result<OperationReport, OperationFailure> {
        self.invoke_with_cancel(operation, options, CancelToken::never())
            .await
    }

    /// Run `operation`, stopping between steps once `cancel` fires.
    #[instrument(skip(self, options, cancel))]
    pub async fn invoke_with_cancel(
        &self,
        operation: &str,
        options: Value,
        cancel: CancelToken,
    ) -> std::result::Result<OperationReport, OperationFailure> {
        let operation_id = OperationId::new();
        let started_at = Utc::now();
        let reject = |error: ClusterAdminError| OperationFailure::validation(operation, operation_id, error);

        if !self.state().accepts_operations() {
            return Err(reject(ClusterAdminError::InternalError(
                "the coordinator is not accepting operations".to_string(),
            )));
        }
        self.metrics.operation_invoked();

        if self.table.kind(operation).is_none() {
            self.metrics.operation_rejected();
            return Err(reject(ClusterAdminError::UnknownOperation(operation.to_string())));
        }
        let request = match Request::parse(operation, &options) {
            Ok(request) => request,
            Err(e) => {
                self.metrics.operation_rejected();
                return Err(reject(e));
            }
        };
        if matches!(request, Request::CheckOnly) && !options.is_null() {
            debug!(operation, "Options ignored for an admission-only operation");
        }

        let ctx = self.context(cancel);
        let admission = match ctx.check(operation).await {
            Ok(report) => report,
            Err(e) => {
                warn!(operation, operation_id = %operation_id, error = %e, "Operation rejected");
                self.metrics.operation_rejected();
                return Err(reject(e));
            }
        };
        self.metrics.operation_admitted();

        let locked = if request.needs_lock() {
            match self.lock_cluster(&ctx, &request, operation, operation_id).await {
                Ok(cluster) => Some(cluster),
                Err(e) => {
                    if matches!(e, ClusterAdminError::OperationLocked { .. }) {
                        self.metrics.lock_conflict();
                    }
                    self.metrics.operation_rejected();
                    return Err(reject(e));
                }
            }
        } else {
            None
        };

        let outcome = self.run(ctx, request, operation, operation_id, &admission).await;

        if let Some(cluster) = locked {
            self.lock_manager.release(&cluster, operation_id);
        }

        match outcome {
            Ok(completed) => {
                if has_seed_warning(&completed.warnings) {
                    self.metrics.seed_propagation_partial_failure();
                }
                self.metrics.operation_succeeded();
                info!(operation, operation_id = %operation_id, warnings = completed.warnings.len(), "Operation completed");
                Ok(OperationReport {
                    operation: operation.to_string(),
                    operation_id,
                    quorum: admission.quorum,
                    warnings: completed.warnings,
                    result: completed.result,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(failure) => {
                if failure.rollback.is_some() {
                    self.metrics.rollback();
                }
                if has_seed_warning(&failure.warnings) {
                    self.metrics.seed_propagation_partial_failure();
                }
                self.metrics.operation_failed();
                Err(failure)
            }
        }
    }

    async fn run(
        &self,
        ctx: CommandContext,
        request: Request,
        operation: &str,
        operation_id: OperationId,
        admission: &PreconditionReport,
    ) -> std::result::Result<Completed, OperationFailure> {
        let admitted = || {
            let mut warnings = admission.warnings.clone();
            warnings.extend(admission.notes.iter().cloned());
            warnings
        };
        let failed = |error: ClusterAdminError| OperationFailure {
            operation: operation.to_string(),
            operation_id,
            phase: OperationPhase::Execute,
            step: None,
            error,
            warnings: admitted(),
            rollback: None,
        };

        match request {
            Request::CreateCluster(options) => {
                run_to_completion(AddInstance::bootstrap(ctx, options), operation_id).await
            }
            Request::AddInstance(options) => {
                run_to_completion(AddInstance::join(ctx, options), operation_id).await
            }
            Request::RemoveInstance(options) => {
                run_to_completion(RemoveInstance::new(ctx, options), operation_id).await
            }
            Request::Status(options) => {
                let status = cluster_status(&ctx, &options).await.map_err(failed)?;
                Ok(Completed {
                    result: to_value(&status).map_err(failed)?,
                    warnings: admitted(),
                })
            }
            Request::Describe => {
                let description = describe_cluster(&ctx).await.map_err(failed)?;
                Ok(Completed {
                    result: to_value(&description).map_err(failed)?,
                    warnings: admitted(),
                })
            }
            Request::CheckOnly => Ok(Completed {
                result: json!({ "admitted": true }),
                warnings: admitted(),
            }),
        }
    }

    /// Take the cluster lock for a mutating request. Returns the locked
    /// cluster name.
    async fn lock_cluster(
        &self,
        ctx: &CommandContext,
        request: &Request,
        operation: &str,
        operation_id: OperationId,
    ) -> Result<String> {
        let cluster = match request {
            Request::CreateCluster(options) => options.name.clone(),
            _ => ctx
                .remote("read cluster", self.session.metadata.read_cluster())
                .await
                .map_err(metadata_error)?
                .map(|c| c.name)
                .ok_or_else(|| {
                    ClusterAdminError::MetadataError("the metadata does not describe a cluster".into())
                })?,
        };
        self.lock_manager.acquire(&cluster, operation_id, operation)?;
        Ok(cluster)
    }

    fn context(&self, cancel: CancelToken) -> CommandContext {
        CommandContext::new(self.session.clone(), self.table.clone(), &self.config).with_cancel(cancel)
    }

    fn start_background_tasks(&self) {
        let Some(mut shutdown_rx) = self.shutdown_rx.write().take() else {
            debug!("Background tasks already started");
            return;
        };
        let lock_manager = self.lock_manager.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lock_manager.run_cleanup_loop() => {}
                _ = shutdown_rx.recv() => debug!("Lock cleanup stopped"),
            }
        });
    }

    async fn drain_active_operations(&self) {
        let drain_timeout = Duration::from_secs(30);

        let _ = tokio::time::timeout(drain_timeout, async {
            loop {
                let active = self.metrics.snapshot().operations_active;
                if active == 0 {
                    break;
                }
                info!(active, "Waiting for running operations to complete");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
    }
}

async fn run_to_completion<C: Command>(
    mut command: C,
    operation_id: OperationId,
) -> std::result::Result<Completed, OperationFailure> {
    let success = run_command(&mut command, operation_id).await?;
    let result = to_value(&success.output).map_err(|error| OperationFailure {
        operation: command.name().to_string(),
        operation_id,
        phase: OperationPhase::Execute,
        step: None,
        error,
        warnings: success.warnings.clone(),
        rollback: None,
    })?;
    Ok(Completed {
        result,
        warnings: success.warnings,
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ClusterAdminError::InternalError(e.to_string()))
}

fn has_seed_warning(warnings: &[Warning]) -> bool {
    warnings
        .iter()
        .any(|w| w.code == warning_codes::SEED_PROPAGATION_PARTIAL_FAILURE)
}
