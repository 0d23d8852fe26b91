//! Command lifecycle: prepare, execute, rollback on failure, finish always.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use clusteradmin_common::{ClusterAdminError, InstanceAddress, OperationId, Result, Warning};
use clusteradmin_session::{ClusterSession, InstanceHandle, SessionError, SessionResult};

use crate::config::{CoordinatorConfig, PropagationConfig};
use crate::preconditions::{check_preconditions, AvailabilityTable, PreconditionReport};
use crate::snapshot::get_cluster_check_info;
use crate::state::CommandPhase;

/// Phase an operation failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationPhase {
    Validate,
    Execute,
    Rollback,
}

impl std::fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationPhase::Validate => "validate",
            OperationPhase::Execute => "execute",
            OperationPhase::Rollback => "rollback",
        };
        write!(f, "{}", s)
    }
}

/// What a rollback did and what it could not undo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    /// Compensations applied, in the order they ran.
    pub actions: Vec<String>,
    /// Compensations that failed.
    pub failures: Vec<String>,
}

impl RollbackReport {
    /// Whether every attempted compensation succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether nothing was attempted.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.failures.is_empty()
    }
}

/// A failed named operation.
#[derive(Error, Debug, Clone)]
#[error("{operation} failed during {phase}{}: {error}", .step.as_ref().map(|s| format!(" at step {}", s)).unwrap_or_default())]
pub struct OperationFailure {
    pub operation: String,
    pub operation_id: OperationId,
    pub phase: OperationPhase,
    /// Execute step that failed, if any.
    pub step: Option<String>,
    #[source]
    pub error: ClusterAdminError,
    /// Warnings gathered before the failure.
    pub warnings: Vec<Warning>,
    /// Rollback outcome, when one ran.
    pub rollback: Option<RollbackReport>,
}

impl OperationFailure {
    /// Failure before any command ran.
    pub fn validation(operation: &str, operation_id: OperationId, error: ClusterAdminError) -> Self {
        let warnings = match &error {
            ClusterAdminError::PreconditionFailed { warnings, .. } => warnings.clone(),
            _ => Vec::new(),
        };
        Self {
            operation: operation.to_string(),
            operation_id,
            phase: OperationPhase::Validate,
            step: None,
            error,
            warnings,
            rollback: None,
        }
    }

    /// Stable error code of the underlying error.
    pub fn code(&self) -> &'static str {
        self.error.error_code()
    }

    /// Structured form for reports and logs.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "operation": self.operation,
            "operation_id": self.operation_id,
            "phase": self.phase,
            "step": self.step,
            "code": self.code(),
            "kind": self.error.kind(),
            "retryable": self.error.is_retryable(),
            "message": self.error.to_string(),
            "warnings": self.warnings,
            "rollback": self.rollback,
        })
    }
}

/// Requests cancellation of a running command.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observed by a command between steps.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    /// Ask the command to stop before its next step.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        CancelHandle::new().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fail with `Cancelled` if cancellation was requested.
    pub fn check(&self, step: impl std::fmt::Display) -> Result<()> {
        if self.is_cancelled() {
            return Err(ClusterAdminError::Cancelled {
                step: step.to_string(),
            });
        }
        Ok(())
    }
}

/// Bound a remote call by `limit`.
pub async fn remote<T, F>(limit: Duration, what: &str, call: F) -> SessionResult<T>
where
    F: Future<Output = SessionResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout(format!(
            "{} did not complete within {:?}",
            what, limit
        ))),
    }
}

/// Everything a command needs from its caller.
#[derive(Clone)]
pub struct CommandContext {
    pub session: ClusterSession,
    pub table: Arc<AvailabilityTable>,
    pub remote_call_timeout: Duration,
    pub recovery_wait_timeout: Duration,
    pub recovery_poll_interval: Duration,
    pub propagation: PropagationConfig,
    pub cancel: CancelToken,
}

impl CommandContext {
    pub fn new(session: ClusterSession, table: Arc<AvailabilityTable>, config: &CoordinatorConfig) -> Self {
        Self {
            session,
            table,
            remote_call_timeout: config.remote_call_timeout,
            recovery_wait_timeout: config.recovery_wait_timeout,
            recovery_poll_interval: config.recovery_poll_interval,
            propagation: config.propagation.clone(),
            cancel: CancelToken::never(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run a remote call with the configured timeout.
    pub async fn remote<T, F>(&self, what: &str, call: F) -> SessionResult<T>
    where
        F: Future<Output = SessionResult<T>>,
    {
        remote(self.remote_call_timeout, what, call).await
    }

    /// Take a fresh snapshot and admit `operation` against it.
    pub async fn check(&self, operation: &str) -> Result<PreconditionReport> {
        let snapshot = tokio::time::timeout(
            self.remote_call_timeout,
            get_cluster_check_info(self.session.source.as_ref(), self.session.metadata.as_ref()),
        )
        .await
        .map_err(|_| ClusterAdminError::Timeout(format!("snapshot for {}", operation)))??;
        check_preconditions(&self.table, operation, &snapshot, None)
    }

    /// Open an owned session to `address` with the caller's credentials.
    pub async fn open(&self, address: &InstanceAddress) -> Result<InstanceHandle> {
        let options = self.session.credentials.for_address(address.clone());
        self.remote(
            "connect",
            InstanceHandle::open(self.session.connector.as_ref(), &options),
        )
        .await
        .map_err(|e| connection_error(address, e))
    }
}

pub fn connection_error(address: &InstanceAddress, e: SessionError) -> ClusterAdminError {
    ClusterAdminError::ConnectionError {
        address: address.to_string(),
        reason: e.to_string(),
    }
}

pub fn metadata_error(e: SessionError) -> ClusterAdminError {
    ClusterAdminError::MetadataError(e.to_string())
}

/// Move `phase` to `next`, refusing transitions the lifecycle forbids.
pub fn advance(phase: &mut CommandPhase, next: CommandPhase) -> Result<()> {
    if !phase.can_transition_to(next) {
        return Err(ClusterAdminError::InvalidPhase {
            from: phase.to_string(),
            to: next.to_string(),
        });
    }
    *phase = next;
    Ok(())
}

/// A single-use membership change.
#[async_trait]
pub trait Command: Send {
    type Output: Serialize + Send;

    /// Operation name, for reports.
    fn name(&self) -> &str;

    fn phase(&self) -> CommandPhase;

    /// Validate and resolve everything execute needs. Leaves the cluster
    /// untouched.
    async fn prepare(&mut self) -> Result<()>;

    /// Run the state-changing steps in order, stopping at the first failure.
    async fn execute(&mut self) -> Result<Self::Output>;

    /// Undo what execute did, best effort. Never fails, and a second call
    /// does nothing.
    async fn rollback(&mut self) -> RollbackReport;

    /// Release sessions this command opened. Runs once.
    async fn finish(&mut self) -> Result<()>;

    /// The execute step that failed, if any.
    fn failed_step(&self) -> Option<String>;

    /// Non-fatal conditions collected so far.
    fn warnings(&self) -> Vec<Warning>;
}

/// Output of a successful command run.
#[derive(Debug, Clone)]
pub struct CommandSuccess<T> {
    pub output: T,
    pub warnings: Vec<Warning>,
}

/// Drive `command` through its lifecycle.
///
/// Execute failures trigger a rollback; finish runs on every path. Rollback
/// problems are reported beside the original error, never instead of it.
pub async fn run_command<C: Command>(
    command: &mut C,
    operation_id: OperationId,
) -> std::result::Result<CommandSuccess<C::Output>, OperationFailure> {
    let operation = command.name().to_string();

    let failure = |command: &C, phase, error, rollback| OperationFailure {
        operation: operation.clone(),
        operation_id,
        phase,
        step: command.failed_step(),
        error,
        warnings: command.warnings(),
        rollback,
    };

    if let Err(e) = command.prepare().await {
        warn!(operation = %operation, operation_id = %operation_id, error = %e, "Command validation failed");
        let failure = failure(&*command, OperationPhase::Validate, e, None);
        finish(command, &operation).await;
        return Err(failure);
    }

    match command.execute().await {
        Ok(output) => {
            info!(operation = %operation, operation_id = %operation_id, "Command executed");
            let warnings = command.warnings();
            finish(command, &operation).await;
            Ok(CommandSuccess { output, warnings })
        }
        Err(e) => {
            error!(
                operation = %operation,
                operation_id = %operation_id,
                step = ?command.failed_step(),
                error = %e,
                "Command execution failed, rolling back"
            );
            let report = command.rollback().await;
            if !report.is_clean() {
                warn!(
                    operation = %operation,
                    failures = ?report.failures,
                    "Rollback left changes behind"
                );
            }
            let failure = failure(&*command, OperationPhase::Execute, e, Some(report));
            finish(command, &operation).await;
            Err(failure)
        }
    }
}

async fn finish<C: Command>(command: &mut C, operation: &str) {
    if let Err(e) = command.finish().await {
        warn!(operation = %operation, error = %e, "Command finish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records lifecycle calls; fails where told to.
    struct ScriptedCommand {
        phase: CommandPhase,
        fail_prepare: bool,
        fail_execute: bool,
        calls: Vec<&'static str>,
        done: Vec<&'static str>,
    }

    impl ScriptedCommand {
        fn new(fail_prepare: bool, fail_execute: bool) -> Self {
            Self {
                phase: CommandPhase::Constructed,
                fail_prepare,
                fail_execute,
                calls: Vec::new(),
                done: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Command for ScriptedCommand {
        type Output = usize;

        fn name(&self) -> &str {
            "Test.scripted"
        }

        fn phase(&self) -> CommandPhase {
            self.phase
        }

        async fn prepare(&mut self) -> Result<()> {
            self.calls.push("prepare");
            if self.fail_prepare {
                advance(&mut self.phase, CommandPhase::Failed)?;
                return Err(ClusterAdminError::invalid_option("instance", "missing"));
            }
            advance(&mut self.phase, CommandPhase::Prepared)
        }

        async fn execute(&mut self) -> Result<usize> {
            self.calls.push("execute");
            self.done.push("user");
            if self.fail_execute {
                advance(&mut self.phase, CommandPhase::Failed)?;
                return Err(ClusterAdminError::InternalError("join".into()));
            }
            advance(&mut self.phase, CommandPhase::Executed)?;
            Ok(self.done.len())
        }

        async fn rollback(&mut self) -> RollbackReport {
            self.calls.push("rollback");
            let mut report = RollbackReport::default();
            if advance(&mut self.phase, CommandPhase::RolledBack).is_ok() {
                report.actions = self.done.drain(..).rev().map(String::from).collect();
            }
            report
        }

        async fn finish(&mut self) -> Result<()> {
            self.calls.push("finish");
            advance(&mut self.phase, CommandPhase::Finished)
        }

        fn failed_step(&self) -> Option<String> {
            self.fail_execute.then(|| "JoinGroup".to_string())
        }

        fn warnings(&self) -> Vec<Warning> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_success_runs_finish() {
        let mut command = ScriptedCommand::new(false, false);
        let success = run_command(&mut command, OperationId::new()).await.unwrap();
        assert_eq!(success.output, 1);
        assert_eq!(command.calls, vec!["prepare", "execute", "finish"]);
        assert_eq!(command.phase(), CommandPhase::Finished);
    }

    #[tokio::test]
    async fn test_execute_failure_rolls_back() {
        let mut command = ScriptedCommand::new(false, true);
        let failure = run_command(&mut command, OperationId::new()).await.unwrap_err();

        assert_eq!(failure.phase, OperationPhase::Execute);
        assert_eq!(failure.step.as_deref(), Some("JoinGroup"));
        assert_eq!(failure.rollback.unwrap().actions, vec!["user".to_string()]);
        assert_eq!(command.calls, vec!["prepare", "execute", "rollback", "finish"]);
    }

    #[tokio::test]
    async fn test_prepare_failure_skips_rollback() {
        let mut command = ScriptedCommand::new(true, false);
        let failure = run_command(&mut command, OperationId::new()).await.unwrap_err();

        assert_eq!(failure.phase, OperationPhase::Validate);
        assert!(failure.rollback.is_none());
        assert_eq!(failure.code(), "INVALID_OPTION");
        assert_eq!(command.calls, vec!["prepare", "finish"]);
    }

    #[test]
    fn test_advance_rejects_skipping_prepare() {
        let mut phase = CommandPhase::Constructed;
        let err = advance(&mut phase, CommandPhase::Executed).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PHASE");
        assert_eq!(phase, CommandPhase::Constructed);
    }

    #[test]
    fn test_cancel_token() {
        let (handle, token) = CancelHandle::new();
        assert!(token.check("JoinGroup").is_ok());
        handle.cancel();
        let err = token.check("JoinGroup").unwrap_err();
        assert_eq!(err.to_string(), "Operation cancelled before step 'JoinGroup'");
        assert!(!CancelToken::never().is_cancelled());
    }

    #[tokio::test]
    async fn test_remote_timeout() {
        let result: SessionResult<()> = remote(Duration::from_millis(10), "START GROUP_REPLICATION", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
    }

    #[test]
    fn test_failure_display_and_json() {
        let failure = OperationFailure {
            operation: "Cluster.addInstance".into(),
            operation_id: OperationId::new(),
            phase: OperationPhase::Execute,
            step: Some("JoinGroup".into()),
            error: ClusterAdminError::InternalError("boom".into()),
            warnings: vec![],
            rollback: Some(RollbackReport::default()),
        };
        assert_eq!(
            failure.to_string(),
            "Cluster.addInstance failed during execute at step JoinGroup: Internal error: boom"
        );
        let json = failure.to_json();
        assert_eq!(json["phase"], "execute");
        assert_eq!(json["code"], "INTERNAL_ERROR");
    }
}
