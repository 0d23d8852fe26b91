//! Removing an instance from a cluster.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use clusteradmin_common::{
    recovery_account_name, warning_codes, ClusterAdminError, InstanceAddress, Result,
    TopologyMode, Warning,
};
use clusteradmin_session::{ClusterRecord, Instance, InstanceHandle, InstanceRecord, SessionError};

use crate::command::{
    advance, connection_error, metadata_error, Command, CommandContext, RollbackReport,
};
use crate::group_replication::{self as gr, START_ON_BOOT};
use crate::member_manager::MemberManager;
use crate::options::RemoveInstanceOptions;
use crate::state::CommandPhase;

pub const REMOVE_INSTANCE: &str = "Cluster.removeInstance";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveInstanceStep {
    RemoveMetadata,
    LeaveGroup,
    DropRecoveryUser,
    UpdateGroupSeeds,
    UpdateAutoIncrement,
}

impl fmt::Display for RemoveInstanceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoveInstanceStep::RemoveMetadata => "RemoveMetadata",
            RemoveInstanceStep::LeaveGroup => "LeaveGroup",
            RemoveInstanceStep::DropRecoveryUser => "DropRecoveryUser",
            RemoveInstanceStep::UpdateGroupSeeds => "UpdateGroupSeeds",
            RemoveInstanceStep::UpdateAutoIncrement => "UpdateAutoIncrement",
        };
        f.write_str(s)
    }
}

const STEPS: [RemoveInstanceStep; 5] = [
    RemoveInstanceStep::RemoveMetadata,
    RemoveInstanceStep::LeaveGroup,
    RemoveInstanceStep::DropRecoveryUser,
    RemoveInstanceStep::UpdateGroupSeeds,
    RemoveInstanceStep::UpdateAutoIncrement,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveInstanceOutcome {
    pub cluster: String,
    pub instance: InstanceAddress,
    /// Group Replication was stopped on the instance. False when it was
    /// unreachable and removed with `force`.
    pub left_group: bool,
    pub remaining_members: usize,
}

#[derive(Debug, Clone)]
struct Plan {
    cluster: ClusterRecord,
    record: InstanceRecord,
    /// Remaining members.
    members: Vec<InstanceAddress>,
    seed: String,
    recovery_user: String,
}

/// Take an instance out of the group and the metadata.
pub struct RemoveInstance {
    ctx: CommandContext,
    options: RemoveInstanceOptions,
    phase: CommandPhase,
    target: Option<InstanceHandle>,
    plan: Option<Plan>,
    metadata_removed: bool,
    left_group: bool,
    warnings: Vec<Warning>,
    failed_step: Option<RemoveInstanceStep>,
    rolled_back: bool,
}

impl RemoveInstance {
    pub fn new(ctx: CommandContext, options: RemoveInstanceOptions) -> Self {
        Self {
            ctx,
            options,
            phase: CommandPhase::Constructed,
            target: None,
            plan: None,
            metadata_removed: false,
            left_group: false,
            warnings: Vec::new(),
            failed_step: None,
            rolled_back: false,
        }
    }

    #[instrument(skip(self), fields(target = %self.options.instance))]
    async fn prepare_inner(&mut self) -> Result<()> {
        let report = self.ctx.check(REMOVE_INSTANCE).await?;
        self.warnings.extend(report.warnings);
        self.warnings.extend(report.notes);

        let metadata = self.ctx.session.metadata.clone();
        let cluster = self
            .ctx
            .remote("read cluster", metadata.read_cluster())
            .await
            .map_err(metadata_error)?
            .ok_or_else(|| {
                ClusterAdminError::MetadataError("the metadata does not describe a cluster".into())
            })?;
        let instances = self
            .ctx
            .remote("read instances", metadata.read_instances())
            .await
            .map_err(metadata_error)?;

        let address = self.options.instance.clone();
        let record = instances
            .iter()
            .find(|r| r.address == address)
            .cloned()
            .ok_or_else(|| ClusterAdminError::NotAMember {
                address: address.clone(),
            })?;

        if instances.len() == 1 {
            return Err(ClusterAdminError::GroupLeaveFailed {
                address,
                reason: "it is the last member of the cluster, dissolve the cluster instead".into(),
            });
        }
        if &address == self.ctx.session.source.address() {
            return Err(ClusterAdminError::invalid_option(
                "instance",
                "cannot remove the instance the session is connected to, connect to another member",
            ));
        }

        match self.ctx.open(&address).await {
            Ok(handle) => self.target = Some(handle),
            Err(e) if self.options.force => {
                warn!(target = %address, error = %e, "Removing unreachable instance");
                self.warnings.push(Warning::new(
                    warning_codes::INSTANCE_UNREACHABLE,
                    format!(
                        "'{}' is unreachable, it was removed from the metadata only and must be \
                         removed from the group manually",
                        address
                    ),
                ));
            }
            Err(e) => return Err(e),
        }

        let seed = record
            .local_address
            .clone()
            .or_else(|| address.default_local_address())
            .map(|l| l.to_string())
            .unwrap_or_default();

        // Joins may have used a custom replicationUser.
        let recovery_user = match &self.target {
            Some(handle) => self
                .ctx
                .remote("recovery user", gr::recovery_channel_user(handle.instance().as_ref()))
                .await
                .map_err(|e| connection_error(&address, e))?,
            None => None,
        }
        .unwrap_or_else(|| recovery_account_name(record.server_id));

        self.plan = Some(Plan {
            cluster,
            members: instances
                .iter()
                .map(|r| r.address.clone())
                .filter(|a| a != &address)
                .collect(),
            recovery_user,
            record,
            seed,
        });
        Ok(())
    }

    async fn run_step(&mut self, step: RemoveInstanceStep, plan: &Plan) -> Result<()> {
        match step {
            RemoveInstanceStep::RemoveMetadata => {
                self.ctx
                    .remote(
                        "remove instance",
                        self.ctx.session.metadata.remove_instance_record(&plan.record.address),
                    )
                    .await
                    .map_err(|e| ClusterAdminError::MetadataRegistrationFailed {
                        address: plan.record.address.clone(),
                        reason: e.to_string(),
                    })?;
                self.metadata_removed = true;
                Ok(())
            }
            RemoveInstanceStep::LeaveGroup => self.leave_group(plan).await,
            RemoveInstanceStep::DropRecoveryUser => {
                let primary = self.ctx.session.source.clone();
                let result = self
                    .ctx
                    .remote("drop user", primary.execute(&gr::drop_user_sql(&plan.recovery_user)))
                    .await;
                if let Err(e) = result {
                    warn!(user = %plan.recovery_user, error = %e, "Recovery account not removed");
                    self.warnings.push(Warning::new(
                        warning_codes::RECOVERY_ACCOUNT_NOT_REMOVED,
                        format!(
                            "The recovery account '{}' could not be removed: {}",
                            plan.recovery_user, e
                        ),
                    ));
                }
                Ok(())
            }
            RemoveInstanceStep::UpdateGroupSeeds => {
                let report = self.manager().remove_seed(&plan.members, &plan.seed).await;
                if let Some(warning) = report.warning(
                    warning_codes::SEED_PROPAGATION_PARTIAL_FAILURE,
                    "update group_replication_group_seeds",
                ) {
                    self.warnings.push(warning);
                }
                Ok(())
            }
            RemoveInstanceStep::UpdateAutoIncrement => {
                if plan.cluster.topology == TopologyMode::MultiPrimary {
                    let report = self
                        .manager()
                        .update_auto_increment(&plan.members, TopologyMode::MultiPrimary, plan.members.len())
                        .await;
                    if let Some(warning) = report.warning(
                        warning_codes::AUTO_INCREMENT_PARTIAL_FAILURE,
                        "update auto-increment",
                    ) {
                        self.warnings.push(warning);
                    }
                }
                Ok(())
            }
        }
    }

    async fn leave_group(&mut self, plan: &Plan) -> Result<()> {
        let Some(target) = self.target() else {
            return Ok(());
        };
        let address = plan.record.address.clone();

        self.ctx
            .remote("stop", target.execute("STOP GROUP_REPLICATION"))
            .await
            .map_err(|e| ClusterAdminError::GroupLeaveFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        self.left_group = true;

        // Keep it from rejoining on restart.
        if let Err(e) = self
            .ctx
            .remote("start_on_boot", target.set_sysvar(START_ON_BOOT, "OFF"))
            .await
        {
            warn!(target = %address, error = %e, "Could not disable start on boot");
        }
        info!(target = %address, "Instance left the group");
        Ok(())
    }

    fn manager(&self) -> MemberManager {
        MemberManager::new(
            self.ctx.session.clone(),
            self.ctx.propagation.clone(),
            self.ctx.remote_call_timeout,
        )
    }

    fn target(&self) -> Option<Arc<dyn Instance>> {
        self.target.as_ref().map(|h| h.instance().clone())
    }
}

#[async_trait]
impl Command for RemoveInstance {
    type Output = RemoveInstanceOutcome;

    fn name(&self) -> &str {
        REMOVE_INSTANCE
    }

    fn phase(&self) -> CommandPhase {
        self.phase
    }

    async fn prepare(&mut self) -> Result<()> {
        if self.phase != CommandPhase::Constructed {
            return Err(ClusterAdminError::InvalidPhase {
                from: self.phase.to_string(),
                to: CommandPhase::Prepared.to_string(),
            });
        }
        match self.prepare_inner().await {
            Ok(()) => advance(&mut self.phase, CommandPhase::Prepared),
            Err(e) => {
                advance(&mut self.phase, CommandPhase::Failed)?;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(target = %self.options.instance))]
    async fn execute(&mut self) -> Result<RemoveInstanceOutcome> {
        if self.phase != CommandPhase::Prepared {
            return Err(ClusterAdminError::InvalidPhase {
                from: self.phase.to_string(),
                to: CommandPhase::Executed.to_string(),
            });
        }
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| ClusterAdminError::InternalError("prepare left no plan".into()))?;

        for step in STEPS {
            let result = match self.ctx.cancel.check(step) {
                Ok(()) => self.run_step(step, &plan).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(step = %step, error = %e, "Step failed");
                self.failed_step = Some(step);
                advance(&mut self.phase, CommandPhase::Failed)?;
                return Err(e);
            }
        }

        advance(&mut self.phase, CommandPhase::Executed)?;
        Ok(RemoveInstanceOutcome {
            cluster: plan.cluster.name.clone(),
            instance: plan.record.address.clone(),
            left_group: self.left_group,
            remaining_members: plan.members.len(),
        })
    }

    async fn rollback(&mut self) -> RollbackReport {
        let mut report = RollbackReport::default();
        if self.rolled_back || matches!(self.phase, CommandPhase::Executed | CommandPhase::Finished) {
            return report;
        }
        self.rolled_back = true;

        // Once the instance has left, the metadata row has nothing to describe.
        if let Some(plan) = self.plan.clone() {
            if self.metadata_removed && !self.left_group {
                let result: std::result::Result<(), SessionError> = self
                    .ctx
                    .remote(
                        "write instance",
                        self.ctx.session.metadata.write_instance_record(&plan.record),
                    )
                    .await;
                match result {
                    Ok(()) => report.actions.push("restore metadata record".to_string()),
                    Err(e) => {
                        warn!(error = %e, "Could not restore metadata record");
                        report.failures.push(format!("restore metadata record: {}", e));
                    }
                }
                self.metadata_removed = false;
            }
        }

        let _ = advance(&mut self.phase, CommandPhase::RolledBack);
        report
    }

    async fn finish(&mut self) -> Result<()> {
        advance(&mut self.phase, CommandPhase::Finished)?;
        if let Some(handle) = self.target.take() {
            let address = handle.address().clone();
            handle
                .release()
                .await
                .map_err(|e| connection_error(&address, e))?;
        }
        Ok(())
    }

    fn failed_step(&self) -> Option<String> {
        self.failed_step.map(|s| s.to_string())
    }

    fn warnings(&self) -> Vec<Warning> {
        self.warnings.clone()
    }
}
