//! Adding an instance to a cluster, or bootstrapping a new cluster on the
//! session's instance.
//!
//! Prepare resolves every input and leaves the servers untouched. Execute
//! runs the steps in dependency order and records what it changed, so
//! rollback only undoes what was actually done.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use clusteradmin_common::{
    limits, recovery_account_name, warning_codes, ClusterAdminError, Deadline, InstanceAddress,
    MemberState, Result, TopologyMode, Warning,
};
use clusteradmin_session::error::codes;
use clusteradmin_session::{
    ClusterRecord, ClusterType, Instance, InstanceHandle, InstanceRecord, SessionError,
};

use crate::command::{
    advance, connection_error, metadata_error, Command, CommandContext, RollbackReport,
};
use crate::group_replication::{
    self as gr, choose_recovery_method, generate_password, resolve_ssl_mode,
    GroupSettings, ResolvedRecovery, SslMode,
};
use crate::member_manager::MemberManager;
use crate::options::{AddInstanceOptions, CreateClusterOptions, GroupOptions};
use crate::state::CommandPhase;

pub const ADD_INSTANCE: &str = "Cluster.addInstance";
pub const CREATE_CLUSTER: &str = "Dba.createCluster";

/// Execute steps, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddInstanceStep {
    RecoveryUser,
    InstallPlugin,
    ConfigureGroupReplication,
    BootstrapGroup,
    JoinGroup,
    WaitRecovery,
    RegisterMetadata,
    UpdateGroupSeeds,
    UpdateAutoIncrement,
}

impl fmt::Display for AddInstanceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddInstanceStep::RecoveryUser => "RecoveryUser",
            AddInstanceStep::InstallPlugin => "InstallPlugin",
            AddInstanceStep::ConfigureGroupReplication => "ConfigureGroupReplication",
            AddInstanceStep::BootstrapGroup => "BootstrapGroup",
            AddInstanceStep::JoinGroup => "JoinGroup",
            AddInstanceStep::WaitRecovery => "WaitRecovery",
            AddInstanceStep::RegisterMetadata => "RegisterMetadata",
            AddInstanceStep::UpdateGroupSeeds => "UpdateGroupSeeds",
            AddInstanceStep::UpdateAutoIncrement => "UpdateAutoIncrement",
        };
        f.write_str(s)
    }
}

/// Result of a successful add or create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddInstanceOutcome {
    pub cluster: String,
    pub instance: InstanceAddress,
    pub label: String,
    pub local_address: InstanceAddress,
    pub report_host: String,
    pub recovery_method: ResolvedRecovery,
    pub ssl_mode: SslMode,
    /// Member state when the command finished.
    pub member_state: Option<MemberState>,
    /// A new cluster was created around the instance.
    pub bootstrapped: bool,
}

enum Mode {
    Join(AddInstanceOptions),
    Bootstrap(CreateClusterOptions),
}

/// Recovery account the new member authenticates with.
#[derive(Debug, Clone)]
struct RecoveryAccount {
    user: String,
    password: Option<String>,
    /// The command creates the account (and drops it on rollback).
    create: bool,
}

/// Everything execute needs, resolved by prepare.
#[derive(Debug, Clone)]
struct Plan {
    cluster: ClusterRecord,
    record: InstanceRecord,
    settings: GroupSettings,
    account: RecoveryAccount,
    report_host: String,
    /// Existing members, target excluded.
    members: Vec<InstanceAddress>,
    wait_recovery: Duration,
}

/// What execute has changed so far. Only ever set, in step order.
#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    recovery_user_created: bool,
    plugin_installed: bool,
    configured: bool,
    gr_started: bool,
    cluster_created: bool,
    metadata_registered: bool,
    seeds_updated: bool,
}

/// Join an instance to a cluster, or create a cluster on the session's
/// instance.
pub struct AddInstance {
    ctx: CommandContext,
    mode: Mode,
    phase: CommandPhase,
    supplied_target: Option<Arc<dyn Instance>>,
    target: Option<InstanceHandle>,
    peer: Option<InstanceHandle>,
    plan: Option<Plan>,
    progress: Progress,
    warnings: Vec<Warning>,
    failed_step: Option<AddInstanceStep>,
    rolled_back: bool,
}

impl AddInstance {
    /// `Cluster.addInstance`.
    pub fn join(ctx: CommandContext, options: AddInstanceOptions) -> Self {
        Self::new(ctx, Mode::Join(options))
    }

    /// `Dba.createCluster` on the session's instance.
    pub fn bootstrap(ctx: CommandContext, options: CreateClusterOptions) -> Self {
        Self::new(ctx, Mode::Bootstrap(options))
    }

    fn new(ctx: CommandContext, mode: Mode) -> Self {
        Self {
            ctx,
            mode,
            phase: CommandPhase::Constructed,
            supplied_target: None,
            target: None,
            peer: None,
            plan: None,
            progress: Progress::default(),
            warnings: Vec::new(),
            failed_step: None,
            rolled_back: false,
        }
    }

    /// Use a session the caller already holds for the target. It is left
    /// open when the command finishes.
    pub fn with_target(mut self, target: Arc<dyn Instance>) -> Self {
        self.supplied_target = Some(target);
        self
    }

    fn is_bootstrap(&self) -> bool {
        matches!(self.mode, Mode::Bootstrap(_))
    }

    fn target_address(&self) -> InstanceAddress {
        match &self.mode {
            Mode::Join(options) => options.instance.clone(),
            Mode::Bootstrap(_) => self.ctx.session.source.address().clone(),
        }
    }

    fn group_options(&self) -> GroupOptions {
        match &self.mode {
            Mode::Join(options) => options.group(),
            Mode::Bootstrap(options) => options.group(),
        }
    }

    fn target(&self) -> Result<Arc<dyn Instance>> {
        self.target
            .as_ref()
            .map(|h| h.instance().clone())
            .ok_or_else(|| ClusterAdminError::InternalError("target session not open".into()))
    }

    fn peer(&self) -> Result<Arc<dyn Instance>> {
        self.peer
            .as_ref()
            .map(|h| h.instance().clone())
            .ok_or_else(|| ClusterAdminError::InternalError("peer session not open".into()))
    }

    /// Steps this command will run.
    fn steps(&self, plan: &Plan) -> Vec<AddInstanceStep> {
        use AddInstanceStep::*;
        if self.is_bootstrap() {
            return vec![
                RecoveryUser,
                InstallPlugin,
                ConfigureGroupReplication,
                BootstrapGroup,
                RegisterMetadata,
                UpdateAutoIncrement,
            ];
        }
        let mut steps = vec![RecoveryUser, InstallPlugin, ConfigureGroupReplication, JoinGroup];
        if !plan.wait_recovery.is_zero() {
            steps.push(WaitRecovery);
        }
        steps.extend([RegisterMetadata, UpdateGroupSeeds, UpdateAutoIncrement]);
        steps
    }

    async fn open_target(&mut self) -> Result<()> {
        let handle = match (&self.supplied_target, &self.mode) {
            (Some(target), _) => InstanceHandle::borrowed(target.clone()),
            (None, Mode::Bootstrap(_)) => InstanceHandle::borrowed(self.ctx.session.source.clone()),
            (None, Mode::Join(options)) => self.ctx.open(&options.instance).await?,
        };
        self.target = Some(handle);
        Ok(())
    }

    async fn open_peer(&mut self, instances: &[InstanceRecord]) -> Result<()> {
        let source = self.ctx.session.source.clone();
        let requested = match &self.mode {
            Mode::Join(options) => options.peer.clone(),
            Mode::Bootstrap(_) => None,
        };

        let handle = match requested {
            Some(peer) if &peer != source.address() => {
                if !instances.iter().any(|r| r.address == peer) {
                    return Err(ClusterAdminError::invalid_option(
                        "peer",
                        format!("'{}' is not a member of the cluster", peer),
                    ));
                }
                self.ctx.open(&peer).await?
            }
            _ => InstanceHandle::borrowed(source),
        };
        self.peer = Some(handle);
        Ok(())
    }

    /// Reject targets that are already part of the cluster or collide with it.
    async fn check_membership(&self, target: &dyn Instance, instances: &[InstanceRecord]) -> Result<()> {
        let address = target.address();
        let uuid = target.server_uuid();

        if instances.iter().any(|r| &r.address == address)
            || self
                .ctx
                .remote("member state", target.is_member_of_group())
                .await
                .map_err(|e| connection_error(address, e))?
        {
            return Err(ClusterAdminError::AlreadyMember {
                address: address.clone(),
            });
        }

        if let Some(existing) = instances.iter().find(|r| r.server_uuid == uuid) {
            return Err(ClusterAdminError::ServerUuidConflict {
                address: address.clone(),
                uuid,
                existing: existing.address.clone(),
            });
        }

        if let Some(existing) = instances.iter().find(|r| r.server_id == target.server_id()) {
            return Err(ClusterAdminError::InstanceNotConfigured {
                address: address.clone(),
                issues: vec![format!(
                    "server_id {} is already used by '{}'",
                    target.server_id(),
                    existing.address
                )],
            });
        }

        Ok(())
    }

    async fn check_configuration(&self, target: &dyn Instance, skip_instance_check: bool) -> Result<()> {
        let address = target.address();
        if !limits::is_supported_server(target.version()) {
            return Err(ClusterAdminError::InstanceNotConfigured {
                address: address.clone(),
                issues: vec![format!("MySQL {} is not supported", target.version())],
            });
        }

        if let Some(filters) = self
            .ctx
            .remote("binlog filters", gr::replication_filters(target))
            .await
            .map_err(|e| connection_error(address, e))?
        {
            return Err(ClusterAdminError::IncompatibleReplicationFilters {
                address: address.clone(),
                filters,
            });
        }

        if !skip_instance_check {
            let issues = self
                .ctx
                .remote("instance check", gr::check_instance_configuration(target))
                .await
                .map_err(|e| connection_error(address, e))?;
            if !issues.is_empty() {
                return Err(ClusterAdminError::InstanceNotConfigured {
                    address: address.clone(),
                    issues,
                });
            }
        }
        Ok(())
    }

    async fn resolve_account(&self, target: &dyn Instance, peer: &dyn Instance) -> Result<RecoveryAccount> {
        let (user, password, skip) = match &self.mode {
            Mode::Join(options) => (
                options.replication_user.clone(),
                options.replication_password.clone(),
                options.skip_replication_user,
            ),
            Mode::Bootstrap(_) => (None, None, false),
        };

        if user.is_none() && !skip {
            return Ok(RecoveryAccount {
                user: recovery_account_name(target.server_id()),
                password: Some(generate_password()),
                create: true,
            });
        }

        let user = user.unwrap_or_else(|| recovery_account_name(target.server_id()));
        let exists = user_exists(&self.ctx, peer, &user).await?;
        if !exists {
            return Err(ClusterAdminError::RecoveryUserCreationFailed {
                user,
                reason: format!("the account does not exist on '{}'", peer.address()),
            });
        }
        Ok(RecoveryAccount {
            user,
            password,
            create: false,
        })
    }

    async fn resolve_local_address(&self, target: &dyn Instance, group: &GroupOptions) -> Result<InstanceAddress> {
        match &group.local_address {
            Some(local) => Ok(local.clone()),
            None => target.address().default_local_address().ok_or_else(|| {
                ClusterAdminError::invalid_option(
                    "localAddress",
                    format!(
                        "cannot derive a local address from port {}, set localAddress explicitly",
                        target.address().port
                    ),
                )
            }),
        }
    }

    async fn resolve_report_host(&self, target: &dyn Instance) -> Result<String> {
        let value = self
            .ctx
            .remote("report_host", target.get_sysvar("report_host"))
            .await
            .map_err(|e| connection_error(target.address(), e))?;
        Ok(value
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| target.address().host.clone()))
    }

    #[instrument(skip(self), fields(operation = %self.name(), target = %self.target_address()))]
    async fn prepare_inner(&mut self) -> Result<()> {
        let operation = self.name().to_string();
        let report = self.ctx.check(&operation).await?;
        self.warnings.extend(report.warnings);
        self.warnings.extend(report.notes);

        let metadata = self.ctx.session.metadata.clone();
        let existing_cluster = self
            .ctx
            .remote("read cluster", metadata.read_cluster())
            .await
            .map_err(metadata_error)?;
        let instances = self
            .ctx
            .remote("read instances", metadata.read_instances())
            .await
            .map_err(metadata_error)?;

        self.open_target().await?;
        self.open_peer(&instances).await?;
        let target = self.target()?;
        let peer = self.peer()?;
        let address = target.address().clone();
        let group = self.group_options();

        let (cluster, skip_instance_check) = match &self.mode {
            Mode::Join(options) => {
                let cluster = existing_cluster.ok_or_else(|| {
                    ClusterAdminError::MetadataError("the metadata does not describe a cluster".into())
                })?;
                (cluster, options.skip_instance_check)
            }
            Mode::Bootstrap(options) => {
                if let Some(cluster) = existing_cluster {
                    return Err(ClusterAdminError::GroupBootstrapFailed {
                        address,
                        reason: format!("the metadata already describes cluster '{}'", cluster.name),
                    });
                }
                if self
                    .ctx
                    .remote("member state", target.is_member_of_group())
                    .await
                    .map_err(|e| connection_error(&address, e))?
                {
                    return Err(ClusterAdminError::GroupBootstrapFailed {
                        address,
                        reason: "Group Replication is already running on the instance".into(),
                    });
                }
                let group_name = options
                    .group_name
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let topology = if options.multi_primary {
                    TopologyMode::MultiPrimary
                } else {
                    TopologyMode::SinglePrimary
                };
                let cluster = ClusterRecord {
                    name: options.name.clone(),
                    group_name,
                    cluster_type: ClusterType::GroupReplication,
                    topology,
                    primary: None,
                };
                (cluster, false)
            }
        };

        if !self.is_bootstrap() {
            self.check_membership(target.as_ref(), &instances).await?;
        }
        self.check_configuration(target.as_ref(), skip_instance_check)
            .await?;

        let label = match &self.mode {
            Mode::Join(options) => options.label.clone(),
            Mode::Bootstrap(_) => None,
        }
        .unwrap_or_else(|| address.to_string());
        if instances.iter().any(|r| r.label == label) {
            return Err(ClusterAdminError::invalid_option(
                "label",
                format!("'{}' is already used by another instance", label),
            ));
        }

        let local_address = self.resolve_local_address(target.as_ref(), &group).await?;
        let report_host = self.resolve_report_host(target.as_ref()).await?;

        let have_ssl = self
            .ctx
            .remote("have_ssl", target.get_sysvar("have_ssl"))
            .await
            .map_err(|e| connection_error(&address, e))?
            .map_or(false, |v| v.eq_ignore_ascii_case("YES"));
        let cluster_ssl = if self.is_bootstrap() {
            None
        } else {
            self.ctx
                .remote("ssl mode", peer.get_sysvar(gr::SSL_MODE))
                .await
                .map_err(|e| connection_error(peer.address(), e))?
                .as_deref()
                .and_then(SslMode::parse)
        };
        let ssl_mode = resolve_ssl_mode(&address, group.member_ssl_mode, cluster_ssl, have_ssl)?;

        let (recovery, seeds, wait_recovery) = match &self.mode {
            Mode::Bootstrap(_) => (ResolvedRecovery::Incremental, String::new(), Duration::ZERO),
            Mode::Join(options) => {
                let target_gtid = self
                    .ctx
                    .remote("gtid_executed", target.gtid_executed())
                    .await
                    .map_err(|e| connection_error(&address, e))?;
                let group_gtid = self
                    .ctx
                    .remote("gtid_executed", peer.gtid_executed())
                    .await
                    .map_err(|e| connection_error(peer.address(), e))?;
                let recovery = choose_recovery_method(
                    &address,
                    options.recovery_method,
                    &target_gtid,
                    &group_gtid,
                    target.version(),
                    peer.version(),
                )?;

                let existing = instances.iter().filter_map(|r| {
                    r.local_address
                        .clone()
                        .or_else(|| r.address.default_local_address())
                        .map(|l| l.to_string())
                });
                let extra = options.group_seeds.as_deref().map(gr::parse_seeds).unwrap_or_default();
                let seeds = if options.overwrite_seed {
                    gr::format_seeds(extra)
                } else {
                    gr::format_seeds(existing.chain(extra))
                };

                let wait = match options.wait_recovery {
                    Some(seconds) => Duration::from_secs(seconds),
                    None => self.ctx.recovery_wait_timeout,
                };
                (recovery, seeds, wait)
            }
        };

        let account = self.resolve_account(target.as_ref(), peer.as_ref()).await?;

        let mut record = InstanceRecord::new(address.clone(), target.server_uuid(), target.server_id());
        record.local_address = Some(local_address.clone());
        record.label = label;

        let settings = GroupSettings {
            group_name: cluster.group_name.clone(),
            local_address,
            seeds,
            mode: cluster.topology,
            ssl_mode,
            exit_state_action: group.exit_state_action.clone(),
            member_weight: group.member_weight,
            auto_rejoin_tries: group.auto_rejoin_tries,
            recovery,
        };

        info!(
            target = %address,
            recovery = ?recovery,
            ssl_mode = %ssl_mode,
            seeds = %settings.seeds,
            "Instance validated"
        );

        self.plan = Some(Plan {
            members: instances
                .iter()
                .map(|r| r.address.clone())
                .filter(|a| a != &address)
                .collect(),
            cluster,
            record,
            settings,
            account,
            report_host,
            wait_recovery,
        });
        Ok(())
    }

    async fn run_step(&mut self, step: AddInstanceStep, plan: &Plan) -> Result<()> {
        let target = self.target()?;
        match step {
            AddInstanceStep::RecoveryUser => self.create_recovery_user(&target, plan).await,
            AddInstanceStep::InstallPlugin => self.install_plugins(&target, plan).await,
            AddInstanceStep::ConfigureGroupReplication => self.configure(&target, plan).await,
            AddInstanceStep::BootstrapGroup => self.bootstrap_group(&target).await,
            AddInstanceStep::JoinGroup => self.join_group(&target).await,
            AddInstanceStep::WaitRecovery => self.wait_recovery(&target, plan).await,
            AddInstanceStep::RegisterMetadata => self.register_metadata(plan).await,
            AddInstanceStep::UpdateGroupSeeds => {
                self.update_seeds(plan).await;
                Ok(())
            }
            AddInstanceStep::UpdateAutoIncrement => {
                self.update_auto_increment(&target, plan).await;
                Ok(())
            }
        }
    }

    /// Where the recovery account lives: the primary for a join, the target
    /// itself for a new cluster.
    fn account_host(&self, target: &Arc<dyn Instance>) -> Arc<dyn Instance> {
        if self.is_bootstrap() {
            target.clone()
        } else {
            self.ctx.session.source.clone()
        }
    }

    async fn create_recovery_user(&mut self, target: &Arc<dyn Instance>, plan: &Plan) -> Result<()> {
        let account = &plan.account;
        if !account.create {
            debug!(user = %account.user, "Reusing existing recovery account");
            return Ok(());
        }

        let host = self.account_host(target);
        let failed = |e: SessionError| ClusterAdminError::RecoveryUserCreationFailed {
            user: account.user.clone(),
            reason: e.to_string(),
        };

        if user_exists(&self.ctx, host.as_ref(), &account.user).await? {
            // Left over from an earlier attempt; its password is unknown.
            self.ctx
                .remote("drop user", host.execute(&gr::drop_user_sql(&account.user)))
                .await
                .map_err(failed)?;
        }

        let password = account.password.as_deref().unwrap_or_default();
        self.ctx
            .remote("create user", host.execute(&gr::create_user_sql(&account.user, password)))
            .await
            .map_err(failed)?;
        self.progress.recovery_user_created = true;

        self.ctx
            .remote("grant", host.execute(&gr::grant_replication_sql(&account.user)))
            .await
            .map_err(failed)?;
        info!(user = %account.user, host = %host.address(), "Recovery account created");
        Ok(())
    }

    async fn install_plugins(&mut self, target: &Arc<dyn Instance>, plan: &Plan) -> Result<()> {
        install_plugin(&self.ctx, target.as_ref(), gr::GR_PLUGIN).await?;
        self.progress.plugin_installed = true;

        if plan.settings.recovery == ResolvedRecovery::Clone {
            install_plugin(&self.ctx, target.as_ref(), gr::CLONE_PLUGIN).await?;
            let peer = self.peer()?;
            install_plugin(&self.ctx, peer.as_ref(), gr::CLONE_PLUGIN).await?;
        }
        Ok(())
    }

    fn start_failure(&self, address: &InstanceAddress, reason: String) -> ClusterAdminError {
        if self.is_bootstrap() {
            ClusterAdminError::GroupBootstrapFailed {
                address: address.clone(),
                reason,
            }
        } else {
            ClusterAdminError::GroupJoinFailed {
                address: address.clone(),
                reason,
            }
        }
    }

    async fn configure(&mut self, target: &Arc<dyn Instance>, plan: &Plan) -> Result<()> {
        let address = target.address().clone();
        for (name, value) in plan.settings.assignments() {
            self.ctx
                .remote(name, target.set_sysvar(name, &value))
                .await
                .map_err(|e| self.start_failure(&address, format!("setting {}: {}", name, e)))?;
        }

        let account = &plan.account;
        let sql = gr::recovery_channel_sql(target.version(), &account.user, account.password.as_deref());
        self.ctx
            .remote("recovery channel", target.execute(&sql))
            .await
            .map_err(|e| ClusterAdminError::RecoveryUserCreationFailed {
                user: account.user.clone(),
                reason: e.to_string(),
            })?;

        self.progress.configured = true;
        debug!(target = %address, "Group Replication configured");
        Ok(())
    }

    async fn bootstrap_group(&mut self, target: &Arc<dyn Instance>) -> Result<()> {
        let address = target.address().clone();
        let failed = |e: SessionError| ClusterAdminError::GroupBootstrapFailed {
            address: address.clone(),
            reason: e.to_string(),
        };

        self.ctx
            .remote("bootstrap on", target.set_sysvar(gr::BOOTSTRAP_GROUP, "ON"))
            .await
            .map_err(failed)?;
        let started = self
            .ctx
            .remote("start", target.execute("START GROUP_REPLICATION"))
            .await;
        let reset = self
            .ctx
            .remote("bootstrap off", target.set_sysvar(gr::BOOTSTRAP_GROUP, "OFF"))
            .await;

        started.map_err(failed)?;
        self.progress.gr_started = true;
        reset.map_err(failed)?;
        info!(target = %address, "Group bootstrapped");
        Ok(())
    }

    async fn join_group(&mut self, target: &Arc<dyn Instance>) -> Result<()> {
        let address = target.address().clone();

        self.ctx
            .remote("start", target.execute("START GROUP_REPLICATION"))
            .await
            .map_err(|e| self.start_failure(&address, e.to_string()))?;
        self.progress.gr_started = true;

        let state = self
            .ctx
            .remote("member state", target.member_state())
            .await
            .map_err(|e| self.start_failure(&address, e.to_string()))?;
        match state {
            Some(MemberState::Online) | Some(MemberState::Recovering) => {
                info!(target = %address, state = ?state, "Instance joined the group");
                Ok(())
            }
            other => Err(self.start_failure(
                &address,
                format!(
                    "member state is {} after START GROUP_REPLICATION",
                    other.map_or_else(|| "(none)".to_string(), |s| s.to_string())
                ),
            )),
        }
    }

    async fn wait_recovery(&mut self, target: &Arc<dyn Instance>, plan: &Plan) -> Result<()> {
        let address = target.address().clone();
        let deadline = Deadline::new(plan.wait_recovery, "recovery");

        loop {
            let state = self
                .ctx
                .remote("member state", target.member_state())
                .await
                .map_err(|e| self.start_failure(&address, e.to_string()))?;
            match state {
                Some(MemberState::Online) => {
                    info!(target = %address, "Recovery complete");
                    return Ok(());
                }
                Some(MemberState::Recovering) => {}
                other => {
                    return Err(self.start_failure(
                        &address,
                        format!(
                            "member left the group during recovery (state {})",
                            other.map_or_else(|| "(none)".to_string(), |s| s.to_string())
                        ),
                    ))
                }
            }

            if deadline.is_exceeded() {
                warn!(target = %address, waited = ?plan.wait_recovery, "Instance still recovering");
                self.warnings.push(Warning::new(
                    warning_codes::SLOW_RECOVERY,
                    format!(
                        "'{}' is still RECOVERING after {:?}; it will become ONLINE when recovery completes",
                        address, plan.wait_recovery
                    ),
                ));
                return Ok(());
            }
            tokio::time::sleep(self.ctx.recovery_poll_interval).await;
        }
    }

    async fn register_metadata(&mut self, plan: &Plan) -> Result<()> {
        let metadata = self.ctx.session.metadata.clone();
        let failed = |e: SessionError| ClusterAdminError::MetadataRegistrationFailed {
            address: plan.record.address.clone(),
            reason: e.to_string(),
        };

        if self.is_bootstrap() {
            self.ctx
                .remote("create cluster", metadata.create_cluster(&plan.cluster))
                .await
                .map_err(failed)?;
            self.progress.cluster_created = true;
        }

        self.ctx
            .remote("write instance", metadata.write_instance_record(&plan.record))
            .await
            .map_err(failed)?;
        self.progress.metadata_registered = true;
        info!(target = %plan.record.address, label = %plan.record.label, "Instance registered in metadata");
        Ok(())
    }

    async fn update_seeds(&mut self, plan: &Plan) {
        let manager = MemberManager::new(
            self.ctx.session.clone(),
            self.ctx.propagation.clone(),
            self.ctx.remote_call_timeout,
        );
        let report = manager
            .add_seed(&plan.members, &plan.settings.local_address.to_string())
            .await;
        self.progress.seeds_updated = true;

        if let Some(warning) = report.warning(
            warning_codes::SEED_PROPAGATION_PARTIAL_FAILURE,
            "update group_replication_group_seeds",
        ) {
            warn!(failed = report.failed.len(), "Seed list not updated on every member");
            self.warnings.push(warning);
        }
    }

    async fn update_auto_increment(&mut self, target: &Arc<dyn Instance>, plan: &Plan) {
        let mode = plan.cluster.topology;
        let report = match mode {
            TopologyMode::SinglePrimary => {
                let (increment, offset) = gr::auto_increment_settings(mode, 1, target.server_id());
                let result = async {
                    target
                        .set_sysvar("auto_increment_increment", &increment.to_string())
                        .await?;
                    target
                        .set_sysvar("auto_increment_offset", &offset.to_string())
                        .await
                };
                match self.ctx.remote("auto increment", result).await {
                    Ok(()) => None,
                    Err(e) => Some(format!("{} ({})", target.address(), e)),
                }
            }
            TopologyMode::MultiPrimary => {
                let manager = MemberManager::new(
                    self.ctx.session.clone(),
                    self.ctx.propagation.clone(),
                    self.ctx.remote_call_timeout,
                );
                let mut members = plan.members.clone();
                members.push(target.address().clone());
                let size = members.len();
                let report = manager.update_auto_increment(&members, mode, size).await;
                report
                    .warning(warning_codes::AUTO_INCREMENT_PARTIAL_FAILURE, "update auto-increment")
                    .map(|w| w.message)
            }
        };

        if let Some(message) = report {
            warn!(message = %message, "Auto-increment not updated everywhere");
            self.warnings.push(Warning::new(
                warning_codes::AUTO_INCREMENT_PARTIAL_FAILURE,
                message,
            ));
        }
    }

    async fn outcome(&mut self, target: &Arc<dyn Instance>, plan: &Plan) -> AddInstanceOutcome {
        let member_state = match self.ctx.remote("member state", target.member_state()).await {
            Ok(state) => state,
            Err(e) => {
                debug!(target = %plan.record.address, error = %e, "Member state unreadable after execute");
                self.warnings.push(Warning::new(
                    warning_codes::INSTANCE_UNREACHABLE,
                    format!(
                        "The member state of '{}' could not be read after the operation: {}",
                        plan.record.address, e
                    ),
                ));
                None
            }
        };
        AddInstanceOutcome {
            cluster: plan.cluster.name.clone(),
            instance: plan.record.address.clone(),
            label: plan.record.label.clone(),
            local_address: plan.settings.local_address.clone(),
            report_host: plan.report_host.clone(),
            recovery_method: plan.settings.recovery,
            ssl_mode: plan.settings.ssl_mode,
            member_state,
            bootstrapped: self.is_bootstrap(),
        }
    }
}

async fn user_exists(ctx: &CommandContext, instance: &dyn Instance, user: &str) -> Result<bool> {
    let rows = ctx
        .remote("user lookup", instance.query(&gr::user_exists_sql(user)))
        .await
        .map_err(|e| ClusterAdminError::RecoveryUserCreationFailed {
            user: user.to_string(),
            reason: e.to_string(),
        })?;
    Ok(rows.first_value().map_or(false, |count| count.trim() != "0"))
}

async fn install_plugin(ctx: &CommandContext, instance: &dyn Instance, plugin: &str) -> Result<()> {
    let failed = |e: SessionError| ClusterAdminError::PluginInstallFailed {
        address: instance.address().clone(),
        reason: e.to_string(),
    };

    if ctx
        .remote("plugin lookup", instance.has_capability(plugin))
        .await
        .map_err(failed)?
    {
        return Ok(());
    }

    match ctx
        .remote("install plugin", instance.install_capability(plugin))
        .await
    {
        Ok(()) => {
            info!(instance = %instance.address(), plugin = %plugin, "Plugin installed");
            Ok(())
        }
        Err(SessionError::Sql { code, .. }) if code == codes::ER_PLUGIN_INSTALLED => Ok(()),
        Err(e) => Err(failed(e)),
    }
}

#[async_trait]
impl Command for AddInstance {
    type Output = AddInstanceOutcome;

    fn name(&self) -> &str {
        if self.is_bootstrap() {
            CREATE_CLUSTER
        } else {
            ADD_INSTANCE
        }
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

    #[instrument(skip(self), fields(operation = %self.name(), target = %self.target_address()))]
    async fn execute(&mut self) -> Result<AddInstanceOutcome> {
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

        for step in self.steps(&plan) {
            let result = match self.ctx.cancel.check(step) {
                Ok(()) => {
                    info!(step = %step, "Running step");
                    self.run_step(step, &plan).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(step = %step, error = %e, "Step failed");
                self.failed_step = Some(step);
                advance(&mut self.phase, CommandPhase::Failed)?;
                return Err(e);
            }
        }

        let target = self.target()?;
        let outcome = self.outcome(&target, &plan).await;
        advance(&mut self.phase, CommandPhase::Executed)?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(operation = %self.name(), target = %self.target_address()))]
    async fn rollback(&mut self) -> RollbackReport {
        let mut report = RollbackReport::default();
        if self.rolled_back || matches!(self.phase, CommandPhase::Executed | CommandPhase::Finished) {
            return report;
        }
        self.rolled_back = true;

        let Some(plan) = self.plan.clone() else {
            let _ = advance(&mut self.phase, CommandPhase::RolledBack);
            return report;
        };
        let target = self.target.as_ref().map(|h| h.instance().clone());
        let metadata = self.ctx.session.metadata.clone();
        let mut record = |action: &str, result: std::result::Result<(), SessionError>| match result {
            Ok(()) => report.actions.push(action.to_string()),
            Err(e) => {
                warn!(action = %action, error = %e, "Compensation failed");
                report.failures.push(format!("{}: {}", action, e));
            }
        };

        if self.progress.metadata_registered {
            let result = self
                .ctx
                .remote("remove instance", metadata.remove_instance_record(&plan.record.address))
                .await;
            record("remove metadata record", result);
            self.progress.metadata_registered = false;
        }

        if self.progress.cluster_created {
            let result = self
                .ctx
                .remote("drop cluster", metadata.drop_cluster(&plan.cluster.name))
                .await;
            record("drop cluster metadata", result);
            self.progress.cluster_created = false;
        }

        if self.progress.gr_started {
            if let Some(target) = &target {
                let result = self
                    .ctx
                    .remote("stop", target.execute("STOP GROUP_REPLICATION"))
                    .await;
                record("stop group replication", result);
            }
            self.progress.gr_started = false;
        }

        if self.progress.recovery_user_created {
            if let Some(target) = &target {
                let host = self.account_host(target);
                let result = self
                    .ctx
                    .remote("drop user", host.execute(&gr::drop_user_sql(&plan.account.user)))
                    .await;
                record("drop recovery account", result);
            }
            self.progress.recovery_user_created = false;
        }

        info!(
            actions = report.actions.len(),
            failures = report.failures.len(),
            "Rollback finished"
        );
        let _ = advance(&mut self.phase, CommandPhase::RolledBack);
        report
    }

    async fn finish(&mut self) -> Result<()> {
        advance(&mut self.phase, CommandPhase::Finished)?;

        let mut result = Ok(());
        for handle in [self.peer.take(), self.target.take()].into_iter().flatten() {
            let address = handle.address().clone();
            if let Err(e) = handle.release().await {
                warn!(instance = %address, error = %e, "Failed to close session");
                result = Err(connection_error(&address, e));
            }
        }
        result
    }

    fn failed_step(&self) -> Option<String> {
        self.failed_step.map(|s| s.to_string())
    }

    fn warnings(&self) -> Vec<Warning> {
        self.warnings.clone()
    }
}
