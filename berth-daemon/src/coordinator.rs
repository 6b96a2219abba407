//! Target-resolution policy over the orchestrator.
//!
//! Everything here happens at submission time: unknown names, unknown
//! groups and malformed group members are rejected synchronously, before an
//! operation exists. Bulk operations observe the managed-container set once
//! at submission; containers started afterwards are not retroactively
//! included.

use std::sync::Arc;

use berth_protocol::protocol::{GroupState, MemberState, OperationKind, OperationSnapshot};
use tracing::warn;

use crate::config::{BerthConfig, ResolvedContainer};
use crate::errors::{DaemonError, Result};
use crate::orchestrator::Orchestrator;
use crate::runtime::RuntimeError;

pub struct Coordinator {
    config: Arc<BerthConfig>,
    orchestrator: Arc<Orchestrator>,
}

impl Coordinator {
    pub fn new(config: Arc<BerthConfig>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn start(&self, name: &str) -> Result<String> {
        self.submit_single(OperationKind::Start, name)
    }

    pub fn stop(&self, name: &str) -> Result<String> {
        self.submit_single(OperationKind::Stop, name)
    }

    pub fn restart(&self, name: &str) -> Result<String> {
        self.submit_single(OperationKind::Restart, name)
    }

    pub fn cleanup(&self, name: &str) -> Result<String> {
        self.submit_single(OperationKind::Cleanup, name)
    }

    fn submit_single(&self, kind: OperationKind, name: &str) -> Result<String> {
        let target = self.config.resolve_container(name)?;
        Ok(self.orchestrator.submit(kind, vec![target], false))
    }

    pub fn group_start(&self, group: &str) -> Result<String> {
        let (targets, sequential) = self.resolve_group_targets(group)?;
        Ok(self
            .orchestrator
            .submit(OperationKind::GroupStart, targets, sequential))
    }

    pub fn group_stop(&self, group: &str) -> Result<String> {
        let (targets, _) = self.resolve_group_targets(group)?;
        Ok(self
            .orchestrator
            .submit(OperationKind::GroupStop, targets, false))
    }

    /// Resolve a group into ordered targets. A member the config does not
    /// define is a validation error, distinct from an unknown group.
    fn resolve_group_targets(&self, group: &str) -> Result<(Vec<ResolvedContainer>, bool)> {
        let group_config = self.config.resolve_group(group)?;
        let mut targets = Vec::with_capacity(group_config.members.len());
        for member in &group_config.members {
            let target = self.config.resolve_container(member).map_err(|e| match e {
                DaemonError::ContainerNotFound(name) => DaemonError::Validation(format!(
                    "group {} references unknown container {}",
                    group, name
                )),
                other => other,
            })?;
            targets.push(target);
        }
        Ok((targets, group_config.sequential))
    }

    pub async fn stop_all(&self) -> Result<String> {
        self.submit_bulk(OperationKind::StopAll).await
    }

    pub async fn restart_all(&self) -> Result<String> {
        self.submit_bulk(OperationKind::RestartAll).await
    }

    pub async fn cleanup_all(&self) -> Result<String> {
        self.submit_bulk(OperationKind::CleanupAll).await
    }

    /// Target set = every container bearing the managed label, observed now.
    async fn submit_bulk(&self, kind: OperationKind) -> Result<String> {
        let names = self
            .orchestrator
            .runtime()
            .list_managed()
            .await
            .map_err(into_daemon_error)?;

        let targets = names
            .into_iter()
            .map(|name| {
                // Managed containers the current config no longer defines are
                // still operated on, just without spec or scripts.
                self.config
                    .resolve_container(&name)
                    .unwrap_or_else(|_| ResolvedContainer::unresolved(name))
            })
            .collect();

        Ok(self.orchestrator.submit(kind, targets, false))
    }

    pub fn operation_status(&self, id: &str) -> Result<OperationSnapshot> {
        self.orchestrator
            .status(id)
            .ok_or_else(|| DaemonError::OperationNotFound(id.to_string()))
    }

    pub fn cancel_operation(&self, id: &str) -> Result<()> {
        self.orchestrator
            .cancel(id)
            .ok_or_else(|| DaemonError::OperationNotFound(id.to_string()))
    }

    /// Live runtime state of each group member, independent of any
    /// in-flight operation.
    pub async fn group_status(&self, group: &str) -> Result<GroupState> {
        let group_config = self.config.resolve_group(group)?;
        let mut members = Vec::with_capacity(group_config.members.len());
        for name in &group_config.members {
            members.push(self.member_state(name).await?);
        }
        Ok(GroupState {
            name: group.to_string(),
            description: group_config.description.clone(),
            members,
        })
    }

    pub async fn list_managed(&self) -> Result<Vec<MemberState>> {
        let names = self
            .orchestrator
            .runtime()
            .list_managed()
            .await
            .map_err(into_daemon_error)?;
        let mut members = Vec::with_capacity(names.len());
        for name in names {
            members.push(self.member_state(&name).await?);
        }
        Ok(members)
    }

    async fn member_state(&self, name: &str) -> Result<MemberState> {
        let state = match self.orchestrator.runtime().inspect(name).await {
            Ok(state) => state.to_run_state(),
            Err(RuntimeError::Unavailable(message)) => {
                return Err(DaemonError::RuntimeUnavailable(message));
            }
            Err(RuntimeError::Failed { message, .. }) => {
                warn!("inspect failed for {}: {}", name, message);
                berth_protocol::protocol::RunState::Absent
            }
        };
        Ok(MemberState {
            name: name.to_string(),
            state,
        })
    }
}

fn into_daemon_error(e: RuntimeError) -> DaemonError {
    match e {
        RuntimeError::Unavailable(message) => DaemonError::RuntimeUnavailable(message),
        RuntimeError::Failed { name, message } => {
            DaemonError::Validation(format!("{}: {}", name, message))
        }
    }
}
