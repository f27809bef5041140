use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::ExecutionContextStack;
use crate::error::ExecError;
use crate::groups::{ExecutionGroup, should_cancel};
use crate::model::{CommandOutput, Execution, ExecutionId, ExecutionStatus};
use crate::runner::{AllowList, CommandTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed(CommandOutput),
    /// Superseded by a newer execution. Callers must not render this as an error.
    Cancelled,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub command: String,
    pub outcome: ExecutionOutcome,
}

impl ExecutionResult {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Cancelled)
    }
}

#[derive(Debug)]
struct PendingExecution {
    execution: Execution,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Registry {
    pending: BTreeMap<ExecutionId, PendingExecution>,
    history: Vec<Execution>,
}

impl Registry {
    fn settle(&mut self, id: ExecutionId, status: ExecutionStatus) -> Option<Execution> {
        let mut entry = self.pending.remove(&id)?;
        entry.execution.status = status;
        entry.execution.finished_at = Some(Utc::now());
        self.history.push(entry.execution.clone());
        Some(entry.execution)
    }
}

/// Tracks in-flight executions and cancels the ones a newer execution supersedes.
pub struct ExecutionCoordinator {
    transport: Arc<dyn CommandTransport>,
    allow_list: AllowList,
    contexts: Arc<ExecutionContextStack>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    updates: broadcast::Sender<Execution>,
}

impl ExecutionCoordinator {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        allow_list: AllowList,
        contexts: Arc<ExecutionContextStack>,
        update_capacity: usize,
    ) -> Self {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            transport,
            allow_list,
            contexts,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            updates,
        }
    }

    pub fn contexts(&self) -> &Arc<ExecutionContextStack> {
        &self.contexts
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Runs `command` under `group`, or under the current execution context's
    /// group when none is given. Only allow-list violations are returned as
    /// `Err`; every runtime outcome is folded into the result.
    pub async fn execute(
        &self,
        command: &str,
        group: Option<ExecutionGroup>,
    ) -> Result<ExecutionResult, ExecError> {
        self.allow_list.check(command)?;
        let inherited = group.is_none();
        let group = group.or_else(|| self.contexts.current_group());
        if inherited && let Some(group) = &group {
            debug!(group = %group, nested = self.contexts.depth(), "group inherited from context");
        }
        let (id, cancel) = self.register(command, group);
        let mut guard = SettleOnDrop {
            coordinator: self,
            id,
            armed: true,
        };

        let result = self.transport.run(command, cancel).await;
        guard.armed = false;

        let (status, outcome) = match result {
            Ok(output) => (ExecutionStatus::Completed, ExecutionOutcome::Completed(output)),
            Err(error) if error.is_cancelled() => {
                (ExecutionStatus::Cancelled, ExecutionOutcome::Cancelled)
            }
            Err(error) => (
                ExecutionStatus::Error,
                ExecutionOutcome::Failed {
                    error: error.to_string(),
                },
            ),
        };

        let outcome = match self.finish(id, status) {
            Some(_) => outcome,
            // Cancelled by a newer execution while the transport was finishing.
            None => ExecutionOutcome::Cancelled,
        };
        Ok(ExecutionResult {
            execution_id: id,
            command: command.to_string(),
            outcome,
        })
    }

    pub fn pending(&self) -> Vec<Execution> {
        self.registry
            .lock()
            .pending
            .values()
            .map(|entry| entry.execution.clone())
            .collect()
    }

    pub fn history(&self) -> Vec<Execution> {
        self.registry.lock().history.clone()
    }

    pub fn cancelled_history(&self) -> Vec<Execution> {
        self.registry
            .lock()
            .history
            .iter()
            .filter(|execution| execution.status == ExecutionStatus::Cancelled)
            .cloned()
            .collect()
    }

    pub fn remove_history_item(&self, id: ExecutionId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.history.len();
        registry.history.retain(|execution| execution.id != id);
        registry.history.len() != before
    }

    pub fn clear_history(&self) {
        self.registry.lock().history.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Execution> {
        self.updates.subscribe()
    }

    fn register(
        &self,
        command: &str,
        group: Option<ExecutionGroup>,
    ) -> (ExecutionId, CancellationToken) {
        let id = ExecutionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let execution = Execution {
            id,
            command: command.to_string(),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
            group,
        };

        let superseded = {
            let mut registry = self.registry.lock();
            // Registered before the sweep so the sweep can never select it.
            registry.pending.insert(
                id,
                PendingExecution {
                    execution: execution.clone(),
                    cancel: cancel.clone(),
                },
            );
            sweep(&mut registry, id, execution.group.as_ref())
        };

        info!(
            execution = %id,
            command,
            group = ?execution.group.as_ref().map(ExecutionGroup::label),
            superseded = superseded.len(),
            "execution registered"
        );
        let _ = self.updates.send(execution);
        for cancelled in superseded {
            let _ = self.updates.send(cancelled);
        }
        (id, cancel)
    }

    fn finish(&self, id: ExecutionId, status: ExecutionStatus) -> Option<Execution> {
        debug_assert!(status.is_terminal());
        let settled = self.registry.lock().settle(id, status)?;
        info!(execution = %id, status = status.title(), "execution finished");
        let _ = self.updates.send(settled.clone());
        Some(settled)
    }
}

/// Cancels every other pending execution the new one supersedes and returns
/// their terminal snapshots.
fn sweep(
    registry: &mut Registry,
    new_id: ExecutionId,
    group: Option<&ExecutionGroup>,
) -> Vec<Execution> {
    let victims = registry
        .pending
        .iter()
        .filter(|(id, _)| **id != new_id)
        .filter(|(_, entry)| supersedes(group, entry.execution.group.as_ref()))
        .map(|(id, _)| *id)
        .collect::<Vec<_>>();

    victims
        .into_iter()
        .filter_map(|id| {
            if let Some(entry) = registry.pending.get(&id) {
                entry.cancel.cancel();
            }
            let cancelled = registry.settle(id, ExecutionStatus::Cancelled)?;
            debug!(
                execution = %id,
                by = %new_id,
                "execution superseded"
            );
            Some(cancelled)
        })
        .collect()
}

fn supersedes(candidate: Option<&ExecutionGroup>, incumbent: Option<&ExecutionGroup>) -> bool {
    match candidate {
        None => true,
        Some(candidate) if incumbent == Some(candidate) => false,
        Some(candidate) => should_cancel(Some(candidate), incumbent),
    }
}

/// Marks an execution cancelled when its `execute` future is dropped mid-flight.
struct SettleOnDrop<'a> {
    coordinator: &'a ExecutionCoordinator,
    id: ExecutionId,
    armed: bool,
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.finish(self.id, ExecutionStatus::Cancelled);
        }
    }
}
