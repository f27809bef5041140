use parking_lot::Mutex;
use std::future::Future;
use tracing::warn;
use uuid::Uuid;

use crate::groups::ExecutionGroup;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub group: Option<ExecutionGroup>,
    pub scope_id: Uuid,
}

/// LIFO stack of named scopes establishing the "current group".
///
/// One instance is shared by every caller in the process. Push and pop happen
/// synchronously, so the stack is consistent between suspension points as long
/// as scopes are well nested.
#[derive(Debug, Default)]
pub struct ExecutionContextStack {
    stack: Mutex<Vec<ExecutionContext>>,
}

impl ExecutionContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `operation` with `group` as the current group. The scope is
    /// released when the future completes, fails, or is dropped.
    pub async fn with_group<T, F, Fut>(&self, group: ExecutionGroup, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _scope = self.enter(Some(group));
        operation().await
    }

    pub fn enter(&self, group: Option<ExecutionGroup>) -> ContextScope<'_> {
        let context = ExecutionContext {
            group,
            scope_id: Uuid::new_v4(),
        };
        let scope_id = context.scope_id;
        self.stack.lock().push(context);
        ContextScope {
            owner: self,
            scope_id,
        }
    }

    pub fn current_context(&self) -> Option<ExecutionContext> {
        self.stack.lock().last().cloned()
    }

    pub fn current_group(&self) -> Option<ExecutionGroup> {
        self.current_context().and_then(|context| context.group)
    }

    pub fn is_in_group(&self, group: &ExecutionGroup) -> bool {
        self.stack
            .lock()
            .iter()
            .any(|context| context.group.as_ref() == Some(group))
    }

    pub fn depth(&self) -> usize {
        self.stack.lock().len()
    }

    fn release(&self, scope_id: Uuid) {
        let mut stack = self.stack.lock();
        match stack.last() {
            Some(top) if top.scope_id == scope_id => {
                stack.pop();
            }
            top => {
                warn!(
                    expected = %scope_id,
                    found = ?top.map(|context| context.scope_id),
                    "execution context stack corruption detected"
                );
                // Remove our own entry so the overlapping scope keeps its context.
                if let Some(index) = stack.iter().rposition(|context| context.scope_id == scope_id) {
                    stack.remove(index);
                }
            }
        }
    }
}

#[must_use = "the context is released as soon as the scope is dropped"]
pub struct ContextScope<'a> {
    owner: &'a ExecutionContextStack,
    scope_id: Uuid,
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        self.owner.release(self.scope_id);
    }
}
