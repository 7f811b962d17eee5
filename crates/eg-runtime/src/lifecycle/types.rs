use tokio::task::JoinHandle;

use orion_error::compat_prelude::*;
use orion_error::prelude::*;

use crate::error::{RuntimeReason, RuntimeResult};

// ---------------------------------------------------------------------------
// TaskGroup — named collection of async tasks for ordered shutdown
// ---------------------------------------------------------------------------

/// A named group of async tasks shut down together.
///
/// Groups are assembled in *start order* and joined in *reverse order*
/// (LIFO), mirroring the dependency graph: producers exit before the
/// consumers that drain their output.
pub(crate) struct TaskGroup {
    pub(super) name: &'static str,
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl TaskGroup {
    pub(super) fn new(name: &'static str) -> Self {
        Self {
            name,
            handles: Vec::new(),
        }
    }

    pub(super) fn push(&mut self, handle: JoinHandle<anyhow::Result<()>>) {
        self.handles.push(handle);
    }

    /// Join all tasks within the grace period; stragglers are abandoned
    /// with a warning rather than blocking shutdown.
    pub(super) async fn wait(self, grace: std::time::Duration) -> RuntimeResult<()> {
        for handle in self.handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(joined) => {
                    joined
                        .map_err(|e| {
                            StructError::from(RuntimeReason::Shutdown)
                                .with_detail(format!("task join error: {e}"))
                        })?
                        .owe(RuntimeReason::Shutdown)?;
                }
                Err(_) => {
                    eg_warn!(sys, task_group = self.name, "task exceeded shutdown grace, abandoning");
                }
            }
        }
        Ok(())
    }
}
