use std::{
    collections::BTreeMap,
    mem,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::intent::DeploymentIntent;

/// Latest pending intent per target. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct CoalescingQueue {
    pending: Arc<Mutex<BTreeMap<String, DeploymentIntent>>>,
}

impl CoalescingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any pending intent for the same target. Returns the superseded one.
    pub fn put(&self, intent: DeploymentIntent) -> Option<DeploymentIntent> {
        let target = intent.target_path().to_string();
        let superseded = self.lock().insert(target, intent);
        if let Some(previous) = &superseded {
            tracing::debug!(
                target: "queue",
                target_path = %previous.target_path(),
                superseded_branch = %previous.branch(),
                "pending_intent_superseded"
            );
        }
        superseded
    }

    /// Swaps the pending map for an empty one under the lock, so a concurrent
    /// `put` lands either in the returned snapshot or in the next drain.
    pub fn drain_all(&self) -> BTreeMap<String, DeploymentIntent> {
        mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DeploymentIntent>> {
        // The map holds plain data, so a panic mid-insert cannot leave it torn.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
