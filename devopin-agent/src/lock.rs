use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Slot {
    owned: AtomicBool,
    owner_notify: Notify,
}

/// Per-name exclusive ownership, used to serialize control actions on one
/// service while leaving other services free.
#[derive(Debug, Default)]
pub struct KeyedLock {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

#[derive(Debug)]
pub struct OwnershipGuard {
    slot: Arc<Slot>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(name.to_owned()).or_default().clone()
    }

    /// Get ownership, will wait until available
    pub async fn own(&self, name: &str) -> OwnershipGuard {
        let slot = self.slot(name);
        loop {
            if slot
                .owned
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return OwnershipGuard { slot };
            }
            slot.owner_notify.notified().await;
        }
    }
}

impl Drop for OwnershipGuard {
    fn drop(&mut self) {
        self.slot.owned.store(false, Ordering::Release);
        self.slot.owner_notify.notify_one();
    }
}
