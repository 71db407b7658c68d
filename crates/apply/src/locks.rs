//! Release-scoped mutual exclusion for mutating commands within one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use yoke_core::ReleaseRef;

#[derive(Default)]
pub struct ReleaseLocks {
    inner: Mutex<HashMap<ReleaseRef, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReleaseLocks {
    pub fn new() -> Self { Self::default() }

    /// Wait until no other holder operates on `release`. Held until the guard drops.
    pub async fn acquire(&self, release: &ReleaseRef) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(release.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
