use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{clock::Clock, db::TaskStateStore};

/// Exclusive ownership of a task state database by one process.
///
/// While held, a background task renews the heartbeat every third of the
/// lease TTL. Dropping the guard stops renewal and deletes the lease row, so
/// the next process does not have to wait for it to expire.
pub struct LeaseGuard {
    store: Arc<TaskStateStore>,
    owner: String,
    stop: CancellationToken,
}

impl LeaseGuard {
    pub(crate) fn hold(
        store: Arc<TaskStateStore>,
        clock: Arc<dyn Clock>,
        owner: String,
        ttl: chrono::Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let every = (ttl / 3).to_std().unwrap_or(Duration::from_secs(1)).max(Duration::from_secs(1));
        let renew_store = Arc::clone(&store);
        let renew_owner = owner.clone();
        let renew_stop = stop.clone();
        let pid = std::process::id();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = renew_stop.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                match renew_store.try_acquire_lease(&renew_owner, pid, clock.now(), ttl) {
                    Ok(None) => debug!(owner = %renew_owner, "state lease renewed"),
                    Ok(Some(taker)) => error!(
                        owner = %renew_owner,
                        taken_by = taker.pid,
                        "state lease lost to another process"
                    ),
                    Err(e) => warn!(owner = %renew_owner, "failed to renew state lease: {e}"),
                }
            }
        });
        Self { store, owner, stop }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.stop.cancel();
        match self.store.release_lease(&self.owner) {
            Ok(_) => debug!(owner = %self.owner, "state lease released"),
            Err(e) => warn!(owner = %self.owner, "failed to release state lease: {e}"),
        }
    }
}
