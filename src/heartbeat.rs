// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{providers::Lease, store::ExtendOutcome};

/// Ownership as last observed by the extension loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Held,
    /// An extension was rejected: another owner holds the lock.
    Lost,
}

/// Background task renewing a lease until stopped.
///
/// The task is a child of the caller's cancellation token, so it also stops
/// when the caller cancels.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    state: watch::Receiver<LeaseState>,
}

impl Heartbeat {
    pub(crate) fn spawn(
        lease: Arc<dyn Lease>,
        every: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let stop = parent.child_token();
        let (state_tx, state) = watch::channel(LeaseState::Held);
        let task = tokio::spawn(renew(lease, every, stop.clone(), state_tx));

        Self {
            stop,
            task: Mutex::new(Some(task)),
            state,
        }
    }

    pub(crate) fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    pub(crate) async fn lost(&self) {
        let mut state = self.state.clone();
        if state.wait_for(|s| *s == LeaseState::Lost).await.is_err() {
            // The loop ended without losing the lease
            std::future::pending::<()>().await
        }
    }

    /// Signal the loop to stop without waiting for it.
    pub(crate) fn cancel(&self) {
        self.stop.cancel();
    }

    /// Stop the loop and wait until an in-flight extension has finished.
    pub(crate) async fn stop(&self) {
        self.stop.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(%error, "lease extension task failed");
            }
        }
    }
}

async fn renew(
    lease: Arc<dyn Lease>,
    every: Duration,
    stop: CancellationToken,
    state: watch::Sender<LeaseState>,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match lease.renew().await {
            Ok(ExtendOutcome::Applied) => {
                trace!(resource = lease.resource(), owner = lease.owner(), "lease extended");
            }
            Ok(ExtendOutcome::Reclaimed) => {
                warn!(
                    resource = lease.resource(),
                    owner = lease.owner(),
                    "lease had lapsed and was reclaimed"
                );
            }
            Ok(ExtendOutcome::Rejected) => {
                warn!(
                    resource = lease.resource(),
                    owner = lease.owner(),
                    "lease lost to another owner"
                );
                state.send_replace(LeaseState::Lost);
                break;
            }
            Err(error) => {
                warn!(resource = lease.resource(), %error, "lease extension failed");
            }
        }
    }

    debug!(resource = lease.resource(), "lease extension stopped");
}
