//! Background worker draining reconcile requests.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::events::ClusterRuntime;
use crate::lock::DistributedLock;
use crate::registrar::MemberAddressRegistrar;
use crate::registry::MemberRegistry;

/// Drains the reconcile request queue on a spawned tokio task.
///
/// Requests enqueued by the event listener are coalesced: everything queued
/// at wake-up time collapses into a single reconciliation. With a non-zero
/// refresh interval the worker additionally re-registers this process's
/// addresses periodically (missed ticks are skipped, not replayed).
/// Reconciliation and refresh failures are logged and retried on the next
/// trigger, never escalated — the registry converges eventually.
pub struct ReconcileWorker {
    running: Arc<AtomicBool>,
    stop_tx: Sender<()>,
    task: JoinHandle<()>,
}

impl ReconcileWorker {
    /// Spawn the worker onto the current tokio runtime.
    pub fn spawn<I, R, L, C>(
        registrar: Arc<MemberAddressRegistrar<I, R, L, C>>,
        requests: Receiver<()>,
        refresh_interval: Duration,
    ) -> Self
    where
        I: Clone + Eq + Hash + Debug + Send + Sync + 'static,
        R: MemberRegistry + 'static,
        L: DistributedLock + 'static,
        C: ClusterRuntime<I> + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = async_channel::bounded::<()>(1);

        let flag = Arc::clone(&running);
        let task = tokio::spawn(async move {
            run_loop(registrar, requests, stop_rx, refresh_interval, flag).await;
        });

        Self {
            running,
            stop_tx,
            task,
        }
    }

    /// Whether the worker loop is still alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the worker and wait for its task to finish.
    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.try_send(());
        if let Err(err) = self.task.await {
            warn!(error = %err, "reconcile worker task ended abnormally");
        }
        debug!("reconcile worker stopped");
    }
}

async fn run_loop<I, R, L, C>(
    registrar: Arc<MemberAddressRegistrar<I, R, L, C>>,
    requests: Receiver<()>,
    stop_rx: Receiver<()>,
    refresh_interval: Duration,
    running: Arc<AtomicBool>,
) where
    I: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    R: MemberRegistry,
    L: DistributedLock,
    C: ClusterRuntime<I>,
{
    let mut refresh = (refresh_interval > Duration::ZERO).then(|| {
        let mut interval = tokio::time::interval(refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });
    info!(
        refresh_enabled = refresh.is_some(),
        "reconcile worker started"
    );

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let tick = async {
            match refresh.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = stop_rx.recv() => break,
            request = requests.recv() => match request {
                Ok(()) => {
                    // Coalesce everything queued so far into one pass.
                    while requests.try_recv().is_ok() {}
                    if let Err(err) = registrar.reconcile().await {
                        warn!(error = %err, "reconciliation failed, will retry on next trigger");
                    }
                }
                Err(_) => {
                    debug!("reconcile queue closed, stopping worker");
                    break;
                }
            },
            _ = tick => {
                if let Err(err) = registrar.refresh_address_registration().await {
                    warn!(error = %err, "periodic registration refresh failed");
                }
            }
        }
    }
    running.store(false, Ordering::SeqCst);
}
