//! Incremental poll scheduler
//!
//! The correctness backstop for the open conversation: a fixed-interval timer
//! that fetches everything at or past the reconciler's watermark and feeds it
//! into the merge point. Push delivery that is delayed, missed, or never
//! established is bounded by one poll interval of staleness.
//!
//! Each tick issues its fetch in its own task, so a hung request is superseded
//! by the next scheduled poll rather than awaited; a late response either
//! merges idempotently or dies on the epoch check.

use crate::manager::ScopeContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

/// Fixed-interval poll loop bound to one conversation scope
pub struct PollScheduler {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PollScheduler {
    /// Spawn the poll loop
    pub(crate) fn start(context: Arc<ScopeContext>, poll_interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !context.is_current() {
                            debug!("Poll loop for epoch {} ended by scope change", context.scope_epoch);
                            break;
                        }
                        let context = context.clone();
                        tokio::spawn(async move {
                            poll_once(context).await;
                        });
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Poll scheduler shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Stop the poll loop
    pub(crate) fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.task.abort();
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One poll cycle: incremental fetch, merge, follow-up side effects
async fn poll_once(context: Arc<ScopeContext>) {
    if !context.is_current() {
        return;
    }

    let after = context.reconciler.watermark().await;
    match context
        .store
        .fetch_conversation(&context.self_id, &context.counterpart_id, after)
        .await
    {
        Ok(batch) => {
            let outcome = context
                .reconciler
                .ingest_poll(batch, context.scope_epoch)
                .await;
            context.handle_outcome(outcome).await;
        }
        Err(error) => {
            // Read failures recover silently on the next cycle.
            debug!("Poll fetch failed, next cycle will retry: {}", error);
        }
    }

    // The conversation list refreshes on the poll cadence regardless of
    // whether the open conversation itself changed.
    context.refresh_summaries().await;
}
