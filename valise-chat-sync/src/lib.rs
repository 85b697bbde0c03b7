//! Valise Chat Synchronization Core
//!
//! Keeps a two-party conversation's message list consistent, ordered, and
//! duplicate-free while three independent sources feed it at the same time:
//! an optimistic local write made the instant the operator presses send, the
//! server-push event stream, and a fixed-interval incremental poll used as
//! the correctness backstop when push delivery is delayed, missed, or never
//! established. The same stream also drives the per-counterpart conversation
//! list (last message and unread count).
//!
//! All mutations funnel through one serialized merge point and every
//! asynchronous result is tagged with a scope epoch, so switching the open
//! conversation can never leak stale events into the new view.

pub mod config;
pub mod events;
pub mod manager;
pub mod poll;
pub mod reconciler;
pub mod summary;

pub use config::SyncConfig;
pub use events::SyncEvent;
pub use manager::ConversationManager;
pub use poll::PollScheduler;
pub use reconciler::{IngestOutcome, MessageReconciler};
pub use summary::{aggregate, SummaryAggregator};
