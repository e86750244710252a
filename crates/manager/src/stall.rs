//! Periodic stall diagnostics for the activation queue.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::host::Host;
use crate::manager::ManagerInner;

/// Spawns the recurring reporter for a queue that just became non-empty.
///
/// The reporter is observational only: each tick it inspects the queue for
/// blocked activations and logs a single diagnostic naming their count and
/// the oldest one. It holds the manager weakly and exits on its own once
/// the manager is gone; drains abort it through the stored handle when the
/// queue empties.
pub(crate) fn spawn_reporter<H: Host>(
	inner: &Arc<ManagerInner<H>>,
	interval: Duration,
) -> JoinHandle<()> {
	let weak: Weak<ManagerInner<H>> = Arc::downgrade(inner);
	inner.runtime.spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// An interval's first tick completes immediately; swallow it so
		// reports start one full interval after arming.
		ticker.tick().await;
		loop {
			ticker.tick().await;
			let Some(inner) = weak.upgrade() else { return };
			let summary = {
				let state = inner.state.lock();
				state.queue.blocked_summary(&state.registry)
			};
			let Some(summary) = summary else { continue };
			inner.stall_reports.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
			tracing::warn!(
				blocked = summary.blocked,
				class_id = %summary.class_id,
				instance_id = %summary.instance_id,
				waited_ms = summary.waited.as_millis() as u64,
				"activation queue is stalled",
			);
		}
	})
}
