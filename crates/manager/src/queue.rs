//! The activation queue: pending activations, the wait-settlement ledger,
//! and the readiness predicate.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{ActivationError, WaitError};
use crate::registry::ComponentRegistry;

/// Monotonic identity of one enqueued activation.
///
/// Ledger entries are keyed by this, never by the class/instance/hash
/// tuple, which may legitimately repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivationId(pub(crate) u64);

/// Settlement of an activation's wait future.
pub(crate) type Settlement = Result<(), WaitError>;

/// One queued activation request.
#[derive(Debug)]
pub(crate) struct Activation {
	pub id: ActivationId,
	pub class_id: String,
	pub instance_id: String,
	pub data_hash: Option<String>,
	pub enqueued_at: Instant,
	pub has_wait: bool,
	pub observer: Option<oneshot::Sender<Result<Value, ActivationError>>>,
}

/// Whether the queue head can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Readiness {
	Ready,
	/// Blocked on a registration or an unsettled wait future.
	Blocked,
	/// The wait future failed; the queue must be flushed.
	Failed(WaitError),
}

/// Diagnostic snapshot of the blocked part of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StallSummary {
	pub blocked: usize,
	pub class_id: String,
	pub instance_id: String,
	pub waited: Duration,
}

/// FIFO queue of pending activations plus the wait-settlement ledger.
#[derive(Debug, Default)]
pub(crate) struct ActivationQueue {
	entries: VecDeque<Activation>,
	ledger: HashMap<ActivationId, Settlement>,
}

impl ActivationQueue {
	pub fn push(&mut self, activation: Activation) {
		self.entries.push_back(activation);
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn front(&self) -> Option<&Activation> {
		self.entries.front()
	}

	/// Removes the head along with its ledger entry.
	pub fn pop(&mut self) -> Option<Activation> {
		let activation = self.entries.pop_front()?;
		self.ledger.remove(&activation.id);
		Some(activation)
	}

	/// Records the settlement of a still-queued activation's wait future.
	///
	/// Settlements for activations that were flushed in the meantime are
	/// dropped; the ledger only ever describes queued entries.
	pub fn settle(&mut self, id: ActivationId, outcome: Settlement) {
		if self.entries.iter().any(|activation| activation.id == id) {
			self.ledger.insert(id, outcome);
		}
	}

	/// Readiness of one queued activation against the current
	/// registrations and ledger.
	///
	/// A failed wait future dominates every other condition so the drain
	/// can intercept it even while registrations are still missing.
	pub fn readiness<E>(
		&self,
		activation: &Activation,
		registry: &ComponentRegistry<E>,
	) -> Readiness {
		if activation.has_wait {
			match self.ledger.get(&activation.id) {
				Some(Err(err)) => return Readiness::Failed(err.clone()),
				Some(Ok(())) => {}
				None => return Readiness::Blocked,
			}
		}
		if !registry.has_callbacks(&activation.class_id) {
			return Readiness::Blocked;
		}
		if let Some(hash) = &activation.data_hash
			&& !registry.has_factory(&activation.class_id, hash)
		{
			return Readiness::Blocked;
		}
		Readiness::Ready
	}

	/// Drops every queued activation and ledger entry.
	///
	/// Returns the dropped activations so their observers can be settled.
	pub fn flush(&mut self) -> Vec<Activation> {
		self.ledger.clear();
		self.entries.drain(..).collect()
	}

	/// Blocked entries for stall diagnostics: count plus the oldest.
	///
	/// Queue order is enqueue order, so the first blocked entry is the
	/// oldest one.
	pub fn blocked_summary<E>(&self, registry: &ComponentRegistry<E>) -> Option<StallSummary> {
		let mut blocked = self
			.entries
			.iter()
			.filter(|activation| self.readiness(activation, registry) != Readiness::Ready);
		let oldest = blocked.next()?;
		Some(StallSummary {
			blocked: 1 + blocked.count(),
			class_id: oldest.class_id.clone(),
			instance_id: oldest.instance_id.clone(),
			waited: oldest.enqueued_at.elapsed(),
		})
	}
}

/// Caller-side observer of one activation's outcome.
///
/// Resolves with the final callback's value once the activation executes,
/// or with the error that settled it.
#[derive(Debug)]
pub struct ActivationHandle {
	id: ActivationId,
	rx: oneshot::Receiver<Result<Value, ActivationError>>,
}

impl ActivationHandle {
	pub(crate) fn new(
		id: ActivationId,
		rx: oneshot::Receiver<Result<Value, ActivationError>>,
	) -> Self {
		Self { id, rx }
	}

	pub fn id(&self) -> ActivationId {
		self.id
	}

	/// Waits for the activation to settle.
	pub async fn wait(self) -> Result<Value, ActivationError> {
		match self.rx.await {
			Ok(outcome) => outcome,
			// The queue (or the whole manager) went away underneath us.
			Err(_) => Err(ActivationError::Flushed),
		}
	}
}
