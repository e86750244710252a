//! Error types for the dependency manager.

use thiserror::Error;

use djc_wire::TagName;

/// Boxed error produced by user-supplied callbacks and data factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors constructing a [`Manager`](crate::Manager).
#[derive(Debug, Error)]
pub enum ManagerInitError {
	/// The manager spawns background tasks and so must be created from
	/// within a Tokio runtime.
	#[error("no tokio runtime available")]
	NoRuntime,
}

/// Errors from the asset loader entry points.
#[derive(Debug, Error)]
pub enum LoadError {
	/// A descriptor of the wrong element kind was handed to a loader.
	#[error("expected a {expected:?} tag, got {found:?}")]
	TagMismatch { expected: TagName, found: TagName },
}

/// A script element's error event fired instead of its load event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("script failed to load: {url}")]
pub struct ScriptLoadError {
	pub url: String,
}

/// Failure reported by an activation's wait future.
///
/// Cloneable so that one shared wait future can settle every activation of
/// an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct WaitError {
	message: String,
}

impl WaitError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
		}
	}

	pub fn message(&self) -> &str {
		&self.message
	}
}

impl From<ScriptLoadError> for WaitError {
	fn from(err: ScriptLoadError) -> Self {
		Self::new(err.to_string())
	}
}

/// Ways a single activation can fail without affecting the rest of the
/// queue.
#[derive(Debug, Error)]
pub enum ActivationError {
	/// The callback list for the class disappeared between the readiness
	/// check and execution.
	#[error("no callback registered for component class {class_id}")]
	NoCallback { class_id: String },

	/// No document element carries the instance marker attribute.
	#[error("no elements found for component instance {instance_id}")]
	NoElements { instance_id: String },

	/// The data factory disappeared between the readiness check and
	/// execution.
	#[error("no data factory registered for class {class_id} with hash {data_hash}")]
	NoDataFactory { class_id: String, data_hash: String },

	/// The data factory failed to produce a data object.
	#[error("data factory failed for class {class_id} with hash {data_hash}")]
	DataFactory {
		class_id: String,
		data_hash: String,
		#[source]
		source: BoxError,
	},

	/// A component callback returned an error.
	#[error("callback failed for component class {class_id} instance {instance_id}")]
	Callback {
		class_id: String,
		instance_id: String,
		#[source]
		source: BoxError,
	},

	/// A component callback panicked.
	#[error("callback panicked for component class {class_id} instance {instance_id}")]
	CallbackPanic { class_id: String, instance_id: String },

	/// The queue was flushed by an upstream failure before this activation
	/// could run.
	#[error("activation flushed by an upstream script load failure")]
	Flushed,
}

/// Fatal error surfaced by a drain: the head activation's wait future
/// failed.
///
/// Submission order cannot be preserved past the failure, so the queue and
/// ledger have been cleared and the stall reporter disarmed by the time
/// this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("scripts failed to load for component class {class_id} instance {instance_id}")]
pub struct DrainError {
	pub class_id: String,
	pub instance_id: String,
	#[source]
	pub source: WaitError,
}

/// Errors processing one envelope payload.
#[derive(Debug, Error)]
pub enum IngestError {
	/// The payload, or one of its fields, failed to decode.
	#[error("invalid envelope payload")]
	Decode(#[from] djc_wire::EnvelopeDecodeError),

	/// A tag descriptor named the wrong element kind for its field.
	#[error(transparent)]
	Load(#[from] LoadError),

	/// Draining after ingestion hit a fatal upstream failure.
	#[error(transparent)]
	Drain(#[from] DrainError),
}
