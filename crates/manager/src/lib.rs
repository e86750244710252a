//! Client-side component bootstrapping and dependency manager.
//!
//! A server-side templating system emits HTML whose activation envelopes
//! (`<script type="application/json" data-djc>` elements) declare assets to
//! load, per-instance data bindings, and activation requests. This crate is
//! the client core that ingests those envelopes and runs each instance's
//! callback chain exactly once, in submission order, only when all of its
//! prerequisites are satisfied.
//!
//! The pieces, leaves first:
//!
//! - an asset registry tracking loaded script/stylesheet URLs, with waiter
//!   latches for callers that need to await them;
//! - an asset loader that builds elements from tag descriptors and inserts
//!   each URL at most once;
//! - registries for component callbacks and per-instance data factories;
//! - the activation queue: a serial, dependency-gated drain over pending
//!   activations, with a settlement ledger for wait futures and a periodic
//!   stall reporter;
//! - an envelope ingestor that scans the document at startup and watches
//!   for envelopes inserted later.
//!
//! The document is abstracted behind [`Host`] so the core runs without a
//! browser; [`host::memory::MemoryHost`] is a headless implementation the
//! test suite (and producer-side tests) run against.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::FutureExt as _;
//!
//! use djc_manager::Manager;
//! use djc_manager::host::memory::MemoryHost;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let host = Arc::new(MemoryHost::new());
//! let manager = Manager::new(Arc::clone(&host))?;
//! manager.register_callback("table", |data, ctx| {
//! 	async move {
//! 		let _ = (data, ctx.elements.len());
//! 		Ok(serde_json::Value::Null)
//! 	}
//! 	.boxed()
//! });
//! manager.start().await?;
//! # Ok(())
//! # }
//! ```

mod assets;
mod error;
pub mod host;
mod ingest;
mod manager;
mod queue;
mod registry;
mod stall;

pub use assets::AssetKind;
pub use error::{
	ActivationError, BoxError, DrainError, IngestError, LoadError, ManagerInitError,
	ScriptLoadError, WaitError,
};
pub use host::{EnvelopeNode, Host, ScriptLoadFuture};
pub use manager::{Manager, ManagerConfig, ScriptLoad, WaitFuture};
pub use queue::{ActivationHandle, ActivationId};
pub use registry::{Callback, CallbackFuture, DataFactory, InstanceContext};
