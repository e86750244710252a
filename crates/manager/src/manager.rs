//! The dependency manager: registries, the activation queue, and the
//! serial drain that executes activations in submission order.
//!
//! # Ordering
//!
//! Activations execute in strict FIFO enqueue order across the whole
//! manager, regardless of which envelope enqueued them or which futures
//! they wait on. The drain only ever advances past the queue head, and it
//! awaits each activation's full callback chain before looking at the next
//! head, so a blocked or slow head blocks everything behind it.
//!
//! # Re-entrancy
//!
//! One drain runs at a time. Concurrent requests collapse into the running
//! drain via a request flag it re-checks between passes, so a registration
//! landing mid-drain is picked up without a second drain starting.
//!
//! # Failure propagation
//!
//! A callback failure settles only its own activation; the drain moves on.
//! A failed wait future at the head flushes the whole queue instead, since
//! submission order cannot be preserved past the failure, and surfaces a
//! [`DrainError`] out of the draining call.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use djc_wire::{TagDescriptor, TagName};

use crate::assets::{self, AssetKind, AssetRegistry};
use crate::error::{
	ActivationError, BoxError, DrainError, LoadError, ManagerInitError, WaitError,
};
use crate::host::{Host, ScriptLoadFuture};
use crate::queue::{Activation, ActivationHandle, ActivationId, ActivationQueue, Readiness};
use crate::registry::{Callback, CallbackFuture, ComponentRegistry, DataFactory, InstanceContext};
use crate::stall;

/// Tuning knobs for a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
	/// How often the stall reporter inspects a non-empty queue.
	pub stall_report_interval: Duration,
}

impl Default for ManagerConfig {
	fn default() -> Self {
		Self {
			stall_report_interval: Duration::from_secs(5),
		}
	}
}

/// A wait future attached to an activation at enqueue time.
///
/// The activation may not execute until the future resolves successfully;
/// a failure flushes the queue at that activation.
pub type WaitFuture = BoxFuture<'static, Result<(), WaitError>>;

/// A script element handed back by [`Manager::load_script`].
pub struct ScriptLoad<E> {
	/// The built element; inserted unless the URL was already loaded.
	pub element: E,
	/// Resolves once the element's load event has fired.
	pub loaded: ScriptLoadFuture,
}

pub(crate) struct ManagerState<E> {
	pub queue: ActivationQueue,
	pub registry: ComponentRegistry<E>,
	pub assets: AssetRegistry,
	pub stall_task: Option<JoinHandle<()>>,
	pub seen_envelopes: HashSet<u64>,
}

pub(crate) struct ManagerInner<H: Host> {
	pub host: Arc<H>,
	pub config: ManagerConfig,
	pub runtime: Handle,
	pub state: Mutex<ManagerState<H::Element>>,
	pub started: AtomicBool,
	pub stall_reports: AtomicUsize,
	drain_lock: tokio::sync::Mutex<()>,
	drain_requested: AtomicBool,
	next_activation: AtomicU64,
}

/// Client-side component bootstrapping and dependency manager.
///
/// Cheap to clone; clones share all state.
pub struct Manager<H: Host> {
	inner: Arc<ManagerInner<H>>,
}

impl<H: Host> Clone for Manager<H> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

struct ExecutionPlan<E> {
	activation: Activation,
	callbacks: Vec<Callback<E>>,
	factory: Option<DataFactory>,
}

impl<H: Host> Manager<H> {
	/// Creates a manager over `host` with the default configuration.
	///
	/// Must be called from within a Tokio runtime; drain requests and the
	/// background watchers are spawned onto it.
	pub fn new(host: Arc<H>) -> Result<Self, ManagerInitError> {
		Self::with_config(host, ManagerConfig::default())
	}

	/// Creates a manager over `host` with an explicit configuration.
	pub fn with_config(host: Arc<H>, config: ManagerConfig) -> Result<Self, ManagerInitError> {
		let runtime = Handle::try_current().map_err(|_| ManagerInitError::NoRuntime)?;
		Ok(Self {
			inner: Arc::new(ManagerInner {
				host,
				config,
				runtime,
				state: Mutex::new(ManagerState {
					queue: ActivationQueue::default(),
					registry: ComponentRegistry::default(),
					assets: AssetRegistry::default(),
					stall_task: None,
					seen_envelopes: HashSet::new(),
				}),
				started: AtomicBool::new(false),
				stall_reports: AtomicUsize::new(0),
				drain_lock: tokio::sync::Mutex::new(()),
				drain_requested: AtomicBool::new(false),
				next_activation: AtomicU64::new(1),
			}),
		})
	}

	pub(crate) fn inner(&self) -> &Arc<ManagerInner<H>> {
		&self.inner
	}

	/// Appends a callback to `class_id`'s chain.
	///
	/// A new registration may unblock the queue head, so a background
	/// drain is requested.
	pub fn register_callback<F>(&self, class_id: &str, callback: F)
	where
		F: Fn(Option<Value>, InstanceContext<H::Element>) -> CallbackFuture + Send + Sync + 'static,
	{
		self.inner
			.state
			.lock()
			.registry
			.register_callback(class_id, Arc::new(callback));
		self.request_drain();
	}

	/// Binds a data factory for `(class_id, data_hash)`, replacing any
	/// previous binding.
	pub fn register_data_factory<F>(&self, class_id: &str, data_hash: &str, factory: F)
	where
		F: Fn() -> Result<Value, BoxError> + Send + Sync + 'static,
	{
		self.inner
			.state
			.lock()
			.registry
			.register_data_factory(class_id, data_hash, Arc::new(factory));
		self.request_drain();
	}

	/// Queues an activation for one component instance.
	///
	/// The activation executes once everything queued before it has
	/// executed and its own prerequisites hold: a callback chain for
	/// `class_id`, a data factory when `data_hash` is given, and a
	/// successful `wait` when one is attached. The handle resolves with
	/// the final callback's value.
	pub fn call_component(
		&self,
		class_id: &str,
		instance_id: &str,
		data_hash: Option<&str>,
		wait: Option<WaitFuture>,
	) -> ActivationHandle {
		let id = ActivationId(self.inner.next_activation.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = oneshot::channel();
		let activation = Activation {
			id,
			class_id: class_id.to_owned(),
			instance_id: instance_id.to_owned(),
			data_hash: data_hash.map(str::to_owned),
			enqueued_at: Instant::now(),
			has_wait: wait.is_some(),
			observer: Some(tx),
		};
		{
			let mut state = self.inner.state.lock();
			state.queue.push(activation);
			self.arm_stall_reporter(&mut state);
		}
		if let Some(wait) = wait {
			let manager = self.clone();
			self.inner.runtime.spawn(async move {
				let outcome = wait.await;
				manager.inner.state.lock().queue.settle(id, outcome);
				manager.background_drain().await;
			});
		}
		self.request_drain();
		ActivationHandle::new(id, rx)
	}

	/// Marks `url` loaded, resolving every waiter for `(kind, url)`.
	pub fn mark_loaded(&self, kind: AssetKind, url: &str) {
		self.inner.state.lock().assets.mark_loaded(kind, url);
	}

	pub fn is_loaded(&self, kind: AssetKind, url: &str) -> bool {
		self.inner.state.lock().assets.is_loaded(kind, url)
	}

	/// Number of URLs marked loaded for `kind`.
	pub fn loaded_count(&self, kind: AssetKind) -> usize {
		self.inner.state.lock().assets.loaded_count(kind)
	}

	/// Future resolving once every URL in `urls` is loaded.
	pub fn wait_for<I, S>(&self, kind: AssetKind, urls: I) -> BoxFuture<'static, ()>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let receivers = {
			let mut state = self.inner.state.lock();
			urls.into_iter()
				.map(|url| state.assets.waiter(kind, url.as_ref()))
				.collect()
		};
		assets::await_all(receivers).boxed()
	}

	/// Builds and inserts a script element from `tag`.
	///
	/// Insertion is the idempotency point: the URL is marked loaded (and
	/// its waiters resolved) when the element is appended, so a second
	/// descriptor for the same URL builds an element but does not touch
	/// the document and resolves immediately. Descriptors without a source
	/// URL are inline-only: appended but never tracked.
	pub fn load_script(&self, tag: &TagDescriptor) -> Result<ScriptLoad<H::Element>, LoadError> {
		if tag.tag != TagName::Script {
			return Err(LoadError::TagMismatch {
				expected: TagName::Script,
				found: tag.tag,
			});
		}
		if let Some(url) = tag.url() {
			let mut state = self.inner.state.lock();
			if state.assets.is_loaded(AssetKind::Script, url) {
				drop(state);
				let (element, _discarded) = self.inner.host.create_script(tag);
				return Ok(ScriptLoad {
					element,
					loaded: futures::future::ready(Ok(())).boxed(),
				});
			}
			state.assets.mark_loaded(AssetKind::Script, url);
		}
		let (element, loaded) = self.inner.host.create_script(tag);
		self.inner.host.append_script(&element);
		Ok(ScriptLoad { element, loaded })
	}

	/// Builds and inserts a stylesheet element from `tag`.
	///
	/// Stylesheets are fire-and-forget: no load event is awaited. Returns
	/// the inserted element, or `None` when the href was already loaded.
	pub fn load_stylesheet(&self, tag: &TagDescriptor) -> Result<Option<H::Element>, LoadError> {
		if tag.tag != TagName::Link {
			return Err(LoadError::TagMismatch {
				expected: TagName::Link,
				found: tag.tag,
			});
		}
		if let Some(url) = tag.url() {
			let mut state = self.inner.state.lock();
			if state.assets.is_loaded(AssetKind::Stylesheet, url) {
				return Ok(None);
			}
			state.assets.mark_loaded(AssetKind::Stylesheet, url);
		}
		let element = self.inner.host.create_stylesheet(tag);
		self.inner.host.append_stylesheet(&element);
		Ok(Some(element))
	}

	/// Number of activations still queued.
	pub fn pending_activations(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	/// Number of stall diagnostics emitted so far.
	pub fn stall_report_count(&self) -> usize {
		self.inner.stall_reports.load(Ordering::Relaxed)
	}

	/// Requests a drain without waiting for it.
	///
	/// Fatal errors on this path are logged; callers that need them await
	/// [`drain`](Self::drain) directly.
	pub(crate) fn request_drain(&self) {
		let manager = self.clone();
		self.inner.runtime.spawn(async move {
			manager.background_drain().await;
		});
	}

	async fn background_drain(&self) {
		if let Err(err) = self.drain().await {
			tracing::error!(
				class_id = %err.class_id,
				instance_id = %err.instance_id,
				error = %err.source,
				"drain aborted by upstream script failure",
			);
		}
	}

	/// Drains consecutive ready activations from the queue head.
	///
	/// Concurrent calls collapse into the running drain. Returns the fatal
	/// error when the head's wait future has failed; the queue has been
	/// flushed by then and trailing activations observe
	/// [`ActivationError::Flushed`].
	pub async fn drain(&self) -> Result<(), DrainError> {
		self.inner.drain_requested.store(true, Ordering::SeqCst);
		loop {
			{
				let Ok(_guard) = self.inner.drain_lock.try_lock() else {
					// The running drain will observe the request flag.
					return Ok(());
				};
				while self.inner.drain_requested.swap(false, Ordering::SeqCst) {
					self.drain_pass().await?;
				}
			}
			// A request that raced the guard release is picked up here.
			if !self.inner.drain_requested.load(Ordering::SeqCst) {
				return Ok(());
			}
		}
	}

	/// One head-to-tail pass: execute ready heads until the head blocks or
	/// the queue empties.
	async fn drain_pass(&self) -> Result<(), DrainError> {
		loop {
			let plan = {
				let mut state = self.inner.state.lock();
				let Some(head) = state.queue.front() else {
					self.disarm_stall_reporter(&mut state);
					return Ok(());
				};
				match state.queue.readiness(head, &state.registry) {
					// The head blocks the tail; order is preserved by
					// stopping here, not by skipping ahead.
					Readiness::Blocked => return Ok(()),
					Readiness::Failed(source) => {
						let failed = state.queue.pop().expect("head exists");
						let mut dropped = state.queue.flush();
						self.disarm_stall_reporter(&mut state);
						drop(state);
						dropped.insert(0, failed);
						return Err(self.flush_observers(dropped, source));
					}
					Readiness::Ready => {
						let activation = state.queue.pop().expect("head exists");
						let callbacks = state.registry.callbacks(&activation.class_id);
						let factory = activation.data_hash.as_deref().and_then(|hash| {
							state.registry.factory(&activation.class_id, hash)
						});
						ExecutionPlan {
							activation,
							callbacks,
							factory,
						}
					}
				}
			};
			self.execute(plan).await;
		}
	}

	/// Settles the observers of flushed activations and builds the fatal
	/// error for the failed head.
	fn flush_observers(&self, dropped: Vec<Activation>, source: WaitError) -> DrainError {
		let head = &dropped[0];
		let err = DrainError {
			class_id: head.class_id.clone(),
			instance_id: head.instance_id.clone(),
			source,
		};
		for mut activation in dropped {
			if let Some(observer) = activation.observer.take() {
				let _ = observer.send(Err(ActivationError::Flushed));
			}
		}
		err
	}

	/// Runs one ready activation and settles its observer.
	///
	/// Failures settle only this activation; the drain continues either
	/// way.
	async fn execute(&self, plan: ExecutionPlan<H::Element>) {
		let ExecutionPlan {
			mut activation,
			callbacks,
			factory,
		} = plan;
		let outcome = self.run_activation(&activation, callbacks, factory).await;
		let Some(observer) = activation.observer.take() else {
			return;
		};
		if let Err(Err(err)) = observer.send(outcome) {
			// Nobody is listening; surface the failure here instead.
			tracing::warn!(
				class_id = %activation.class_id,
				instance_id = %activation.instance_id,
				error = %err,
				"activation failed with no observer",
			);
		}
	}

	async fn run_activation(
		&self,
		activation: &Activation,
		callbacks: Vec<Callback<H::Element>>,
		factory: Option<DataFactory>,
	) -> Result<Value, ActivationError> {
		if callbacks.is_empty() {
			return Err(ActivationError::NoCallback {
				class_id: activation.class_id.clone(),
			});
		}
		let elements = self.inner.host.elements_for_instance(&activation.instance_id);
		if elements.is_empty() {
			return Err(ActivationError::NoElements {
				instance_id: activation.instance_id.clone(),
			});
		}
		// The factory runs at execution time, never at registration, so
		// every activation gets an independent data object.
		let data = match (&activation.data_hash, factory) {
			(Some(hash), Some(factory)) => match factory() {
				Ok(value) => Some(value),
				Err(source) => {
					return Err(ActivationError::DataFactory {
						class_id: activation.class_id.clone(),
						data_hash: hash.clone(),
						source,
					});
				}
			},
			(Some(hash), None) => {
				return Err(ActivationError::NoDataFactory {
					class_id: activation.class_id.clone(),
					data_hash: hash.clone(),
				});
			}
			(None, _) => None,
		};
		let ctx = InstanceContext {
			class_id: activation.class_id.clone(),
			instance_id: activation.instance_id.clone(),
			elements,
		};
		let mut value = Value::Null;
		for callback in &callbacks {
			value = self
				.invoke_callback(callback, data.clone(), ctx.clone(), activation)
				.await?;
		}
		Ok(value)
	}

	/// Invokes one callback with panic isolation.
	///
	/// A panic while building the future and a panic inside the future are
	/// both captured and settle the activation instead of tearing down the
	/// drain.
	async fn invoke_callback(
		&self,
		callback: &Callback<H::Element>,
		data: Option<Value>,
		ctx: InstanceContext<H::Element>,
		activation: &Activation,
	) -> Result<Value, ActivationError> {
		let panicked = || ActivationError::CallbackPanic {
			class_id: activation.class_id.clone(),
			instance_id: activation.instance_id.clone(),
		};
		let future = std::panic::catch_unwind(AssertUnwindSafe(|| callback(data, ctx)))
			.map_err(|_| panicked())?;
		match AssertUnwindSafe(future).catch_unwind().await {
			Ok(Ok(value)) => Ok(value),
			Ok(Err(source)) => Err(ActivationError::Callback {
				class_id: activation.class_id.clone(),
				instance_id: activation.instance_id.clone(),
				source,
			}),
			Err(_) => Err(panicked()),
		}
	}

	fn arm_stall_reporter(&self, state: &mut ManagerState<H::Element>) {
		if state.stall_task.is_none() {
			state.stall_task = Some(stall::spawn_reporter(
				&self.inner,
				self.inner.config.stall_report_interval,
			));
		}
	}

	fn disarm_stall_reporter(&self, state: &mut ManagerState<H::Element>) {
		if let Some(task) = state.stall_task.take() {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests;
