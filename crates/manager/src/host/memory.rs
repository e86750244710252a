//! An in-memory document for headless use and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{FutureExt, StreamExt};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use djc_wire::{TagDescriptor, TagName, instance_attr};

use crate::error::ScriptLoadError;
use crate::host::{EnvelopeNode, Host, ScriptLoadFuture};

/// A node in the in-memory document.
#[derive(Debug, Clone)]
pub struct MemoryElement {
	inner: Arc<ElementInner>,
}

#[derive(Debug)]
struct ElementInner {
	id: u64,
	tag: String,
	attrs: Vec<(String, Option<String>)>,
	content: String,
	pending_load: Mutex<Option<PendingLoad>>,
}

#[derive(Debug)]
struct PendingLoad {
	url: String,
	tx: oneshot::Sender<Result<(), ScriptLoadError>>,
}

impl MemoryElement {
	pub fn node_id(&self) -> u64 {
		self.inner.id
	}

	pub fn tag(&self) -> &str {
		&self.inner.tag
	}

	/// The attribute's value; `None` for valueless or absent attributes.
	pub fn attr(&self, name: &str) -> Option<&str> {
		self.inner
			.attrs
			.iter()
			.find(|(attr, _)| attr == name)
			.and_then(|(_, value)| value.as_deref())
	}

	pub fn has_attr(&self, name: &str) -> bool {
		self.inner.attrs.iter().any(|(attr, _)| attr == name)
	}

	pub fn content(&self) -> &str {
		&self.inner.content
	}

	fn take_pending(&self) -> Option<PendingLoad> {
		self.inner.pending_load.lock().take()
	}
}

struct DocumentState {
	head: Vec<MemoryElement>,
	body: Vec<MemoryElement>,
	instances: HashMap<String, Vec<MemoryElement>>,
	envelopes: Vec<EnvelopeNode>,
}

/// Headless in-memory document implementing [`Host`].
///
/// Script loads either complete as soon as the element is appended
/// ([`MemoryHost::new`]) or stay pending until
/// [`finish_script`](MemoryHost::finish_script) is called
/// ([`MemoryHost::gated`]), mirroring a browser that is still fetching.
pub struct MemoryHost {
	auto_load: bool,
	next_node: AtomicU64,
	state: Mutex<DocumentState>,
	envelope_tx: mpsc::UnboundedSender<EnvelopeNode>,
	envelope_rx: Mutex<Option<mpsc::UnboundedReceiver<EnvelopeNode>>>,
}

impl Default for MemoryHost {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryHost {
	/// A document whose script loads complete at append time.
	pub fn new() -> Self {
		Self::with_auto_load(true)
	}

	/// A document whose script loads stay pending until released with
	/// [`finish_script`](MemoryHost::finish_script).
	pub fn gated() -> Self {
		Self::with_auto_load(false)
	}

	fn with_auto_load(auto_load: bool) -> Self {
		let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
		Self {
			auto_load,
			next_node: AtomicU64::new(1),
			state: Mutex::new(DocumentState {
				head: Vec::new(),
				body: Vec::new(),
				instances: HashMap::new(),
				envelopes: Vec::new(),
			}),
			envelope_tx,
			envelope_rx: Mutex::new(Some(envelope_rx)),
		}
	}

	fn next_id(&self) -> u64 {
		self.next_node.fetch_add(1, Ordering::Relaxed)
	}

	fn build_element(&self, tag: &str, descriptor: &TagDescriptor) -> MemoryElement {
		MemoryElement {
			inner: Arc::new(ElementInner {
				id: self.next_id(),
				tag: tag.to_owned(),
				attrs: descriptor
					.rendered_attrs()
					.map(|(name, value)| (name.to_owned(), value.map(str::to_owned)))
					.collect(),
				content: descriptor.content.clone(),
				pending_load: Mutex::new(None),
			}),
		}
	}

	/// Adds a `<div>` carrying the instance marker for each id in
	/// `instance_ids` to the document body.
	pub fn insert_instance_element(&self, instance_ids: &[&str]) -> MemoryElement {
		let element = MemoryElement {
			inner: Arc::new(ElementInner {
				id: self.next_id(),
				tag: String::from("div"),
				attrs: instance_ids
					.iter()
					.map(|id| (instance_attr(id), None))
					.collect(),
				content: String::new(),
				pending_load: Mutex::new(None),
			}),
		};
		let mut state = self.state.lock();
		state.body.push(element.clone());
		for id in instance_ids {
			state
				.instances
				.entry((*id).to_owned())
				.or_default()
				.push(element.clone());
		}
		element
	}

	/// Adds an envelope element to the document and replays it on the
	/// mutation stream.
	///
	/// Replaying exercises the scan/observe overlap the ingestor has to
	/// de-duplicate.
	pub fn push_envelope(&self, payload: &str) -> u64 {
		let node = EnvelopeNode {
			node_id: self.next_id(),
			payload: payload.to_owned(),
		};
		self.state.lock().envelopes.push(node.clone());
		let _ = self.envelope_tx.send(node.clone());
		node.node_id
	}

	/// Completes the pending load of the appended script with `url`.
	pub fn finish_script(&self, url: &str, result: Result<(), ScriptLoadError>) {
		let state = self.state.lock();
		for element in &state.body {
			let matches = element
				.inner
				.pending_load
				.lock()
				.as_ref()
				.is_some_and(|pending| pending.url == url);
			if matches && let Some(pending) = element.take_pending() {
				let _ = pending.tx.send(result.clone());
			}
		}
	}

	/// Number of appended script elements whose `src` is `url`.
	pub fn scripts_with_src(&self, url: &str) -> usize {
		self.state
			.lock()
			.body
			.iter()
			.filter(|element| element.tag() == "script" && element.attr("src") == Some(url))
			.count()
	}

	/// Number of appended stylesheet elements whose `href` is `url`.
	pub fn stylesheets_with_href(&self, url: &str) -> usize {
		self.state
			.lock()
			.head
			.iter()
			.filter(|element| element.tag() == "link" && element.attr("href") == Some(url))
			.count()
	}

	pub fn head_len(&self) -> usize {
		self.state.lock().head.len()
	}

	pub fn body_len(&self) -> usize {
		self.state.lock().body.len()
	}
}

impl Host for MemoryHost {
	type Element = MemoryElement;

	fn elements_for_instance(&self, instance_id: &str) -> Vec<MemoryElement> {
		self.state
			.lock()
			.instances
			.get(instance_id)
			.cloned()
			.unwrap_or_default()
	}

	fn create_script(&self, tag: &TagDescriptor) -> (MemoryElement, ScriptLoadFuture) {
		let element = self.build_element("script", tag);
		let Some(url) = tag.url() else {
			return (element, futures::future::ready(Ok(())).boxed());
		};
		let (tx, rx) = oneshot::channel();
		*element.inner.pending_load.lock() = Some(PendingLoad {
			url: url.to_owned(),
			tx,
		});
		let loaded = async move {
			match rx.await {
				Ok(result) => result,
				// Element dropped without ever being appended.
				Err(_) => Ok(()),
			}
		}
		.boxed();
		(element, loaded)
	}

	fn append_script(&self, element: &MemoryElement) {
		self.state.lock().body.push(element.clone());
		if self.auto_load && let Some(pending) = element.take_pending() {
			let _ = pending.tx.send(Ok(()));
		}
	}

	fn create_stylesheet(&self, tag: &TagDescriptor) -> MemoryElement {
		let name = match tag.tag {
			TagName::Link => "link",
			TagName::Script => "script",
		};
		self.build_element(name, tag)
	}

	fn append_stylesheet(&self, element: &MemoryElement) {
		self.state.lock().head.push(element.clone());
	}

	fn existing_envelopes(&self) -> Vec<EnvelopeNode> {
		self.state.lock().envelopes.clone()
	}

	fn envelope_stream(&self) -> BoxStream<'static, EnvelopeNode> {
		match self.envelope_rx.lock().take() {
			Some(rx) => futures::stream::unfold(rx, |mut rx| async move {
				rx.recv().await.map(|node| (node, rx))
			})
			.boxed(),
			None => futures::stream::empty().boxed(),
		}
	}
}
