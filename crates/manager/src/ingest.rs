//! Envelope ingestion: the startup scan, the mutation watcher, and the
//! producer's direct payload path.

use std::sync::atomic::Ordering;

use futures::FutureExt;
use futures::StreamExt;
use futures::future::join_all;

use djc_wire::{DecodedEnvelope, Envelope};

use crate::assets::AssetKind;
use crate::error::{BoxError, DrainError, IngestError, WaitError};
use crate::host::{EnvelopeNode, Host};
use crate::manager::Manager;

impl<H: Host> Manager<H> {
	/// Ingests every envelope already in the document, in document order,
	/// then watches for envelopes inserted later.
	///
	/// A fatal drain error during the startup scan propagates to the
	/// caller; watcher-side failures settle only their own envelope and
	/// are logged. Calling `start` a second time is a logged no-op.
	pub async fn start(&self) -> Result<(), DrainError> {
		if self.inner().started.swap(true, Ordering::SeqCst) {
			tracing::warn!("manager already started; ignoring");
			return Ok(());
		}
		for node in self.inner().host.existing_envelopes() {
			if let Err(err) = self.ingest_envelope(&node).await {
				match err {
					IngestError::Drain(fatal) => return Err(fatal),
					other => {
						tracing::error!(
							node_id = node.node_id,
							error = %other,
							"failed to process envelope",
						);
					}
				}
			}
		}
		let manager = self.clone();
		let mut stream = self.inner().host.envelope_stream();
		self.inner().runtime.spawn(async move {
			while let Some(node) = stream.next().await {
				if let Err(err) = manager.ingest_envelope(&node).await {
					tracing::error!(
						node_id = node.node_id,
						error = %err,
						"failed to process envelope",
					);
				}
			}
		});
		Ok(())
	}

	/// Processes one producer payload handed to the manager directly,
	/// without an envelope element.
	///
	/// This is the path for payloads fetched as scripts (fragment
	/// responses); each call is a distinct producer action, so node de-dup
	/// does not apply.
	pub async fn ingest_payload(&self, payload: &str) -> Result<(), IngestError> {
		let envelope = Envelope::parse(payload)?.decode()?;
		self.process_envelope(envelope).await
	}

	/// Processes one envelope element exactly once per node id.
	async fn ingest_envelope(&self, node: &EnvelopeNode) -> Result<(), IngestError> {
		if !self.inner().state.lock().seen_envelopes.insert(node.node_id) {
			return Ok(());
		}
		let envelope = Envelope::parse(&node.payload)?.decode()?;
		self.process_envelope(envelope).await
	}

	async fn process_envelope(&self, envelope: DecodedEnvelope) -> Result<(), IngestError> {
		let DecodedEnvelope {
			css_urls_mark_as_loaded,
			js_urls_mark_as_loaded,
			css_tags_to_fetch,
			js_tags_to_fetch,
			component_js_vars,
			component_js_calls,
		} = envelope;

		// Data bindings first, so this envelope's own activations can
		// become ready.
		for vars in component_js_vars {
			let json_text = vars.json_text;
			self.register_data_factory(&vars.class_id, &vars.data_hash, move || {
				serde_json::from_str(&json_text).map_err(|err| Box::new(err) as BoxError)
			});
		}

		for url in &css_urls_mark_as_loaded {
			self.mark_loaded(AssetKind::Stylesheet, url);
		}
		for url in &js_urls_mark_as_loaded {
			self.mark_loaded(AssetKind::Script, url);
		}

		for tag in &css_tags_to_fetch {
			if let Err(err) = self.load_stylesheet(tag) {
				tracing::error!(error = %err, "failed to load stylesheet tag");
			}
		}

		let mut script_loads = Vec::with_capacity(js_tags_to_fetch.len());
		for tag in &js_tags_to_fetch {
			let load = self.load_script(tag)?;
			script_loads.push(load.loaded);
		}

		// The combined gate: every script this envelope inserts, plus the
		// already-embedded URLs, which another not-yet-processed envelope
		// may still be about to insert.
		let marked = self.wait_for(AssetKind::Script, &js_urls_mark_as_loaded);
		let wait = async move {
			for result in join_all(script_loads).await {
				result.map_err(WaitError::from)?;
			}
			marked.await;
			Ok(())
		}
		.boxed()
		.shared();

		for call in &component_js_calls {
			// Observing handles are producer-side fire-and-forget here;
			// failures surface through the drain and the logs.
			let _ = self.call_component(
				&call.class_id,
				&call.instance_id,
				call.data_hash.as_deref(),
				Some(wait.clone().boxed()),
			);
		}

		self.drain().await?;
		Ok(())
	}
}
