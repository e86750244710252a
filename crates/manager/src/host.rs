//! Host capabilities: everything the manager needs from the document.
//!
//! The core never touches a real DOM. A browser host implements [`Host`]
//! over actual elements and a mutation observer;
//! [`memory::MemoryHost`] implements it over an in-memory document so the
//! core runs headless. The manager only appends nodes and queries by
//! attribute; it never removes or mutates host-authored nodes.

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use djc_wire::TagDescriptor;

use crate::error::ScriptLoadError;

pub mod memory;

/// Load future of an inserted script element.
pub type ScriptLoadFuture = BoxFuture<'static, Result<(), ScriptLoadError>>;

/// One marked envelope element as seen in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeNode {
	/// Host-unique identity of the element; the ingestor's de-dup key.
	pub node_id: u64,
	/// The element's text content (the JSON payload).
	pub payload: String,
}

/// Document capabilities the manager runs against.
pub trait Host: Send + Sync + 'static {
	/// Handle to a document element.
	type Element: Clone + Send + Sync + 'static;

	/// Elements currently carrying the instance marker attribute for
	/// `instance_id`, in document order.
	fn elements_for_instance(&self, instance_id: &str) -> Vec<Self::Element>;

	/// Builds a script element from a descriptor without inserting it.
	///
	/// The returned future resolves once the element has been appended and
	/// its load event fired; for descriptors without a source URL it is
	/// already resolved. Dropping the future is allowed at any point.
	fn create_script(&self, tag: &TagDescriptor) -> (Self::Element, ScriptLoadFuture);

	/// Appends a script element to the document body.
	///
	/// Scripts appended this way execute in insertion order.
	fn append_script(&self, element: &Self::Element);

	/// Builds a stylesheet element from a descriptor without inserting it.
	fn create_stylesheet(&self, tag: &TagDescriptor) -> Self::Element;

	/// Appends a stylesheet element to the document head.
	fn append_stylesheet(&self, element: &Self::Element);

	/// Envelope elements present in the document, in document order.
	fn existing_envelopes(&self) -> Vec<EnvelopeNode>;

	/// Stream of envelope elements added to the document, in observation
	/// order.
	///
	/// The stream may replay elements that [`existing_envelopes`] already
	/// returned; the ingestor de-duplicates by node id.
	///
	/// [`existing_envelopes`]: Host::existing_envelopes
	fn envelope_stream(&self) -> BoxStream<'static, EnvelopeNode>;
}
