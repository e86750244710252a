//! Wire format shared between a server-side producer and the client-side
//! component dependency manager.
//!
//! A producer renders HTML that embeds activation envelopes: `<script>`
//! elements marked with [`ENVELOPE_ATTR`] whose text content is a JSON
//! payload of asset declarations, data bindings, and activation requests.
//! Every string inside the payload is base64-encoded on the wire. The
//! encoding exists for producer compatibility (it keeps `</script>` and
//! attacker-controlled ids inert inside HTML); the manager does not rely on
//! it for correctness.

mod envelope;
mod tag;

pub use envelope::{ComponentCall, ComponentVars, DecodedEnvelope, Envelope, EnvelopeDecodeError};
pub use tag::{AttrValue, TagDescriptor, TagName};

/// Marker attribute identifying activation envelope elements.
pub const ENVELOPE_ATTR: &str = "data-djc";

/// Prefix of the per-instance marker attribute.
pub const INSTANCE_ATTR_PREFIX: &str = "data-djc-id-";

/// The attribute that associates a document element with a component
/// instance.
///
/// The id is baked into the attribute name rather than its value so that
/// one element can belong to several instances at once (a component
/// rendering another lands both markers on the same root).
pub fn instance_attr(instance_id: &str) -> String {
	format!("{INSTANCE_ATTR_PREFIX}{instance_id}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn instance_attr_bakes_id_into_name() {
		assert_eq!(instance_attr("ca1b2c3"), "data-djc-id-ca1b2c3");
	}
}
