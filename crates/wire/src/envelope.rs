//! The activation envelope: the JSON payload carried by marked script
//! elements (and by the producer's direct-ingest path).
//!
//! Field names are part of the producer contract and must not change.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TagDescriptor;

/// Errors decoding an envelope payload or one of its fields.
#[derive(Debug, Error)]
pub enum EnvelopeDecodeError {
	/// The payload, or an embedded tag descriptor, is not valid JSON.
	#[error("envelope payload is not valid JSON: {0}")]
	Json(#[from] serde_json::Error),

	/// A wire field is not valid base64.
	#[error("envelope field is not valid base64: {0}")]
	Base64(#[from] base64::DecodeError),

	/// A decoded wire field is not valid UTF-8.
	#[error("envelope field is not valid UTF-8: {0}")]
	Utf8(#[from] std::string::FromUtf8Error),
}

/// An envelope as it appears on the wire: every string base64-encoded.
///
/// URLs that the producer already embedded into the page are shipped as
/// bare URLs (`*__markAsLoaded`); assets the manager must fetch itself are
/// shipped as whole tag descriptors (`*__toFetch`), serialized to JSON
/// before encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
	#[serde(rename = "cssUrls__markAsLoaded", default)]
	pub css_urls_mark_as_loaded: Vec<String>,
	#[serde(rename = "jsUrls__markAsLoaded", default)]
	pub js_urls_mark_as_loaded: Vec<String>,
	#[serde(rename = "cssTags__toFetch", default)]
	pub css_tags_to_fetch: Vec<String>,
	#[serde(rename = "jsTags__toFetch", default)]
	pub js_tags_to_fetch: Vec<String>,
	#[serde(rename = "componentJsVars", default)]
	pub component_js_vars: Vec<(String, String, String)>,
	#[serde(rename = "componentJsCalls", default)]
	pub component_js_calls: Vec<(String, String, Option<String>)>,
}

/// A data binding: the JSON text producing fresh vars for
/// `(class_id, data_hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentVars {
	pub class_id: String,
	pub data_hash: String,
	pub json_text: String,
}

/// An activation request for one component instance.
///
/// A missing data hash means the instance has no associated data factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentCall {
	pub class_id: String,
	pub instance_id: String,
	pub data_hash: Option<String>,
}

/// An envelope with every field decoded from its wire encoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedEnvelope {
	pub css_urls_mark_as_loaded: Vec<String>,
	pub js_urls_mark_as_loaded: Vec<String>,
	pub css_tags_to_fetch: Vec<TagDescriptor>,
	pub js_tags_to_fetch: Vec<TagDescriptor>,
	pub component_js_vars: Vec<ComponentVars>,
	pub component_js_calls: Vec<ComponentCall>,
}

impl Envelope {
	/// Parses one wire payload.
	pub fn parse(payload: &str) -> Result<Self, EnvelopeDecodeError> {
		Ok(serde_json::from_str(payload)?)
	}

	/// Decodes every wire field.
	pub fn decode(&self) -> Result<DecodedEnvelope, EnvelopeDecodeError> {
		Ok(DecodedEnvelope {
			css_urls_mark_as_loaded: decode_all(&self.css_urls_mark_as_loaded)?,
			js_urls_mark_as_loaded: decode_all(&self.js_urls_mark_as_loaded)?,
			css_tags_to_fetch: decode_tags(&self.css_tags_to_fetch)?,
			js_tags_to_fetch: decode_tags(&self.js_tags_to_fetch)?,
			component_js_vars: self
				.component_js_vars
				.iter()
				.map(|(class_id, data_hash, json_text)| {
					Ok(ComponentVars {
						class_id: decode_field(class_id)?,
						data_hash: decode_field(data_hash)?,
						json_text: decode_field(json_text)?,
					})
				})
				.collect::<Result<_, EnvelopeDecodeError>>()?,
			component_js_calls: self
				.component_js_calls
				.iter()
				.map(|(class_id, instance_id, data_hash)| {
					Ok(ComponentCall {
						class_id: decode_field(class_id)?,
						instance_id: decode_field(instance_id)?,
						data_hash: data_hash.as_deref().map(decode_field).transpose()?,
					})
				})
				.collect::<Result<_, EnvelopeDecodeError>>()?,
		})
	}
}

impl DecodedEnvelope {
	/// Re-encodes into the wire form.
	///
	/// Producer-side counterpart of [`Envelope::decode`]; the two
	/// round-trip exactly.
	pub fn to_wire(&self) -> Result<Envelope, serde_json::Error> {
		Ok(Envelope {
			css_urls_mark_as_loaded: encode_all(&self.css_urls_mark_as_loaded),
			js_urls_mark_as_loaded: encode_all(&self.js_urls_mark_as_loaded),
			css_tags_to_fetch: encode_tags(&self.css_tags_to_fetch)?,
			js_tags_to_fetch: encode_tags(&self.js_tags_to_fetch)?,
			component_js_vars: self
				.component_js_vars
				.iter()
				.map(|vars| {
					(
						encode_field(&vars.class_id),
						encode_field(&vars.data_hash),
						encode_field(&vars.json_text),
					)
				})
				.collect(),
			component_js_calls: self
				.component_js_calls
				.iter()
				.map(|call| {
					(
						encode_field(&call.class_id),
						encode_field(&call.instance_id),
						call.data_hash.as_deref().map(encode_field),
					)
				})
				.collect(),
		})
	}
}

fn decode_field(field: &str) -> Result<String, EnvelopeDecodeError> {
	Ok(String::from_utf8(BASE64.decode(field)?)?)
}

fn decode_all(fields: &[String]) -> Result<Vec<String>, EnvelopeDecodeError> {
	fields.iter().map(|field| decode_field(field)).collect()
}

fn decode_tags(fields: &[String]) -> Result<Vec<TagDescriptor>, EnvelopeDecodeError> {
	fields
		.iter()
		.map(|field| Ok(serde_json::from_str(&decode_field(field)?)?))
		.collect()
}

fn encode_field(field: &str) -> String {
	BASE64.encode(field.as_bytes())
}

fn encode_all(fields: &[String]) -> Vec<String> {
	fields.iter().map(|field| encode_field(field)).collect()
}

fn encode_tags(tags: &[TagDescriptor]) -> Result<Vec<String>, serde_json::Error> {
	tags.iter()
		.map(|tag| Ok(encode_field(&serde_json::to_string(tag)?)))
		.collect()
}
