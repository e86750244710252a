//! Tag descriptors: JSON descriptions of the `<script>`/`<link>` elements
//! the manager builds client-side.
//!
//! The producer ships whole tags rather than bare URLs because users can
//! customize how their media tags render; the manager only interprets the
//! URL attribute and hands the rest through to the host verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Element kind a descriptor renders to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagName {
	Script,
	Link,
}

impl TagName {
	/// Attribute carrying the asset URL for this tag kind.
	pub fn url_attr(self) -> &'static str {
		match self {
			TagName::Script => "src",
			TagName::Link => "href",
		}
	}
}

/// An attribute value: a string, or a boolean flag.
///
/// `Flag(true)` renders as a valueless attribute; `Flag(false)` renders
/// nothing at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
	Text(String),
	Flag(bool),
}

/// JSON description of one element to build client-side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDescriptor {
	#[serde(default)]
	pub tag: TagName,
	#[serde(default)]
	pub attrs: BTreeMap<String, AttrValue>,
	#[serde(default)]
	pub content: String,
}

impl Default for TagName {
	fn default() -> Self {
		TagName::Script
	}
}

impl TagDescriptor {
	/// Descriptor for a plain external script.
	pub fn script(src: &str) -> Self {
		Self {
			tag: TagName::Script,
			attrs: BTreeMap::from([(String::from("src"), AttrValue::Text(src.to_owned()))]),
			content: String::new(),
		}
	}

	/// Descriptor for a plain external stylesheet link.
	pub fn stylesheet(href: &str) -> Self {
		Self {
			tag: TagName::Link,
			attrs: BTreeMap::from([
				(String::from("href"), AttrValue::Text(href.to_owned())),
				(String::from("rel"), AttrValue::Text(String::from("stylesheet"))),
			]),
			content: String::new(),
		}
	}

	/// The asset URL this descriptor points at, if any.
	///
	/// Descriptors without one are inline-only: they are inserted but never
	/// tracked by the asset registry.
	pub fn url(&self) -> Option<&str> {
		match self.attrs.get(self.tag.url_attr()) {
			Some(AttrValue::Text(url)) => Some(url.as_str()),
			_ => None,
		}
	}

	/// Attributes as they render onto an element.
	///
	/// A `None` value renders as a valueless attribute; `Flag(false)`
	/// entries do not appear.
	pub fn rendered_attrs(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
		self.attrs.iter().filter_map(|(name, value)| match value {
			AttrValue::Text(text) => Some((name.as_str(), Some(text.as_str()))),
			AttrValue::Flag(true) => Some((name.as_str(), None)),
			AttrValue::Flag(false) => None,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_string_and_flag_attrs() {
		let tag: TagDescriptor = serde_json::from_str(
			r#"{"tag":"script","attrs":{"src":"/a.js","defer":true,"async":false},"content":""}"#,
		)
		.unwrap();
		assert_eq!(tag.tag, TagName::Script);
		assert_eq!(tag.url(), Some("/a.js"));

		let rendered: Vec<_> = tag.rendered_attrs().collect();
		assert_eq!(rendered, vec![("defer", None), ("src", Some("/a.js"))]);
	}

	#[test]
	fn link_url_is_href() {
		let tag = TagDescriptor::stylesheet("/style.css");
		assert_eq!(tag.url(), Some("/style.css"));
	}

	#[test]
	fn script_without_src_is_inline_only() {
		let tag: TagDescriptor =
			serde_json::from_str(r#"{"tag":"script","attrs":{},"content":"doWork();"}"#).unwrap();
		assert_eq!(tag.url(), None);
		assert_eq!(tag.content, "doWork();");
	}

	#[test]
	fn descriptor_roundtrips_through_json() {
		let tag = TagDescriptor::script("/vendor/lib.js");
		let json = serde_json::to_string(&tag).unwrap();
		let back: TagDescriptor = serde_json::from_str(&json).unwrap();
		assert_eq!(back, tag);
	}
}
