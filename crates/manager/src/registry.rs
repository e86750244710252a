//! Component callback and data-factory registries.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::BoxError;

/// Completion of one component callback.
pub type CallbackFuture = BoxFuture<'static, Result<Value, BoxError>>;

/// One registered component callback.
///
/// Invoked with the activation's data object (when it has one) and the
/// instance context; the last callback's value becomes the activation's
/// value.
pub type Callback<E> = Arc<dyn Fn(Option<Value>, InstanceContext<E>) -> CallbackFuture + Send + Sync>;

/// A registered per-instance data factory.
///
/// Invoked at execution time, once per activation, so every instance gets
/// an independent data object.
pub type DataFactory = Arc<dyn Fn() -> Result<Value, BoxError> + Send + Sync>;

/// Context handed to every callback of an activation.
#[derive(Debug, Clone)]
pub struct InstanceContext<E> {
	/// Component class the activation belongs to.
	pub class_id: String,
	/// The activated instance.
	pub instance_id: String,
	/// Elements carrying the instance marker, in document order.
	pub elements: Vec<E>,
}

/// Callback lists per class-id and data factories per `(class-id, hash)`.
///
/// Callback lists are append-only and order-preserving; factory bindings
/// are last-writer-wins.
pub(crate) struct ComponentRegistry<E> {
	callbacks: HashMap<String, Vec<Callback<E>>>,
	factories: HashMap<String, HashMap<String, DataFactory>>,
}

impl<E> Default for ComponentRegistry<E> {
	fn default() -> Self {
		Self {
			callbacks: HashMap::new(),
			factories: HashMap::new(),
		}
	}
}

impl<E> ComponentRegistry<E> {
	/// Appends `callback` to the class's chain, creating it if absent.
	pub fn register_callback(&mut self, class_id: &str, callback: Callback<E>) {
		self.callbacks
			.entry(class_id.to_owned())
			.or_default()
			.push(callback);
	}

	/// Binds a factory under `(class_id, data_hash)`, replacing any
	/// previous binding.
	pub fn register_data_factory(&mut self, class_id: &str, data_hash: &str, factory: DataFactory) {
		self.factories
			.entry(class_id.to_owned())
			.or_default()
			.insert(data_hash.to_owned(), factory);
	}

	pub fn has_callbacks(&self, class_id: &str) -> bool {
		self.callbacks
			.get(class_id)
			.is_some_and(|chain| !chain.is_empty())
	}

	pub fn callbacks(&self, class_id: &str) -> Vec<Callback<E>> {
		self.callbacks.get(class_id).cloned().unwrap_or_default()
	}

	pub fn has_factory(&self, class_id: &str, data_hash: &str) -> bool {
		self.factory(class_id, data_hash).is_some()
	}

	pub fn factory(&self, class_id: &str, data_hash: &str) -> Option<DataFactory> {
		self.factories.get(class_id)?.get(data_hash).cloned()
	}
}

#[cfg(test)]
mod tests {
	use futures::FutureExt;
	use serde_json::json;

	use super::*;

	fn noop() -> Callback<()> {
		Arc::new(|_, _| futures::future::ready(Ok(Value::Null)).boxed())
	}

	#[test]
	fn callback_chains_preserve_registration_order() {
		let mut registry = ComponentRegistry::<()>::default();
		assert!(!registry.has_callbacks("table"));

		registry.register_callback("table", noop());
		registry.register_callback("table", noop());
		assert!(registry.has_callbacks("table"));
		assert_eq!(registry.callbacks("table").len(), 2);
	}

	#[test]
	fn factories_are_last_writer_wins() {
		let mut registry = ComponentRegistry::<()>::default();
		registry.register_data_factory("table", "h1", Arc::new(|| Ok(json!({"v": 1}))));
		registry.register_data_factory("table", "h1", Arc::new(|| Ok(json!({"v": 2}))));

		let factory = registry.factory("table", "h1").unwrap();
		assert_eq!(factory().unwrap(), json!({"v": 2}));
		assert!(!registry.has_factory("table", "h2"));
		assert!(!registry.has_factory("button", "h1"));
	}
}
