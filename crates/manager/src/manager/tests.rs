use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, oneshot};
use tokio::task::yield_now;
use tokio::time::advance;

use djc_wire::TagDescriptor;

use super::*;
use crate::assets::AssetKind;
use crate::error::{ActivationError, BoxError, LoadError, ManagerInitError, WaitError};
use crate::host::memory::{MemoryElement, MemoryHost};
use crate::registry::{CallbackFuture, InstanceContext};

type Log = Arc<Mutex<Vec<String>>>;

fn manager_with_host() -> (Manager<MemoryHost>, Arc<MemoryHost>) {
	let host = Arc::new(MemoryHost::gated());
	let manager = Manager::new(Arc::clone(&host)).expect("inside runtime");
	(manager, host)
}

/// Callback that appends `label:instance` to the log.
fn recording(
	log: &Log,
	label: &str,
) -> impl Fn(Option<Value>, InstanceContext<MemoryElement>) -> CallbackFuture + Send + Sync + 'static
{
	let log = Arc::clone(log);
	let label = label.to_owned();
	move |_, ctx| {
		let log = Arc::clone(&log);
		let label = label.clone();
		async move {
			log.lock().push(format!("{label}:{}", ctx.instance_id));
			Ok(Value::Null)
		}
		.boxed()
	}
}

/// Adapts a oneshot into a wait future; a dropped sender counts as success.
fn wait_from(rx: oneshot::Receiver<Result<(), WaitError>>) -> WaitFuture {
	async move {
		match rx.await {
			Ok(result) => result,
			Err(_) => Ok(()),
		}
	}
	.boxed()
}

#[test]
fn new_outside_a_runtime_is_an_error() {
	let host = Arc::new(MemoryHost::new());
	assert!(matches!(
		Manager::new(host),
		Err(ManagerInitError::NoRuntime)
	));
}

#[tokio::test]
async fn activation_resolves_and_chains_grow_in_order() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["i1"]);
	host.insert_instance_element(&["i2"]);
	let log = Log::default();
	manager.register_callback("table", recording(&log, "first"));

	let handle = manager.call_component("table", "i1", None, None);
	handle.wait().await.unwrap();
	assert_eq!(*log.lock(), vec!["first:i1"]);

	manager.register_callback("table", recording(&log, "second"));
	let handle = manager.call_component("table", "i2", None, None);
	handle.wait().await.unwrap();
	assert_eq!(*log.lock(), vec!["first:i1", "first:i2", "second:i2"]);
}

#[tokio::test]
async fn handle_resolves_with_the_final_callback_value() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["i1"]);
	manager.register_callback("table", |_, _| async move { Ok(json!(1)) }.boxed());
	manager.register_callback("table", |_, _| async move { Ok(json!(2)) }.boxed());

	let value = manager
		.call_component("table", "i1", None, None)
		.wait()
		.await
		.unwrap();
	assert_eq!(value, json!(2));
}

/// A waiting head must hold back activations that have no wait of their
/// own, or submission order would be lost.
#[tokio::test]
async fn head_wait_blocks_later_activations() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["1"]);
	host.insert_instance_element(&["2"]);
	let log = Log::default();
	manager.register_callback("x", recording(&log, "cb"));

	let (tx, rx) = oneshot::channel();
	let a = manager.call_component("x", "1", None, Some(wait_from(rx)));
	let b = manager.call_component("x", "2", None, None);

	manager.drain().await.unwrap();
	for _ in 0..20 {
		yield_now().await;
	}
	assert!(log.lock().is_empty());
	assert_eq!(manager.pending_activations(), 2);

	tx.send(Ok(())).unwrap();
	a.wait().await.unwrap();
	b.wait().await.unwrap();
	assert_eq!(*log.lock(), vec!["cb:1", "cb:2"]);
}

#[tokio::test]
async fn execution_is_fifo_even_when_waits_resolve_out_of_order() {
	let (manager, host) = manager_with_host();
	for id in ["1", "2", "3"] {
		host.insert_instance_element(&[id]);
	}
	let log = Log::default();
	manager.register_callback("x", recording(&log, "cb"));

	let (tx1, rx1) = oneshot::channel();
	let (tx2, rx2) = oneshot::channel();
	let a = manager.call_component("x", "1", None, Some(wait_from(rx1)));
	let b = manager.call_component("x", "2", None, Some(wait_from(rx2)));
	let c = manager.call_component("x", "3", None, None);

	// The second activation's wait resolves first; nothing may run while
	// the head is still waiting.
	tx2.send(Ok(())).unwrap();
	for _ in 0..20 {
		yield_now().await;
	}
	assert!(log.lock().is_empty());

	tx1.send(Ok(())).unwrap();
	a.wait().await.unwrap();
	b.wait().await.unwrap();
	c.wait().await.unwrap();
	assert_eq!(*log.lock(), vec!["cb:1", "cb:2", "cb:3"]);
}

#[tokio::test]
async fn late_registrations_unblock_the_head() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["1"]);
	let got: Arc<Mutex<Option<Value>>> = Arc::default();

	let handle = manager.call_component("y", "1", Some("h1"), None);
	manager.drain().await.unwrap();
	assert_eq!(manager.pending_activations(), 1);

	let seen = Arc::clone(&got);
	manager.register_callback("y", move |data, _| {
		let seen = Arc::clone(&seen);
		async move {
			*seen.lock() = data.clone();
			Ok(data.unwrap_or_default())
		}
		.boxed()
	});
	manager.drain().await.unwrap();
	// Still blocked: the data factory is missing.
	assert_eq!(manager.pending_activations(), 1);

	manager.register_data_factory("y", "h1", || Ok(json!({"v": 1})));
	let value = handle.wait().await.unwrap();
	assert_eq!(value, json!({"v": 1}));
	assert_eq!(*got.lock(), Some(json!({"v": 1})));
}

#[tokio::test]
async fn script_load_is_idempotent() {
	let (manager, host) = manager_with_host();
	let tag = TagDescriptor::script("/a.js");

	let first = manager.load_script(&tag).unwrap();
	let second = manager.load_script(&tag).unwrap();

	assert_eq!(host.scripts_with_src("/a.js"), 1);
	assert!(manager.is_loaded(AssetKind::Script, "/a.js"));
	// The duplicate resolves immediately, without touching the document.
	assert_eq!(second.loaded.now_or_never(), Some(Ok(())));

	let mut loaded = first.loaded;
	assert!((&mut loaded).now_or_never().is_none());
	host.finish_script("/a.js", Ok(()));
	assert_eq!(loaded.now_or_never(), Some(Ok(())));
}

/// Insertion, not load completion, resolves waiters; a second envelope
/// referencing the same script must not stay blocked on it.
#[tokio::test]
async fn waiters_resolve_at_insertion_time() {
	let (manager, _host) = manager_with_host();
	let mut wait = manager.wait_for(AssetKind::Script, ["/a.js"]);
	assert!((&mut wait).now_or_never().is_none());

	manager.load_script(&TagDescriptor::script("/a.js")).unwrap();
	assert_eq!(wait.now_or_never(), Some(()));
}

#[tokio::test]
async fn inline_scripts_are_inserted_but_untracked() {
	let (manager, host) = manager_with_host();
	let tag = TagDescriptor {
		content: String::from("init();"),
		..TagDescriptor::default()
	};

	let load = manager.load_script(&tag).unwrap();
	assert_eq!(load.loaded.now_or_never(), Some(Ok(())));

	manager.load_script(&tag).unwrap();
	assert_eq!(host.body_len(), 2);
	assert_eq!(manager.loaded_count(AssetKind::Script), 0);
}

#[tokio::test]
async fn stylesheets_insert_once_and_are_fire_and_forget() {
	let (manager, host) = manager_with_host();
	let tag = TagDescriptor::stylesheet("/style.css");

	assert!(manager.load_stylesheet(&tag).unwrap().is_some());
	assert!(manager.load_stylesheet(&tag).unwrap().is_none());
	assert_eq!(host.stylesheets_with_href("/style.css"), 1);
	assert!(manager.is_loaded(AssetKind::Stylesheet, "/style.css"));
}

#[tokio::test]
async fn loaders_reject_mismatched_tags() {
	let (manager, _host) = manager_with_host();
	assert!(matches!(
		manager.load_script(&TagDescriptor::stylesheet("/style.css")),
		Err(LoadError::TagMismatch { .. })
	));
	assert!(matches!(
		manager.load_stylesheet(&TagDescriptor::script("/a.js")),
		Err(LoadError::TagMismatch { .. })
	));
}

#[tokio::test]
async fn upstream_failure_flushes_the_queue() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["1"]);
	host.insert_instance_element(&["2"]);
	let log = Log::default();
	manager.register_callback("z", recording(&log, "cb"));

	let (tx, rx) = oneshot::channel();
	let a = manager.call_component("z", "1", None, Some(wait_from(rx)));
	let b = manager.call_component("z", "2", None, None);

	tx.send(Err(WaitError::new("script load failed"))).unwrap();
	assert!(matches!(a.wait().await, Err(ActivationError::Flushed)));
	assert!(matches!(b.wait().await, Err(ActivationError::Flushed)));
	assert_eq!(manager.pending_activations(), 0);
	assert!(log.lock().is_empty());
}

/// The fatal error must come out of the drain call that observes the
/// failed head, not be swallowed by the flush.
#[tokio::test]
async fn upstream_failure_surfaces_from_the_draining_call() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["0"]);
	host.insert_instance_element(&["1"]);
	host.insert_instance_element(&["2"]);

	let gate = Arc::new(Notify::new());
	let entered = Arc::new(AtomicUsize::new(0));
	let (gate2, entered2) = (Arc::clone(&gate), Arc::clone(&entered));
	manager.register_callback("z", move |_, _| {
		let gate = Arc::clone(&gate2);
		let entered = Arc::clone(&entered2);
		async move {
			entered.fetch_add(1, Ordering::SeqCst);
			gate.notified().await;
			Ok(Value::Null)
		}
		.boxed()
	});

	// Enqueue everything first; the spawned background drains only get to
	// run once this task yields, so the join below still polls our drain
	// first and it is our call that takes the drain lock.
	let _head = manager.call_component("z", "0", None, None);
	let (tx, rx) = oneshot::channel();
	let _a = manager.call_component("z", "1", None, Some(wait_from(rx)));
	let _b = manager.call_component("z", "2", None, None);

	let control = async {
		while entered.load(Ordering::SeqCst) == 0 {
			yield_now().await;
		}
		tx.send(Err(WaitError::new("script load failed"))).unwrap();
		// Let the settlement land while our drain still holds the lock,
		// so it is the call that trips over the failed head.
		for _ in 0..20 {
			yield_now().await;
		}
		gate.notify_one();
	};
	let (drained, ()) = tokio::join!(manager.drain(), control);
	let err = drained.unwrap_err();
	assert_eq!(err.class_id, "z");
	assert_eq!(err.instance_id, "1");
	assert_eq!(err.source, WaitError::new("script load failed"));
	assert_eq!(manager.pending_activations(), 0);
}

#[tokio::test]
async fn callback_failure_settles_only_its_activation() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["1"]);
	host.insert_instance_element(&["2"]);
	manager.register_callback("x", |_, ctx| {
		async move {
			if ctx.instance_id == "1" {
				Err(BoxError::from("nope"))
			} else {
				Ok(json!("ok"))
			}
		}
		.boxed()
	});

	let a = manager.call_component("x", "1", None, None);
	let b = manager.call_component("x", "2", None, None);
	assert!(matches!(a.wait().await, Err(ActivationError::Callback { .. })));
	assert_eq!(b.wait().await.unwrap(), json!("ok"));
}

#[tokio::test]
async fn callback_panic_is_captured() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["1"]);
	host.insert_instance_element(&["2"]);
	manager.register_callback("x", |_, ctx| {
		async move {
			assert_ne!(ctx.instance_id, "1", "boom");
			Ok(Value::Null)
		}
		.boxed()
	});

	let a = manager.call_component("x", "1", None, None);
	let b = manager.call_component("x", "2", None, None);
	assert!(matches!(
		a.wait().await,
		Err(ActivationError::CallbackPanic { .. })
	));
	b.wait().await.unwrap();
}

#[tokio::test]
async fn missing_elements_reject_the_activation() {
	let (manager, _host) = manager_with_host();
	manager.register_callback("x", |_, _| async move { Ok(Value::Null) }.boxed());

	let handle = manager.call_component("x", "ghost", None, None);
	assert!(matches!(
		handle.wait().await,
		Err(ActivationError::NoElements { .. })
	));
}

/// Factories run once per activation, at execution time, so every
/// instance gets an independent data object.
#[tokio::test]
async fn data_factories_run_once_per_activation() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["1"]);
	host.insert_instance_element(&["2"]);
	manager.register_callback("x", |data, _| async move { Ok(data.unwrap()) }.boxed());

	let calls = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&calls);
	manager.register_data_factory("x", "h1", move || {
		let n = counter.fetch_add(1, Ordering::SeqCst);
		Ok(json!({ "n": n }))
	});

	let a = manager
		.call_component("x", "1", Some("h1"), None)
		.wait()
		.await
		.unwrap();
	let b = manager
		.call_component("x", "2", Some("h1"), None)
		.wait()
		.await
		.unwrap();
	assert_ne!(a, b);
	assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn factory_errors_fail_the_activation() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["1"]);
	manager.register_callback("x", |_, _| async move { Ok(Value::Null) }.boxed());
	manager.register_data_factory("x", "h1", || Err(BoxError::from("bad json")));

	let handle = manager.call_component("x", "1", Some("h1"), None);
	assert!(matches!(
		handle.wait().await,
		Err(ActivationError::DataFactory { .. })
	));
}

/// Synchronous re-entry from inside a callback must not start a second
/// drain; the outer drain picks the new activation up at the next head.
#[tokio::test]
async fn reentrant_calls_from_callbacks_are_safe() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["o"]);
	host.insert_instance_element(&["i"]);
	let log = Log::default();

	let (inner_mgr, inner_log) = (manager.clone(), log.clone());
	manager.register_callback("outer", move |_, _| {
		let manager = inner_mgr.clone();
		let log = inner_log.clone();
		async move {
			manager.register_callback("inner", recording(&log, "inner"));
			let _ = manager.call_component("inner", "i", None, None);
			log.lock().push(String::from("outer:o"));
			Ok(Value::Null)
		}
		.boxed()
	});

	manager
		.call_component("outer", "o", None, None)
		.wait()
		.await
		.unwrap();
	for _ in 0..100 {
		if log.lock().len() == 2 {
			break;
		}
		yield_now().await;
	}
	assert_eq!(*log.lock(), vec!["outer:o", "inner:i"]);
}

#[tokio::test(start_paused = true)]
async fn stall_reporter_flags_blocked_activations() {
	let (manager, host) = manager_with_host();
	host.insert_instance_element(&["1"]);

	let handle = manager.call_component("missing", "1", None, None);
	assert_eq!(manager.stall_report_count(), 0);

	// Let the reporter task start and create its interval before the
	// clock moves.
	for _ in 0..20 {
		yield_now().await;
	}
	advance(Duration::from_secs(6)).await;
	for _ in 0..20 {
		yield_now().await;
	}
	assert!(manager.stall_report_count() >= 1);

	// Unblocking drains the queue, which disarms the reporter.
	let log = Log::default();
	manager.register_callback("missing", recording(&log, "cb"));
	handle.wait().await.unwrap();
	for _ in 0..20 {
		yield_now().await;
	}
	assert_eq!(manager.pending_activations(), 0);

	let reports = manager.stall_report_count();
	advance(Duration::from_secs(30)).await;
	for _ in 0..20 {
		yield_now().await;
	}
	assert_eq!(manager.stall_report_count(), reports);
}
