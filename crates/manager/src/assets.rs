//! Asset registry: loaded-URL sets and waiter latches.

use std::collections::{HashMap, HashSet};

use tokio::sync::watch;

/// The two asset kinds the manager tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
	Script,
	Stylesheet,
}

/// Loaded-URL sets per kind, plus waiter latches keyed by `(kind, url)`.
///
/// Loadedness is monotonic: URLs are only ever added. A waiter is created
/// on the first wait for a URL that is not yet loaded, resolved at most
/// once by [`mark_loaded`](Self::mark_loaded), and retained afterwards so
/// later waits observe the settled latch.
#[derive(Debug, Default)]
pub(crate) struct AssetRegistry {
	scripts: HashSet<String>,
	stylesheets: HashSet<String>,
	waiters: HashMap<(AssetKind, String), watch::Sender<bool>>,
}

impl AssetRegistry {
	fn loaded(&self, kind: AssetKind) -> &HashSet<String> {
		match kind {
			AssetKind::Script => &self.scripts,
			AssetKind::Stylesheet => &self.stylesheets,
		}
	}

	fn loaded_mut(&mut self, kind: AssetKind) -> &mut HashSet<String> {
		match kind {
			AssetKind::Script => &mut self.scripts,
			AssetKind::Stylesheet => &mut self.stylesheets,
		}
	}

	pub fn is_loaded(&self, kind: AssetKind, url: &str) -> bool {
		self.loaded(kind).contains(url)
	}

	pub fn loaded_count(&self, kind: AssetKind) -> usize {
		self.loaded(kind).len()
	}

	/// Marks `url` loaded and resolves any waiter for `(kind, url)`.
	pub fn mark_loaded(&mut self, kind: AssetKind, url: &str) {
		if !self.loaded_mut(kind).insert(url.to_owned()) {
			return;
		}
		if let Some(latch) = self.waiters.get(&(kind, url.to_owned())) {
			latch.send_replace(true);
		}
	}

	/// A receiver whose latch is (or becomes) `true` once `(kind, url)` is
	/// loaded.
	pub fn waiter(&mut self, kind: AssetKind, url: &str) -> watch::Receiver<bool> {
		if self.is_loaded(kind, url) {
			let (_, rx) = watch::channel(true);
			return rx;
		}
		self.waiters
			.entry((kind, url.to_owned()))
			.or_insert_with(|| watch::channel(false).0)
			.subscribe()
	}
}

/// Resolves once every receiver's latch is set.
pub(crate) async fn await_all(receivers: Vec<watch::Receiver<bool>>) {
	for mut rx in receivers {
		// A closed latch means the registry is gone; nothing left to wait
		// for on that URL.
		let _ = rx.wait_for(|loaded| *loaded).await;
	}
}
