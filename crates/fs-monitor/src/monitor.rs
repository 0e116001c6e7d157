use std::{
	fmt,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use tracing::debug;

use super::{
	backend::{Backend, ResourceId},
	config::Config,
	registry::Registry,
	token::{StreamToken, ThreadToken},
};

/// Process-wide entry point, cheap to clone and share between threads.
///
/// Every clone sees the same streams and loops; they all go away, native resources included,
/// once the last clone is dropped.
pub struct Monitor<B: Backend> {
	pub(crate) inner: Arc<Inner<B>>,
}

pub(crate) struct Inner<B: Backend> {
	pub(crate) backend: Arc<B>,
	pub(crate) registry: Registry<B>,
	pub(crate) config: Config,
	resource_ids: AtomicU64,
}

impl<B: Backend> Inner<B> {
	pub(crate) fn next_resource_id(&self) -> ResourceId {
		self.resource_ids.fetch_add(1, Ordering::Relaxed)
	}
}

impl<B: Backend> Drop for Inner<B> {
	fn drop(&mut self) {
		let streams = self.registry.drain();
		if !streams.is_empty() {
			debug!(
				streams_count = streams.len(),
				"Monitor dropped with streams still scheduled, releasing them;"
			);
		}

		for stream in streams {
			stream.native.shutdown();
		}
	}
}

impl<B: Backend> Monitor<B> {
	pub fn new(backend: B) -> Self {
		Self::with_config(backend, Config::default())
	}

	pub fn with_config(backend: B, config: Config) -> Self {
		Self {
			inner: Arc::new(Inner {
				backend: Arc::new(backend),
				registry: Registry::new(),
				config,
				resource_ids: AtomicU64::new(1),
			}),
		}
	}

	#[must_use]
	pub fn backend(&self) -> &B {
		&self.inner.backend
	}

	#[must_use]
	pub fn config(&self) -> &Config {
		&self.inner.config
	}

	/// Whether some OS thread is currently running `thread`'s loop.
	#[must_use]
	pub fn is_looping(&self, thread: ThreadToken) -> bool {
		self.inner
			.registry
			.lookup_loop(thread)
			.is_some_and(|run_loop| run_loop.is_claimed())
	}

	#[must_use]
	pub fn is_scheduled(&self, stream: StreamToken) -> bool {
		self.inner.registry.contains_stream(stream)
	}

	/// Thread whose loop handles `stream`'s batches.
	#[must_use]
	pub fn stream_thread(&self, stream: StreamToken) -> Option<ThreadToken> {
		self.inner
			.registry
			.lookup_stream(stream)
			.map(|info| info.thread)
	}

	/// Native resource backing `stream`, as known to the backend.
	#[must_use]
	pub fn resource_id(&self, stream: StreamToken) -> Option<ResourceId> {
		self.inner
			.registry
			.lookup_stream(stream)
			.map(|info| info.resource_id)
	}

	/// Either a running loop or a placeholder holding parked streams.
	pub(crate) fn has_loop_entry(&self, thread: ThreadToken) -> bool {
		self.inner.registry.lookup_loop(thread).is_some()
	}
}

impl<B: Backend> Clone for Monitor<B> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<B: Backend> fmt::Debug for Monitor<B> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Monitor")
			.field("config", &self.inner.config)
			.finish_non_exhaustive()
	}
}
