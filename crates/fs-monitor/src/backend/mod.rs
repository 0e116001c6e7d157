//! Native watch facilities the monitor can run on top of.
//!
//! A [`Backend`] creates one resource per stream, starts delivering batches to the callback it
//! was given, and must stop doing so once the resource is invalidated. [`NativeStream`] is the
//! owned handle the registry keeps for each of those resources.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use tracing::{error, trace};

use super::{error::NativeError, event::EventBatch, flags::StreamOptions, stream::StreamState};

pub mod fake;
mod notify;

pub use self::notify::NotifyBackend;
pub use fake::FakeBackend;

/// Identity of a native resource, handed back to the callback along with every batch.
pub type ResourceId = u64;

/// Callback given to the backend at creation time, invoked from whatever thread the backend uses.
pub type EventCallback = Arc<dyn Fn(ResourceId, EventBatch) + Send + Sync>;

pub trait Backend: Send + Sync + 'static {
	type Resource: Send + 'static;

	/// Allocates a resource watching `paths`, nothing is delivered until it's started.
	fn create(
		&self,
		id: ResourceId,
		paths: &[PathBuf],
		latency: Duration,
		options: StreamOptions,
		callback: EventCallback,
	) -> Result<Self::Resource, NativeError>;

	fn start(&self, resource: &mut Self::Resource) -> Result<(), NativeError>;

	fn stop(&self, resource: &mut Self::Resource);

	/// After this returns the callback must not be invoked for this resource anymore.
	fn invalidate(&self, resource: &mut Self::Resource);

	fn release(&self, resource: Self::Resource);
}

impl<B: Backend> Backend for Arc<B> {
	type Resource = B::Resource;

	fn create(
		&self,
		id: ResourceId,
		paths: &[PathBuf],
		latency: Duration,
		options: StreamOptions,
		callback: EventCallback,
	) -> Result<Self::Resource, NativeError> {
		(**self).create(id, paths, latency, options, callback)
	}

	fn start(&self, resource: &mut Self::Resource) -> Result<(), NativeError> {
		(**self).start(resource)
	}

	fn stop(&self, resource: &mut Self::Resource) {
		(**self).stop(resource);
	}

	fn invalidate(&self, resource: &mut Self::Resource) {
		(**self).invalidate(resource);
	}

	fn release(&self, resource: Self::Resource) {
		(**self).release(resource);
	}
}

/// Owned handle to a native resource.
///
/// Ownership comes in once from [`Backend::create`] and goes out once through
/// [`NativeStream::shutdown`]; dropping a handle that still holds its resource tears it down too.
pub(crate) struct NativeStream<B: Backend> {
	id: ResourceId,
	backend: Arc<B>,
	resource: Option<B::Resource>,
	state: StreamState,
}

impl<B: Backend> NativeStream<B> {
	pub(crate) fn create(
		backend: Arc<B>,
		id: ResourceId,
		paths: &[PathBuf],
		latency: Duration,
		options: StreamOptions,
		callback: EventCallback,
	) -> Result<Self, NativeError> {
		let resource = backend.create(id, paths, latency, options, callback)?;

		trace!(resource_id = id, "Created native resource");

		Ok(Self {
			id,
			backend,
			resource: Some(resource),
			state: StreamState::Created,
		})
	}

	pub(crate) const fn id(&self) -> ResourceId {
		self.id
	}

	pub(crate) const fn state(&self) -> StreamState {
		self.state
	}

	/// Marks the resource as attached to a loop, delivery is still off.
	pub(crate) fn attach(&mut self) {
		self.transition(StreamState::Scheduled);
	}

	pub(crate) fn start(&mut self) -> Result<(), NativeError> {
		let Some(resource) = self.resource.as_mut() else {
			return Err(NativeError::unknown("native resource already released"));
		};

		self.backend.start(resource)?;
		self.transition(StreamState::Running);

		Ok(())
	}

	/// Stops, invalidates and releases the resource, invalidation always before release.
	pub(crate) fn shutdown(mut self) {
		self.teardown();
	}

	fn teardown(&mut self) {
		if let Some(mut resource) = self.resource.take() {
			if self.state == StreamState::Running {
				self.backend.stop(&mut resource);
			}
			self.transition(StreamState::Stopped);

			self.backend.invalidate(&mut resource);
			self.backend.release(resource);
			self.transition(StreamState::Released);
		}
	}

	fn transition(&mut self, next: StreamState) {
		trace!(resource_id = self.id, from = ?self.state, to = ?next, "Stream state transition;");
		self.state = next;
	}
}

impl<B: Backend> Drop for NativeStream<B> {
	fn drop(&mut self) {
		if self.resource.is_some() {
			error!(
				resource_id = self.id,
				"Native resource dropped without being released, tearing it down now;"
			);
			self.teardown();
		}
	}
}

impl<B: Backend> fmt::Debug for NativeStream<B> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("NativeStream")
			.field("id", &self.id)
			.field("state", &self.state)
			.field("holds_resource", &self.resource.is_some())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
	use std::path::PathBuf;

	use super::*;

	fn noop_callback() -> EventCallback {
		Arc::new(|_: ResourceId, _: EventBatch| {})
	}

	#[test]
	fn shutdown_releases_in_order() {
		let backend = Arc::new(FakeBackend::new());

		let mut stream = NativeStream::create(
			Arc::clone(&backend),
			7,
			&[PathBuf::from("/tmp/watch")],
			Duration::ZERO,
			StreamOptions::empty(),
			noop_callback(),
		)
		.unwrap();

		stream.attach();
		stream.start().unwrap();
		assert_eq!(stream.state(), StreamState::Running);
		assert_eq!(backend.live_resources(), 1);

		stream.shutdown();

		assert_eq!(backend.live_resources(), 0);
		assert_eq!(
			backend.calls(7),
			["create", "start", "stop", "invalidate", "release"]
		);
	}

	#[test]
	fn dropping_an_unreleased_stream_releases_it() {
		let backend = Arc::new(FakeBackend::new());

		let stream = NativeStream::create(
			Arc::clone(&backend),
			1,
			&[PathBuf::from("/tmp/watch")],
			Duration::ZERO,
			StreamOptions::empty(),
			noop_callback(),
		)
		.unwrap();

		drop(stream);

		assert_eq!(backend.live_resources(), 0);
		assert_eq!(backend.calls(1), ["create", "invalidate", "release"]);
	}
}
