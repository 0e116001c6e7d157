//! In-memory backend for tests, batches are only delivered when a test asks for it.

use std::{
	collections::HashMap,
	path::PathBuf,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex, MutexGuard, PoisonError,
	},
	time::Duration,
};

use tracing::trace;

use super::{Backend, EventCallback, ResourceId};
use crate::{error::NativeError, event::EventBatch, flags::StreamOptions};

#[derive(Default)]
struct FakeState {
	resources: HashMap<ResourceId, Registration>,
	calls: HashMap<ResourceId, Vec<&'static str>>,
	last_created: Option<ResourceId>,
	fail_next_create: Option<i32>,
	fail_next_start: Option<i32>,
}

struct Registration {
	paths: Vec<PathBuf>,
	latency: Duration,
	options: StreamOptions,
	callback: EventCallback,
	started: bool,
	invalidated: bool,
}

/// Test double standing in for the OS.
///
/// Keeps count of live resources and of every lifecycle call made on them, can be told to fail
/// the next creation or start, and delivers batches synchronously on the thread calling
/// [`FakeBackend::deliver`].
#[derive(Default)]
pub struct FakeBackend {
	state: Mutex<FakeState>,
	live: AtomicUsize,
	created: AtomicUsize,
}

/// Resource handed to the monitor, only the id is needed to find the registration back.
#[derive(Debug)]
pub struct FakeResource {
	id: ResourceId,
}

impl FakeBackend {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, FakeState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn record(&self, id: ResourceId, call: &'static str) {
		self.state().calls.entry(id).or_default().push(call);
	}

	/// Resources created and not released yet.
	pub fn live_resources(&self) -> usize {
		self.live.load(Ordering::Acquire)
	}

	/// Every resource ever created, released or not.
	pub fn created_resources(&self) -> usize {
		self.created.load(Ordering::Acquire)
	}

	pub fn last_created(&self) -> Option<ResourceId> {
		self.state().last_created
	}

	/// Lifecycle calls received for a resource, in order.
	pub fn calls(&self, id: ResourceId) -> Vec<&'static str> {
		self.state().calls.get(&id).cloned().unwrap_or_default()
	}

	pub fn paths(&self, id: ResourceId) -> Option<Vec<PathBuf>> {
		self.state()
			.resources
			.get(&id)
			.map(|registration| registration.paths.clone())
	}

	pub fn latency(&self, id: ResourceId) -> Option<Duration> {
		self.state()
			.resources
			.get(&id)
			.map(|registration| registration.latency)
	}

	pub fn options(&self, id: ResourceId) -> Option<StreamOptions> {
		self.state()
			.resources
			.get(&id)
			.map(|registration| registration.options)
	}

	pub fn fail_next_create(&self, code: i32) {
		self.state().fail_next_create = Some(code);
	}

	pub fn fail_next_start(&self, code: i32) {
		self.state().fail_next_start = Some(code);
	}

	/// Delivers a batch as the OS would, blocking until the callback returns.
	///
	/// Returns `false` when the resource isn't started or was already invalidated.
	pub fn deliver(&self, id: ResourceId, batch: impl Into<EventBatch>) -> bool {
		let callback = {
			let state = self.state();
			match state.resources.get(&id) {
				Some(registration) if registration.started && !registration.invalidated => {
					Arc::clone(&registration.callback)
				}
				_ => {
					trace!(resource_id = id, "Refusing to deliver to inactive resource");
					return false;
				}
			}
		};

		// Lock released, the callback may call back into the backend
		callback(id, batch.into());

		true
	}
}

impl Backend for FakeBackend {
	type Resource = FakeResource;

	fn create(
		&self,
		id: ResourceId,
		paths: &[PathBuf],
		latency: Duration,
		options: StreamOptions,
		callback: EventCallback,
	) -> Result<Self::Resource, NativeError> {
		let mut state = self.state();

		if let Some(code) = state.fail_next_create.take() {
			return Err(NativeError::new(code, "injected create failure"));
		}

		state.resources.insert(
			id,
			Registration {
				paths: paths.to_vec(),
				latency,
				options,
				callback,
				started: false,
				invalidated: false,
			},
		);
		state.calls.entry(id).or_default().push("create");
		state.last_created = Some(id);

		self.live.fetch_add(1, Ordering::AcqRel);
		self.created.fetch_add(1, Ordering::AcqRel);

		Ok(FakeResource { id })
	}

	fn start(&self, resource: &mut Self::Resource) -> Result<(), NativeError> {
		let mut state = self.state();
		state.calls.entry(resource.id).or_default().push("start");

		if let Some(code) = state.fail_next_start.take() {
			return Err(NativeError::new(code, "injected start failure"));
		}

		if let Some(registration) = state.resources.get_mut(&resource.id) {
			registration.started = true;
		}

		Ok(())
	}

	fn stop(&self, resource: &mut Self::Resource) {
		let mut state = self.state();
		state.calls.entry(resource.id).or_default().push("stop");

		if let Some(registration) = state.resources.get_mut(&resource.id) {
			registration.started = false;
		}
	}

	fn invalidate(&self, resource: &mut Self::Resource) {
		let mut state = self.state();
		state.calls.entry(resource.id).or_default().push("invalidate");

		if let Some(registration) = state.resources.get_mut(&resource.id) {
			registration.invalidated = true;
		}
	}

	fn release(&self, resource: Self::Resource) {
		self.record(resource.id, "release");

		if self.state().resources.remove(&resource.id).is_some() {
			self.live.fetch_sub(1, Ordering::AcqRel);
		}
	}
}
