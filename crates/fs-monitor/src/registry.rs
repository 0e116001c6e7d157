//! Lookup tables shared by every operation, the only mutable state the monitor has.
//!
//! Everything goes through a single lock held for short bookkeeping only, native calls and
//! handlers always run after it's released. Every operation is total: absence is reported with
//! `None` and callers decide whether it's an error.

use std::{
	collections::{HashMap, HashSet},
	path::PathBuf,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::trace;

use super::{
	backend::{Backend, ResourceId},
	run_loop::RunLoop,
	stream::{EventStream, SharedHandler, StreamState},
	token::{StreamToken, ThreadToken},
};

/// Everything the dispatcher needs to hand a batch over, cloned out of the registry.
pub(crate) struct DispatchTarget {
	pub(crate) stream: StreamToken,
	pub(crate) run_loop: Arc<RunLoop>,
	pub(crate) handler: SharedHandler,
}

#[derive(Debug, Clone)]
pub(crate) struct StreamInfo {
	pub(crate) thread: ThreadToken,
	pub(crate) resource_id: ResourceId,
	pub(crate) state: StreamState,
	pub(crate) paths: Vec<PathBuf>,
}

struct RegistryState<B: Backend> {
	loops: HashMap<ThreadToken, Arc<RunLoop>>,
	streams: HashMap<StreamToken, EventStream<B>>,
	resources: HashMap<ResourceId, StreamToken>,
	reserved: HashSet<StreamToken>,
}

pub(crate) struct Registry<B: Backend> {
	state: Mutex<RegistryState<B>>,
}

/// Hold on a stream token while its native resource is being set up, so no other schedule of
/// the same token gets past the duplicate check. Dropping it without registering frees the token.
pub(crate) struct StreamReservation<'registry, B: Backend> {
	registry: &'registry Registry<B>,
	token: StreamToken,
	armed: bool,
}

impl<B: Backend> StreamReservation<'_, B> {
	/// Inserts the stream and attaches it to its thread's loop, creating a placeholder entry when
	/// the thread isn't looping yet.
	pub(crate) fn register(mut self, stream: EventStream<B>) {
		debug_assert_eq!(stream.token, self.token);
		self.armed = false;

		let mut state = self.registry.state();
		state.reserved.remove(&self.token);

		state.loops.entry(stream.thread).or_insert_with(|| {
			trace!(thread = %stream.thread, "Creating placeholder loop entry");
			Arc::new(RunLoop::new(stream.thread))
		});

		state.resources.insert(stream.native.id(), stream.token);
		state.streams.insert(stream.token, stream);
	}
}

impl<B: Backend> Drop for StreamReservation<'_, B> {
	fn drop(&mut self) {
		if self.armed {
			trace!(stream = %self.token, "Releasing unused stream reservation");
			self.registry.state().reserved.remove(&self.token);
		}
	}
}

impl<B: Backend> Registry<B> {
	pub(crate) fn new() -> Self {
		Self {
			state: Mutex::new(RegistryState {
				loops: HashMap::new(),
				streams: HashMap::new(),
				resources: HashMap::new(),
				reserved: HashSet::new(),
			}),
		}
	}

	fn state(&self) -> MutexGuard<'_, RegistryState<B>> {
		// No critical section can leave the maps half updated, so a poisoned lock is still usable
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Claims `thread`'s loop for the calling OS thread, picking up the placeholder left by an
	/// earlier schedule if there's one. `None` if that loop is already running.
	pub(crate) fn register_loop(&self, thread: ThreadToken) -> Option<Arc<RunLoop>> {
		let mut state = self.state();

		let run_loop = state
			.loops
			.entry(thread)
			.or_insert_with(|| Arc::new(RunLoop::new(thread)));

		run_loop.claim().then(|| Arc::clone(run_loop))
	}

	/// Removes `thread`'s loop entry and detaches every stream it owned, handing them back so
	/// their native resources can be released outside the lock.
	pub(crate) fn unregister_loop(
		&self,
		thread: ThreadToken,
		run_loop: &Arc<RunLoop>,
	) -> Vec<EventStream<B>> {
		let mut state = self.state();

		if state
			.loops
			.get(&thread)
			.is_some_and(|registered| Arc::ptr_eq(registered, run_loop))
		{
			state.loops.remove(&thread);
		}

		let owned = state
			.streams
			.values()
			.filter(|stream| stream.thread == thread)
			.map(|stream| stream.token)
			.collect::<Vec<_>>();

		owned
			.into_iter()
			.filter_map(|token| {
				let stream = state.streams.remove(&token)?;
				state.resources.remove(&stream.native.id());
				Some(stream)
			})
			.collect()
	}

	/// Reserves `token` for a stream about to be created, `None` if it's scheduled or reserved.
	pub(crate) fn reserve_stream(&self, token: StreamToken) -> Option<StreamReservation<'_, B>> {
		let mut state = self.state();

		if state.streams.contains_key(&token) || !state.reserved.insert(token) {
			return None;
		}

		Some(StreamReservation {
			registry: self,
			token,
			armed: true,
		})
	}

	/// Removes a stream, dropping its thread's placeholder loop entry if nothing else uses it.
	pub(crate) fn unregister_stream(&self, token: StreamToken) -> Option<EventStream<B>> {
		let mut state = self.state();

		let stream = state.streams.remove(&token)?;
		state.resources.remove(&stream.native.id());

		let idle_placeholder = state
			.loops
			.get(&stream.thread)
			.is_some_and(|run_loop| !run_loop.is_claimed())
			&& !state
				.streams
				.values()
				.any(|other| other.thread == stream.thread);

		let dropped_loop = if idle_placeholder {
			trace!(thread = %stream.thread, "Dropping idle placeholder loop entry");
			state.loops.remove(&stream.thread)
		} else {
			None
		};

		drop(state);

		// Batches parked on the placeholder would otherwise wait forever
		if let Some(run_loop) = dropped_loop {
			run_loop.close();
		}

		Some(stream)
	}

	pub(crate) fn lookup_stream(&self, token: StreamToken) -> Option<StreamInfo> {
		self.state().streams.get(&token).map(|stream| StreamInfo {
			thread: stream.thread,
			resource_id: stream.native.id(),
			state: stream.native.state(),
			paths: stream.paths.clone(),
		})
	}

	pub(crate) fn lookup_loop(&self, thread: ThreadToken) -> Option<Arc<RunLoop>> {
		self.state().loops.get(&thread).map(Arc::clone)
	}

	/// Resolves a native resource to its stream and the loop that stream must be handled on.
	pub(crate) fn lookup_resource(&self, id: ResourceId) -> Option<DispatchTarget> {
		let state = self.state();

		let token = state.resources.get(&id)?;
		let stream = state.streams.get(token)?;
		let run_loop = state.loops.get(&stream.thread)?;

		Some(DispatchTarget {
			stream: stream.token,
			run_loop: Arc::clone(run_loop),
			handler: Arc::clone(&stream.handler),
		})
	}

	pub(crate) fn contains_stream(&self, token: StreamToken) -> bool {
		self.state().streams.contains_key(&token)
	}

	pub(crate) fn contains_resource(&self, id: ResourceId) -> bool {
		self.state().resources.contains_key(&id)
	}

	/// Empties the registry, used when the monitor itself goes away.
	pub(crate) fn drain(&self) -> Vec<EventStream<B>> {
		let (loops, streams) = {
			let mut state = self.state();

			state.resources.clear();
			state.reserved.clear();
			(
				state.loops.drain().map(|(_, run_loop)| run_loop).collect::<Vec<_>>(),
				state
					.streams
					.drain()
					.map(|(_, stream)| stream)
					.collect::<Vec<_>>(),
			)
		};

		for run_loop in loops {
			run_loop.close();
		}

		streams
	}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
	use std::time::Duration;

	use crate::{
		backend::{FakeBackend, NativeStream},
		event::{BoxedHandler, EventBatch},
		flags::StreamOptions,
	};

	use super::*;

	fn stream(
		backend: &Arc<FakeBackend>,
		id: ResourceId,
		thread: ThreadToken,
	) -> EventStream<FakeBackend> {
		let paths = vec![PathBuf::from("/tmp/watch")];
		let handler: BoxedHandler = Box::new(|_: &EventBatch| Ok(()));

		EventStream {
			token: StreamToken::new(),
			thread,
			native: NativeStream::create(
				Arc::clone(backend),
				id,
				&paths,
				Duration::ZERO,
				StreamOptions::empty(),
				Arc::new(|_: ResourceId, _: EventBatch| {}),
			)
			.unwrap(),
			paths,
			handler: Arc::new(Mutex::new(handler)),
		}
	}

	fn register(registry: &Registry<FakeBackend>, stream: EventStream<FakeBackend>) {
		registry
			.reserve_stream(stream.token)
			.unwrap()
			.register(stream);
	}

	#[test]
	fn reserved_token_cannot_be_reserved_again() {
		let backend = Arc::new(FakeBackend::new());
		let registry = Registry::new();
		let first = stream(&backend, 1, ThreadToken::new());
		let token = first.token;

		let reservation = registry.reserve_stream(token).unwrap();
		assert!(registry.reserve_stream(token).is_none());
		assert!(!registry.contains_stream(token));

		// Dropping an unused reservation frees the token
		drop(reservation);
		let reservation = registry.reserve_stream(token).unwrap();

		reservation.register(first);
		assert!(registry.contains_stream(token));
		assert!(registry.reserve_stream(token).is_none());
		assert!(registry.lookup_resource(1).is_some());

		for stream in registry.drain() {
			stream.native.shutdown();
		}
		assert_eq!(backend.live_resources(), 0);
	}

	#[test]
	fn dropping_placeholder_closes_its_queue() {
		let backend = Arc::new(FakeBackend::new());
		let registry = Registry::new();
		let thread = ThreadToken::new();
		let parked = stream(&backend, 1, thread);
		let token = parked.token;

		register(&registry, parked);
		let placeholder = registry.lookup_loop(thread).unwrap();
		assert!(placeholder.submit(Box::new(|| Ok(()))));

		registry.unregister_stream(token).unwrap().native.shutdown();

		assert!(placeholder.is_closed());
		assert!(registry.lookup_loop(thread).is_none());
	}

	#[test]
	fn placeholder_is_claimed_once() {
		let backend = Arc::new(FakeBackend::new());
		let registry = Registry::new();
		let thread = ThreadToken::new();

		register(&registry, stream(&backend, 1, thread));
		let placeholder = registry.lookup_loop(thread).unwrap();
		assert!(!placeholder.is_claimed());

		let claimed = registry.register_loop(thread).unwrap();
		assert!(Arc::ptr_eq(&placeholder, &claimed));
		assert!(registry.register_loop(thread).is_none());

		let detached = registry.unregister_loop(thread, &claimed);
		assert_eq!(detached.len(), 1);
		assert!(registry.lookup_loop(thread).is_none());
		assert!(registry.lookup_resource(1).is_none());

		for stream in detached {
			stream.native.shutdown();
		}
	}

	#[test]
	fn unregister_loop_keeps_other_threads_streams() {
		let backend = Arc::new(FakeBackend::new());
		let registry = Registry::new();
		let (first_thread, second_thread) = (ThreadToken::new(), ThreadToken::new());

		register(&registry, stream(&backend, 1, first_thread));
		register(&registry, stream(&backend, 2, second_thread));

		let run_loop = registry.register_loop(first_thread).unwrap();
		let detached = registry.unregister_loop(first_thread, &run_loop);

		assert_eq!(
			detached.iter().map(|s| s.native.id()).collect::<Vec<_>>(),
			[1]
		);
		assert!(registry.lookup_resource(2).is_some());

		for stream in detached.into_iter().chain(registry.drain()) {
			stream.native.shutdown();
		}
	}
}
