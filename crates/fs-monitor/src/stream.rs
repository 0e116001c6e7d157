use std::{
	fmt,
	path::PathBuf,
	sync::{Arc, Mutex},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{error, instrument, trace};

use super::{
	backend::{Backend, NativeStream},
	dispatcher::Dispatcher,
	error::{ScheduleError, UnscheduleError},
	event::{BoxedHandler, EventBatch, HandlerResult},
	flags::StreamOptions,
	monitor::Monitor,
	token::{StreamToken, ThreadToken},
};

/// Lifecycle of a stream's native resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
	Created,
	/// Attached to its thread's loop, not delivering yet
	Scheduled,
	Running,
	Stopped,
	Released,
}

pub(crate) type SharedHandler = Arc<Mutex<BoxedHandler>>;

/// Registry record of a scheduled stream, owning its native resource.
pub(crate) struct EventStream<B: Backend> {
	pub(crate) token: StreamToken,
	pub(crate) thread: ThreadToken,
	pub(crate) paths: Vec<PathBuf>,
	pub(crate) native: NativeStream<B>,
	pub(crate) handler: SharedHandler,
}

impl<B: Backend> fmt::Debug for EventStream<B> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventStream")
			.field("token", &self.token)
			.field("thread", &self.thread)
			.field("paths", &self.paths)
			.field("native", &self.native)
			.finish_non_exhaustive()
	}
}

impl<B: Backend> Monitor<B> {
	/// Starts watching `paths` and delivers their batches to `handler` on `thread`'s loop.
	///
	/// The thread doesn't need to be looping yet, the stream is parked until it calls
	/// [`Monitor::run_loop`]. Nothing is left behind on failure, partially created native
	/// resources are released before returning.
	#[instrument(skip_all, fields(%thread, %stream, ?latency, ?options), err)]
	pub fn schedule<P: Into<PathBuf>>(
		&self,
		thread: ThreadToken,
		stream: StreamToken,
		paths: impl IntoIterator<Item = P>,
		handler: impl FnMut(&EventBatch) -> HandlerResult + Send + 'static,
		latency: Duration,
		options: StreamOptions,
	) -> Result<(), ScheduleError> {
		let paths = paths.into_iter().map(Into::into).collect::<Vec<PathBuf>>();

		if paths.is_empty() {
			return Err(ScheduleError::EmptyPathSet);
		}

		// Held until registration, a racing schedule of the same token stops here
		let Some(reservation) = self.inner.registry.reserve_stream(stream) else {
			return Err(ScheduleError::DuplicateStream(stream));
		};

		let mut native = NativeStream::create(
			Arc::clone(&self.inner.backend),
			self.inner.next_resource_id(),
			&paths,
			latency,
			options,
			Dispatcher::new(Arc::downgrade(&self.inner)).into_callback(),
		)?;

		native.attach();

		if let Err(e) = native.start() {
			error!(?e, "Failed to start native resource, releasing it;");
			native.shutdown();
			return Err(e.into());
		}

		let handler: BoxedHandler = Box::new(handler);

		reservation.register(EventStream {
			token: stream,
			thread,
			paths,
			native,
			handler: Arc::new(Mutex::new(handler)),
		});

		trace!("Stream scheduled");

		Ok(())
	}

	/// Same as [`Monitor::schedule`] with the latency and options from the monitor's [`Config`].
	///
	/// [`Config`]: crate::Config
	pub fn schedule_with_defaults<P: Into<PathBuf>>(
		&self,
		thread: ThreadToken,
		stream: StreamToken,
		paths: impl IntoIterator<Item = P>,
		handler: impl FnMut(&EventBatch) -> HandlerResult + Send + 'static,
	) -> Result<(), ScheduleError> {
		let config = &self.inner.config;
		self.schedule(
			thread,
			stream,
			paths,
			handler,
			config.latency,
			config.options,
		)
	}

	/// Stops and releases a stream; unscheduling the same token twice is an error.
	#[instrument(skip_all, fields(%stream), err)]
	pub fn unschedule(&self, stream: StreamToken) -> Result<(), UnscheduleError> {
		let record = self
			.inner
			.registry
			.unregister_stream(stream)
			.ok_or(UnscheduleError::UnknownStream(stream))?;

		record.native.shutdown();

		trace!("Stream unscheduled");

		Ok(())
	}

	#[must_use]
	pub fn stream_state(&self, stream: StreamToken) -> Option<StreamState> {
		self.inner
			.registry
			.lookup_stream(stream)
			.map(|info| info.state)
	}

	#[must_use]
	pub fn watched_paths(&self, stream: StreamToken) -> Option<Vec<PathBuf>> {
		self.inner
			.registry
			.lookup_stream(stream)
			.map(|info| info.paths)
	}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use crate::{backend::FakeBackend, error::NativeError};

	use super::*;

	fn ok_handler(_: &EventBatch) -> HandlerResult {
		Ok(())
	}

	#[test]
	fn schedule_registers_running_stream() {
		let monitor = Monitor::new(FakeBackend::new());
		let (thread, stream) = (ThreadToken::new(), StreamToken::new());

		monitor
			.schedule(
				thread,
				stream,
				["/tmp/watch"],
				ok_handler,
				Duration::from_millis(10),
				StreamOptions::FILE_LEVEL_EVENTS,
			)
			.unwrap();

		assert_eq!(monitor.stream_state(stream), Some(StreamState::Running));
		assert_eq!(
			monitor.watched_paths(stream),
			Some(vec![PathBuf::from("/tmp/watch")])
		);

		let id = monitor.resource_id(stream).unwrap();
		assert_eq!(monitor.backend().latency(id), Some(Duration::from_millis(10)));
		assert_eq!(
			monitor.backend().options(id),
			Some(StreamOptions::FILE_LEVEL_EVENTS)
		);
	}

	#[test]
	fn failed_start_rolls_back() {
		let monitor = Monitor::new(FakeBackend::new());
		let stream = StreamToken::new();
		monitor.backend().fail_next_start(13);

		let Err(ScheduleError::NativeResource(e)) = monitor.schedule(
			ThreadToken::new(),
			stream,
			["/tmp/watch"],
			ok_handler,
			Duration::ZERO,
			StreamOptions::empty(),
		) else {
			panic!("expected a native resource error");
		};

		assert_eq!(e.code, 13);
		assert_eq!(monitor.backend().live_resources(), 0);
		assert_eq!(monitor.stream_state(stream), None);

		let id = monitor.backend().last_created().unwrap();
		assert_eq!(
			monitor.backend().calls(id),
			["create", "start", "invalidate", "release"]
		);
	}

	#[test]
	fn failed_create_leaves_nothing_behind() {
		let monitor = Monitor::new(FakeBackend::new());
		let thread = ThreadToken::new();
		monitor.backend().fail_next_create(24);

		assert!(matches!(
			monitor.schedule(
				thread,
				StreamToken::new(),
				["/tmp/watch"],
				ok_handler,
				Duration::ZERO,
				StreamOptions::empty(),
			),
			Err(ScheduleError::NativeResource(NativeError { code: 24, .. }))
		));
		assert_eq!(monitor.backend().created_resources(), 0);
		assert!(!monitor.has_loop_entry(thread));
	}

	#[test]
	fn unschedule_twice_is_an_error() {
		let monitor = Monitor::new(FakeBackend::new());
		let stream = StreamToken::new();

		monitor
			.schedule_with_defaults(ThreadToken::new(), stream, ["/tmp/watch"], ok_handler)
			.unwrap();

		monitor.unschedule(stream).unwrap();
		assert!(matches!(
			monitor.unschedule(stream),
			Err(UnscheduleError::UnknownStream(token)) if token == stream
		));
	}

	#[test]
	fn unscheduling_last_parked_stream_drops_placeholder_loop() {
		let monitor = Monitor::new(FakeBackend::new());
		let (thread, stream) = (ThreadToken::new(), StreamToken::new());

		monitor
			.schedule_with_defaults(thread, stream, ["/tmp/watch"], ok_handler)
			.unwrap();
		assert!(monitor.has_loop_entry(thread));
		assert!(!monitor.is_looping(thread));

		monitor.unschedule(stream).unwrap();
		assert!(!monitor.has_loop_entry(thread));
	}
}
