use std::{
	io, panic,
	path::PathBuf,
	thread::{self, JoinHandle},
};

use tokio::sync::oneshot;
use tracing::{error, instrument, trace};

use super::{
	backend::Backend,
	error::{LoopError, ScheduleError, UnscheduleError},
	event::{EventBatch, HandlerResult},
	monitor::Monitor,
	token::{StreamToken, ThreadToken},
};

/// A dedicated thread running its own loop, for callers that don't want to give one of theirs.
///
/// Streams scheduled through it use the monitor's [`Config`](crate::Config) defaults. Dropping
/// the observer stops its loop and waits for the thread to exit.
pub struct Observer<B: Backend> {
	monitor: Monitor<B>,
	thread: ThreadToken,
	handle: Option<JoinHandle<Result<(), LoopError>>>,
}

impl<B: Backend> Observer<B> {
	/// Spawns the observer thread, returning once its loop is up and running.
	pub fn spawn(monitor: Monitor<B>) -> io::Result<Self> {
		let thread = ThreadToken::new();
		let (started_tx, started_rx) = oneshot::channel();

		let handle = thread::Builder::new()
			.name(monitor.config().observer_thread_name.clone())
			.spawn({
				let monitor = monitor.clone();
				move || {
					monitor.run_loop_with(thread, move || {
						if started_tx.send(()).is_err() {
							trace!("Observer spawner went away before the loop started");
						}
					})
				}
			})?;

		if started_rx.blocking_recv().is_err() {
			let reason = match handle.join() {
				Ok(Err(e)) => e.to_string(),
				Ok(Ok(())) | Err(_) => "observer thread exited before its loop started".to_string(),
			};

			return Err(io::Error::other(reason));
		}

		trace!(%thread, "Observer started");

		Ok(Self {
			monitor,
			thread,
			handle: Some(handle),
		})
	}

	#[must_use]
	pub const fn thread_token(&self) -> ThreadToken {
		self.thread
	}

	#[must_use]
	pub const fn monitor(&self) -> &Monitor<B> {
		&self.monitor
	}

	/// Schedules a new stream on the observer's loop, returning the token to unschedule it with.
	#[instrument(skip_all, fields(thread = %self.thread), err)]
	pub fn schedule<P: Into<PathBuf>>(
		&self,
		paths: impl IntoIterator<Item = P>,
		handler: impl FnMut(&EventBatch) -> HandlerResult + Send + 'static,
	) -> Result<StreamToken, ScheduleError> {
		let stream = StreamToken::new();

		self.monitor
			.schedule_with_defaults(self.thread, stream, paths, handler)
			.map(|()| stream)
	}

	pub fn unschedule(&self, stream: StreamToken) -> Result<(), UnscheduleError> {
		self.monitor.unschedule(stream)
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.handle
			.as_ref()
			.is_some_and(|handle| !handle.is_finished())
	}

	pub fn stop(&self) {
		self.monitor.stop(self.thread);
	}

	/// Waits for the observer's loop to exit, which happens after [`Observer::stop`] or on the
	/// first handler failure.
	pub fn join(mut self) -> Result<(), LoopError> {
		self.wait()
	}

	fn wait(&mut self) -> Result<(), LoopError> {
		let Some(handle) = self.handle.take() else {
			return Ok(());
		};

		match handle.join() {
			Ok(outcome) => outcome,
			// Handler panics are caught on the loop, anything else is a bug worth propagating
			Err(payload) => panic::resume_unwind(payload),
		}
	}
}

impl<B: Backend> Drop for Observer<B> {
	fn drop(&mut self) {
		if self.handle.is_none() {
			return;
		}

		self.stop();

		if let Err(e) = self.wait() {
			error!(?e, thread = %self.thread, "Observer loop had failed;");
		}
	}
}
