use std::{
	sync::{Mutex, PoisonError},
	thread::{self, ThreadId},
};

use async_channel as chan;
use once_cell::sync::OnceCell;
use tracing::{debug, error, instrument, trace};

use super::{backend::Backend, error::LoopError, monitor::Monitor, token::ThreadToken};

/// Work marshalled onto a loop, its error ends the loop.
pub(crate) type Job = Box<dyn FnOnce() -> Result<(), LoopError> + Send>;

pub(crate) enum LoopMessage {
	Execute(Job),
	Stop,
}

/// Per thread event loop, the only place handlers ever run.
///
/// Starts out as an unclaimed entry, either because a stream was scheduled for a thread that
/// isn't looping yet or because the thread just asked to loop. The OS thread that claims it is
/// the one running [`RunLoop::run`], until the loop exits for good.
pub(crate) struct RunLoop {
	thread: ThreadToken,
	owner: OnceCell<ThreadId>,
	msgs_tx: chan::Sender<LoopMessage>,
	msgs_rx: chan::Receiver<LoopMessage>,
	pending_failure: Mutex<Option<LoopError>>,
}

impl RunLoop {
	pub(crate) fn new(thread: ThreadToken) -> Self {
		let (msgs_tx, msgs_rx) = chan::unbounded();

		Self {
			thread,
			owner: OnceCell::new(),
			msgs_tx,
			msgs_rx,
			pending_failure: Mutex::new(None),
		}
	}

	/// Binds this loop to the calling OS thread, `false` if some thread already did.
	pub(crate) fn claim(&self) -> bool {
		self.owner.set(thread::current().id()).is_ok()
	}

	pub(crate) fn is_claimed(&self) -> bool {
		self.owner.get().is_some()
	}

	pub(crate) fn is_current(&self) -> bool {
		self.owner.get() == Some(&thread::current().id())
	}

	/// Closed once the loop exited, nothing submitted afterwards will ever run.
	pub(crate) fn is_closed(&self) -> bool {
		self.msgs_rx.is_closed()
	}

	pub(crate) fn request_stop(&self) {
		if self.msgs_tx.try_send(LoopMessage::Stop).is_err() {
			trace!(thread = %self.thread, "Loop already exited, nothing to stop");
		}
	}

	/// Queues a job behind everything already submitted, `false` if the loop already exited.
	pub(crate) fn submit(&self, job: Job) -> bool {
		self.msgs_tx.try_send(LoopMessage::Execute(job)).is_ok()
	}

	/// Ends the loop with `e`, used when a failure happens outside of a queued job.
	pub(crate) fn fail(&self, e: LoopError) {
		{
			let mut pending = self
				.pending_failure
				.lock()
				.unwrap_or_else(PoisonError::into_inner);

			// First failure wins
			if pending.is_none() {
				*pending = Some(e);
			}
		}

		self.request_stop();
	}

	/// Stops accepting jobs and drops the queued ones, waking every dispatcher waiting on them.
	///
	/// Runs when the loop exits, and when an entry that never got claimed goes away.
	pub(crate) fn close(&self) {
		self.msgs_rx.close();

		let mut dropped = 0_usize;
		while let Ok(msg) = self.msgs_rx.try_recv() {
			if matches!(msg, LoopMessage::Execute(_)) {
				dropped += 1;
			}
		}
		if dropped > 0 {
			debug!(thread = %self.thread, dropped, "Dropped batches still queued on close;");
		}
	}

	/// Runs queued jobs on the calling thread until asked to stop or a job fails.
	pub(crate) fn run(&self) -> Result<(), LoopError> {
		trace!(thread = %self.thread, "Loop message processing starting...");

		let mut outcome = Ok(());

		while let Ok(msg) = self.msgs_rx.recv_blocking() {
			match msg {
				LoopMessage::Execute(job) => {
					if let Err(e) = job() {
						outcome = Err(e);
						break;
					}
				}

				LoopMessage::Stop => break,
			}
		}

		self.close();

		let pending = self
			.pending_failure
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();

		match (outcome, pending) {
			(Ok(()), Some(e)) => Err(e),
			(outcome, _) => outcome,
		}
	}
}

impl<B: Backend> Monitor<B> {
	/// Blocks the calling thread running `thread`'s loop, handlers for its streams run here.
	///
	/// Streams scheduled before the call are picked up as the loop starts. Returns once
	/// [`Monitor::stop`] is called for `thread`, or with the error of the first failing handler.
	/// Either way every stream attached to the loop is released before returning.
	pub fn run_loop(&self, thread: ThreadToken) -> Result<(), LoopError> {
		self.run_loop_with(thread, || {})
	}

	/// Same as [`Monitor::run_loop`], calling `on_start` once the loop is claimed and before the
	/// first job runs.
	#[instrument(name = "fs_monitor_loop", skip_all, fields(%thread), err)]
	pub(crate) fn run_loop_with(
		&self,
		thread: ThreadToken,
		on_start: impl FnOnce(),
	) -> Result<(), LoopError> {
		let run_loop = self
			.inner
			.registry
			.register_loop(thread)
			.ok_or(LoopError::AlreadyLooping(thread))?;

		debug!("Loop starting");

		on_start();

		let outcome = run_loop.run();

		let detached = self.inner.registry.unregister_loop(thread, &run_loop);
		let released = detached.len();
		for stream in detached {
			stream.native.shutdown();
		}

		match &outcome {
			Ok(()) => debug!(released, "Loop stopped;"),
			Err(e) => error!(?e, released, "Loop failed, its streams were released;"),
		}

		outcome
	}

	/// Asks `thread`'s loop to exit once the handler currently running, if any, returns.
	///
	/// Does nothing when the thread isn't looping, streams parked for it stay parked.
	#[instrument(skip(self))]
	pub fn stop(&self, thread: ThreadToken) {
		match self.inner.registry.lookup_loop(thread) {
			Some(run_loop) if run_loop.is_claimed() => run_loop.request_stop(),
			_ => debug!("Thread isn't looping, nothing to stop"),
		}
	}
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	use crate::token::StreamToken;

	use super::*;

	fn counting_job(counter: &Arc<AtomicUsize>) -> Job {
		let counter = Arc::clone(counter);
		Box::new(move || {
			counter.fetch_add(1, Ordering::SeqCst);
			Ok(())
		})
	}

	#[test]
	fn runs_jobs_until_stopped() {
		let run_loop = RunLoop::new(ThreadToken::new());
		let counter = Arc::new(AtomicUsize::new(0));

		assert!(run_loop.claim());
		assert!(run_loop.is_current());

		assert!(run_loop.submit(counting_job(&counter)));
		assert!(run_loop.submit(counting_job(&counter)));
		run_loop.request_stop();
		assert!(run_loop.submit(counting_job(&counter)));

		run_loop.run().unwrap();

		assert_eq!(counter.load(Ordering::SeqCst), 2);
		assert!(run_loop.is_closed());
		assert!(!run_loop.submit(counting_job(&counter)));
	}

	#[test]
	fn closing_drops_queued_jobs() {
		let run_loop = RunLoop::new(ThreadToken::new());
		let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

		assert!(run_loop.submit(Box::new(move || {
			done_tx.send(()).unwrap();
			Ok(())
		})));

		run_loop.close();

		assert!(done_rx.blocking_recv().is_err());
		assert!(run_loop.is_closed());
		assert!(!run_loop.submit(Box::new(|| Ok(()))));
	}

	#[test]
	fn failing_job_ends_the_loop() {
		let run_loop = RunLoop::new(ThreadToken::new());
		let stream = StreamToken::new();
		let counter = Arc::new(AtomicUsize::new(0));

		run_loop.submit(Box::new(move || {
			Err(LoopError::MarshalFailure {
				stream,
				reason: "test".to_string(),
			})
		}));
		run_loop.submit(counting_job(&counter));

		let Err(e) = run_loop.run() else {
			panic!("expected the loop to fail");
		};

		assert_eq!(e.stream(), Some(stream));
		assert_eq!(counter.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn first_recorded_failure_is_returned() {
		let run_loop = RunLoop::new(ThreadToken::new());
		let (first, second) = (StreamToken::new(), StreamToken::new());

		for stream in [first, second] {
			run_loop.fail(LoopError::MarshalFailure {
				stream,
				reason: "test".to_string(),
			});
		}

		assert_eq!(run_loop.run().unwrap_err().stream(), Some(first));
	}

	#[test]
	fn loop_can_only_be_claimed_once() {
		let run_loop = Arc::new(RunLoop::new(ThreadToken::new()));
		assert!(!run_loop.is_claimed());

		let other = thread::spawn({
			let run_loop = Arc::clone(&run_loop);
			move || run_loop.claim()
		})
		.join()
		.unwrap();

		assert!(other);
		assert!(run_loop.is_claimed());
		assert!(!run_loop.is_current());
		assert!(!run_loop.claim());
	}
}
