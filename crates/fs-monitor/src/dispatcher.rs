//! Glue between backend callbacks and the loops owning the streams.
//!
//! The backend may call us from any thread. When that thread happens to be the loop's own, the
//! handler runs right away; otherwise the batch is queued as a job on the loop and the calling
//! thread blocks until the handler is done with it, so the backend never delivers the next batch
//! of a stream before the previous one was handled.

use std::{
	panic::{self, AssertUnwindSafe},
	sync::{Arc, TryLockError, Weak},
};

use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use super::{
	backend::{Backend, EventCallback, ResourceId},
	error::LoopError,
	event::EventBatch,
	monitor::Inner,
	registry::DispatchTarget,
	run_loop::Job,
	stream::SharedHandler,
	token::StreamToken,
};

pub(crate) struct Dispatcher<B: Backend> {
	inner: Weak<Inner<B>>,
}

impl<B: Backend> Dispatcher<B> {
	pub(crate) const fn new(inner: Weak<Inner<B>>) -> Self {
		Self { inner }
	}

	pub(crate) fn into_callback(self) -> EventCallback {
		Arc::new(move |id: ResourceId, batch: EventBatch| self.dispatch(id, batch))
	}

	fn dispatch(&self, id: ResourceId, batch: EventBatch) {
		let Some(DispatchTarget {
			stream,
			run_loop,
			handler,
		}) = self
			.inner
			.upgrade()
			.and_then(|inner| inner.registry.lookup_resource(id))
		else {
			debug!(resource_id = id, "Batch for a resource no longer scheduled, dropping it");
			return;
		};

		if run_loop.is_current() {
			if let Err(e) = invoke(stream, &handler, &batch) {
				run_loop.fail(e);
			}
			return;
		}

		let (done_tx, done_rx) = oneshot::channel();

		let job: Job = Box::new({
			let inner = self.inner.clone();

			move || {
				// The stream may have been unscheduled while this job was waiting in the queue
				let scheduled = inner
					.upgrade()
					.is_some_and(|inner| inner.registry.contains_resource(id));

				let outcome = if scheduled {
					invoke(stream, &handler, &batch)
				} else {
					trace!(%stream, "Stream unscheduled before its batch was handled, skipping");
					Ok(())
				};

				if done_tx.send(()).is_err() {
					trace!(%stream, "Nobody waiting for batch completion anymore");
				}

				outcome
			}
		});

		if !run_loop.submit(job) {
			debug!(%stream, "Loop already exited, dropping batch");
			return;
		}

		if done_rx.blocking_recv().is_err() {
			if run_loop.is_closed() {
				debug!(%stream, "Loop exited before handling batch, dropping it");
			} else {
				error!(%stream, "Batch vanished from its loop before being handled;");
				run_loop.fail(LoopError::MarshalFailure {
					stream,
					reason: "batch was dropped before reaching its handler".to_string(),
				});
			}
		}
	}
}

/// Runs `handler` on the current thread, turning both errors and panics into a [`LoopError`].
///
/// Handlers only ever run on their loop's thread, so finding the handler busy means it's being
/// re-entered from within itself, which is reported instead of deadlocking.
fn invoke(
	stream: StreamToken,
	handler: &SharedHandler,
	batch: &EventBatch,
) -> Result<(), LoopError> {
	let mut guard = match handler.try_lock() {
		Ok(guard) => guard,
		Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
		Err(TryLockError::WouldBlock) => {
			error!(%stream, "Batch delivered while its handler is still running;");
			return Err(LoopError::MarshalFailure {
				stream,
				reason: "handler re-entered by a batch of its own stream".to_string(),
			});
		}
	};
	let handler = &mut *guard;

	trace!(%stream, events_count = batch.len(), "Invoking handler");

	match panic::catch_unwind(AssertUnwindSafe(|| handler(batch))) {
		Ok(Ok(())) => Ok(()),

		Ok(Err(source)) => Err(LoopError::HandlerFailure { stream, source }),

		Err(payload) => {
			let message = payload
				.downcast_ref::<&str>()
				.map(|msg| (*msg).to_string())
				.or_else(|| payload.downcast_ref::<String>().cloned())
				.unwrap_or_else(|| "unknown panic payload".to_string());

			error!(%stream, %message, "Handler panicked;");

			Err(LoopError::HandlerFailure {
				stream,
				source: format!("handler panicked: {message}").into(),
			})
		}
	}
}
