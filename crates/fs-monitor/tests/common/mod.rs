#![allow(dead_code, clippy::unwrap_used)]

use sd_fs_monitor::{backend::Backend, EventBatch, EventFlags, LoopError, Monitor, ThreadToken};

use std::{
	thread::{self, JoinHandle, ThreadId},
	time::{Duration, Instant},
};

pub const DEADLINE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds or the deadline passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + DEADLINE;

	while Instant::now() < deadline {
		if condition() {
			return true;
		}
		thread::sleep(POLL_INTERVAL);
	}

	condition()
}

pub struct LoopThread {
	pub token: ThreadToken,
	handle: JoinHandle<Result<(), LoopError>>,
}

impl LoopThread {
	pub fn os_thread(&self) -> ThreadId {
		self.handle.thread().id()
	}

	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}

	pub fn join(self) -> Result<(), LoopError> {
		self.handle.join().unwrap()
	}
}

/// Runs `token`'s loop on a new thread, returning once it's claimed.
pub fn spawn_loop<B: Backend>(monitor: &Monitor<B>, token: ThreadToken) -> LoopThread {
	let handle = thread::spawn({
		let monitor = monitor.clone();
		move || monitor.run_loop(token)
	});

	assert!(
		wait_until(|| monitor.is_looping(token)),
		"loop never started"
	);

	LoopThread { token, handle }
}

pub fn batch(events: &[(&str, EventFlags)]) -> EventBatch {
	events.iter().map(|&(path, flags)| (path, flags)).collect()
}
