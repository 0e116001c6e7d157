//! Watches the paths given as arguments (the current directory by default) for a while, logging
//! every batch the handler receives.
//!
//! `WATCH_SECS` controls how long before the loop is stopped, 30 seconds if unset.

use sd_fs_monitor::{
	backend::NotifyBackend, EventBatch, LoopError, Monitor, StreamOptions, StreamToken,
	ThreadToken,
};

use std::{env, path::PathBuf, thread, time::Duration};

use tracing::info;

fn main() -> Result<(), LoopError> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sd_fs_monitor=debug")),
		)
		.init();

	let mut paths = env::args().skip(1).map(PathBuf::from).collect::<Vec<_>>();
	if paths.is_empty() {
		paths.push(PathBuf::from("."));
	}

	let watch_for = env::var("WATCH_SECS")
		.ok()
		.and_then(|secs| secs.parse().ok())
		.map_or(Duration::from_secs(30), Duration::from_secs);

	let monitor = Monitor::new(NotifyBackend::default());
	let (thread, stream) = (ThreadToken::new(), StreamToken::new());

	if let Err(e) = monitor.schedule(
		thread,
		stream,
		paths.clone(),
		|batch: &EventBatch| {
			for event in batch {
				info!(path = %event.path.display(), flags = ?event.flags, "Event");
			}
			Ok(())
		},
		Duration::from_millis(100),
		StreamOptions::FILE_LEVEL_EVENTS,
	) {
		eprintln!("Unable to watch {paths:?}: {e}");
		return Ok(());
	}

	thread::spawn({
		let monitor = monitor.clone();
		move || {
			thread::sleep(watch_for);
			info!("Time is up, stopping the loop");
			monitor.stop(thread);
		}
	});

	info!(?paths, ?watch_for, "Watching");

	monitor.run_loop(thread)
}
