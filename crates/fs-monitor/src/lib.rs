//!
//! # File System Monitor
//!
//! A process-wide bridge between native file system change notifications and the threads that
//! want to consume them.
//!
//! Any number of threads can each run their own blocking loop with [`Monitor::run_loop`], and any
//! thread can schedule streams of paths onto one of those loops with [`Monitor::schedule`]. The
//! backend delivers event batches on whatever thread it likes; the dispatcher hands every batch
//! over to the loop that owns the stream and only returns once the handler is done with it. Some
//! guarantees that come with it:
//! - Batches for a stream reach its handler in delivery order, never split, merged or overlapped;
//! - A failing (or panicking) handler ends only its own loop, which then returns the failure;
//! - When a loop exits, every stream attached to it is stopped and released;
//! - Scheduling a stream on a thread that isn't looping yet just parks it until the loop starts.
//!
//! ## Basic example
//!
//! ```no_run
//! use sd_fs_monitor::{
//! 	backend::NotifyBackend, EventBatch, Monitor, StreamOptions, StreamToken, ThreadToken,
//! };
//! use std::time::Duration;
//!
//! let monitor = Monitor::new(NotifyBackend::default());
//! let thread = ThreadToken::new();
//! let stream = StreamToken::new();
//!
//! monitor
//! 	.schedule(
//! 		thread,
//! 		stream,
//! 		["/tmp/watch"],
//! 		|batch: &EventBatch| {
//! 			for event in batch {
//! 				println!("{} {:?}", event.path.display(), event.flags);
//! 			}
//! 			Ok(())
//! 		},
//! 		Duration::from_millis(10),
//! 		StreamOptions::FILE_LEVEL_EVENTS,
//! 	)
//! 	.expect("failed to schedule stream");
//!
//! // Blocks until someone calls `monitor.stop(thread)` or a handler fails
//! monitor.run_loop(thread).expect("monitoring session failed");
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod backend;
mod config;
mod dispatcher;
mod error;
mod event;
mod flags;
mod monitor;
mod observer;
mod registry;
mod run_loop;
mod stream;
mod token;

pub use config::Config;
pub use error::{HandlerError, LoopError, NativeError, ScheduleError, UnscheduleError};
pub use event::{Event, EventBatch, HandlerResult};
pub use flags::{EventFlags, StreamOptions};
pub use monitor::Monitor;
pub use observer::Observer;
pub use stream::StreamState;
pub use token::{StreamToken, ThreadToken};
