//! Backend over the `notify` crate, so every platform it supports gets FSEvents-like streams.
//!
//! Each stream owns a watcher plus a delivery thread. The watcher pushes raw events into an
//! unbounded channel, the delivery thread waits for the stream latency after the first event,
//! drains whatever piled up and invokes the callback once with the whole batch. Having a single
//! thread per stream is what keeps batches of a stream ordered and never overlapping.

use std::{
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread,
	time::{Duration, Instant},
};

use ::notify::{
	event::{CreateKind, MetadataKind, ModifyKind, RemoveKind},
	Config, Event as RawEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use async_channel as chan;
use tracing::{debug, error, instrument, trace, warn};

use super::{Backend, EventCallback, ResourceId};
use crate::{
	error::NativeError,
	event::{Event, EventBatch},
	flags::{EventFlags, StreamOptions},
};

/// Options notify has no way to honour.
const UNSUPPORTED_OPTIONS: StreamOptions = StreamOptions::WATCH_ROOT
	.union(StreamOptions::IGNORE_SELF)
	.union(StreamOptions::MARK_SELF);

#[derive(Debug, Clone, Default)]
pub struct NotifyBackend {
	config: Config,
}

impl NotifyBackend {
	/// Uses a custom `notify` configuration, only meaningful for polling watchers.
	#[must_use]
	pub const fn with_config(config: Config) -> Self {
		Self { config }
	}
}

pub struct NotifyResource {
	id: ResourceId,
	paths: Vec<PathBuf>,
	watcher: RecommendedWatcher,
	watching: Vec<PathBuf>,
	valid: Arc<AtomicBool>,
}

impl Backend for NotifyBackend {
	type Resource = NotifyResource;

	#[instrument(skip(self, paths, callback), fields(paths_count = paths.len()), err)]
	fn create(
		&self,
		id: ResourceId,
		paths: &[PathBuf],
		latency: Duration,
		options: StreamOptions,
		callback: EventCallback,
	) -> Result<Self::Resource, NativeError> {
		if options.intersects(UNSUPPORTED_OPTIONS) {
			warn!(
				unsupported = ?options.intersection(UNSUPPORTED_OPTIONS),
				"Stream options not supported by this backend, ignoring them;"
			);
		}

		let (events_tx, events_rx) = chan::unbounded();
		let valid = Arc::new(AtomicBool::new(true));

		let watcher = RecommendedWatcher::new(
			move |result| {
				if !events_tx.is_closed() {
					// SAFETY: we are not blocking the thread as this is an unbounded channel
					if events_tx.send_blocking(result).is_err() {
						error!(resource_id = id, "Unable to forward raw file system event;");
					}
				} else {
					debug!(resource_id = id, "Dropping raw event for a released resource");
				}
			},
			self.config,
		)?;

		let converter = Converter {
			roots: paths.to_vec(),
			file_level: options.contains(StreamOptions::FILE_LEVEL_EVENTS),
		};
		let pacing = Pacing {
			latency,
			no_defer: options.contains(StreamOptions::NO_DEFER),
		};

		thread::Builder::new()
			.name(format!("fs-monitor-delivery-{id}"))
			.spawn({
				let valid = Arc::clone(&valid);
				move || deliver_batches(id, &events_rx, pacing, &converter, &valid, &callback)
			})?;

		Ok(NotifyResource {
			id,
			paths: paths.to_vec(),
			watcher,
			watching: Vec::with_capacity(paths.len()),
			valid,
		})
	}

	#[instrument(skip_all, fields(resource_id = resource.id), err)]
	fn start(&self, resource: &mut Self::Resource) -> Result<(), NativeError> {
		for path in &resource.paths {
			if let Err(e) = resource.watcher.watch(path, RecursiveMode::Recursive) {
				error!(?e, path = %path.display(), "Unable to watch path, rolling back;");
				unwatch_all(resource);
				return Err(e.into());
			}

			resource.watching.push(path.clone());
		}

		trace!("Now watching paths");

		Ok(())
	}

	fn stop(&self, resource: &mut Self::Resource) {
		unwatch_all(resource);
	}

	fn invalidate(&self, resource: &mut Self::Resource) {
		resource.valid.store(false, Ordering::Release);
	}

	fn release(&self, resource: Self::Resource) {
		// Dropping the watcher closes the events channel and the delivery thread exits on its own.
		// We don't join it, as release may run inside a handler that this very thread is waiting on.
		drop(resource);
	}
}

fn unwatch_all(resource: &mut NotifyResource) {
	for path in resource.watching.drain(..) {
		if let Err(e) = resource.watcher.unwatch(&path) {
			// Happens when the watched directory was removed in the meantime
			debug!(?e, path = %path.display(), "Unable to unwatch path;");
		}
	}
}

/// How long the delivery thread holds events back before emitting a batch.
#[derive(Debug, Clone, Copy)]
struct Pacing {
	latency: Duration,
	/// The first event after a quiet period goes out right away, later ones are coalesced
	no_defer: bool,
}

impl Pacing {
	/// Time to wait after an event arrived, `since_last_batch` being `None` before the first one.
	fn hold_back(self, since_last_batch: Option<Duration>) -> Duration {
		let quiet = since_last_batch.map_or(true, |elapsed| elapsed >= self.latency);

		if self.no_defer && quiet {
			Duration::ZERO
		} else {
			self.latency
		}
	}
}

fn deliver_batches(
	id: ResourceId,
	events_rx: &chan::Receiver<::notify::Result<RawEvent>>,
	pacing: Pacing,
	converter: &Converter,
	valid: &AtomicBool,
	callback: &EventCallback,
) {
	trace!(resource_id = id, "Delivery thread starting...");

	let mut last_batch_at = None::<Instant>;

	while let Ok(first) = events_rx.recv_blocking() {
		let hold_back = pacing.hold_back(last_batch_at.map(|at| at.elapsed()));
		if !hold_back.is_zero() {
			thread::sleep(hold_back);
		}

		let mut batch = Vec::new();
		converter.push(&mut batch, first);
		while let Ok(next) = events_rx.try_recv() {
			converter.push(&mut batch, next);
		}

		if batch.is_empty() {
			continue;
		}

		if !valid.load(Ordering::Acquire) {
			trace!(resource_id = id, "Resource invalidated, dropping batch");
			break;
		}

		callback(id, EventBatch::new(batch));
		last_batch_at = Some(Instant::now());
	}

	trace!(resource_id = id, "Delivery thread exiting");
}

struct Converter {
	roots: Vec<PathBuf>,
	file_level: bool,
}

impl Converter {
	fn push(&self, batch: &mut Vec<Event>, result: ::notify::Result<RawEvent>) {
		match result {
			Ok(event) => {
				let mut flags = event_flags(&event.kind);
				if event.need_rescan() {
					flags |= EventFlags::MUST_SCAN_SUBDIRS;
				}

				if flags.is_empty() {
					return;
				}

				batch.extend(
					event
						.paths
						.iter()
						.map(|path| Event::new(self.reported_path(path), flags)),
				);
			}

			Err(e) => {
				error!(?e, "Watcher error, asking consumers to rescan;");

				let flags = EventFlags::MUST_SCAN_SUBDIRS | EventFlags::USER_DROPPED;
				let paths = if e.paths.is_empty() {
					&self.roots
				} else {
					&e.paths
				};

				batch.extend(paths.iter().map(|path| Event::new(path.clone(), flags)));
			}
		}
	}

	fn reported_path(&self, path: &Path) -> PathBuf {
		if self.file_level {
			return path.to_path_buf();
		}

		// Directory granularity, unless the changed item is one of the roots itself
		if self.roots.iter().any(|root| root == path) {
			path.to_path_buf()
		} else {
			path.parent().map_or_else(|| path.to_path_buf(), Path::to_path_buf)
		}
	}
}

/// Maps a `notify` event kind onto the FSEvents item bits, `None` kinds map to no bits at all.
fn event_flags(kind: &EventKind) -> EventFlags {
	match kind {
		EventKind::Create(create) => {
			EventFlags::ITEM_CREATED
				| match create {
					CreateKind::File => EventFlags::ITEM_IS_FILE,
					CreateKind::Folder => EventFlags::ITEM_IS_DIR,
					CreateKind::Any | CreateKind::Other => EventFlags::empty(),
				}
		}

		EventKind::Remove(remove) => {
			EventFlags::ITEM_REMOVED
				| match remove {
					RemoveKind::File => EventFlags::ITEM_IS_FILE,
					RemoveKind::Folder => EventFlags::ITEM_IS_DIR,
					RemoveKind::Any | RemoveKind::Other => EventFlags::empty(),
				}
		}

		EventKind::Modify(modify) => match modify {
			ModifyKind::Name(_) => EventFlags::ITEM_RENAMED,
			ModifyKind::Metadata(MetadataKind::Ownership) => EventFlags::ITEM_OWNER_CHANGED,
			ModifyKind::Metadata(MetadataKind::Extended) => EventFlags::ITEM_XATTR_MODIFIED,
			ModifyKind::Metadata(_) => EventFlags::ITEM_INODE_META_MODIFIED,
			ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other => EventFlags::ITEM_MODIFIED,
		},

		// Reads have no FSEvents counterpart
		EventKind::Access(_) => EventFlags::empty(),

		EventKind::Any | EventKind::Other => EventFlags::MUST_SCAN_SUBDIRS,
	}
}

#[cfg(test)]
mod tests {
	use ::notify::event::{DataChange, RenameMode};

	use super::*;

	fn converter(file_level: bool) -> Converter {
		Converter {
			roots: vec![PathBuf::from("/tmp/watch")],
			file_level,
		}
	}

	#[test]
	fn no_defer_only_skips_the_wait_after_a_quiet_period() {
		let latency = Duration::from_millis(100);
		let deferred = Pacing {
			latency,
			no_defer: false,
		};
		let eager = Pacing {
			latency,
			no_defer: true,
		};

		assert_eq!(deferred.hold_back(None), latency);
		assert_eq!(deferred.hold_back(Some(Duration::from_secs(5))), latency);

		assert_eq!(eager.hold_back(None), Duration::ZERO);
		assert_eq!(eager.hold_back(Some(Duration::from_secs(5))), Duration::ZERO);
		assert_eq!(eager.hold_back(Some(Duration::from_millis(10))), latency);
	}

	#[test]
	fn kinds_map_to_item_bits() {
		assert_eq!(
			event_flags(&EventKind::Create(CreateKind::File)),
			EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE
		);
		assert_eq!(
			event_flags(&EventKind::Remove(RemoveKind::Folder)),
			EventFlags::ITEM_REMOVED | EventFlags::ITEM_IS_DIR
		);
		assert_eq!(
			event_flags(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
			EventFlags::ITEM_RENAMED
		);
		assert_eq!(
			event_flags(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
			EventFlags::ITEM_MODIFIED
		);
		assert_eq!(
			event_flags(&EventKind::Modify(ModifyKind::Metadata(
				MetadataKind::Permissions
			))),
			EventFlags::ITEM_INODE_META_MODIFIED
		);
		assert!(event_flags(&EventKind::Access(::notify::event::AccessKind::Any)).is_empty());
	}

	#[test]
	fn directory_granularity_reports_parent() {
		let mut batch = Vec::new();
		converter(false).push(
			&mut batch,
			Ok(RawEvent::new(EventKind::Create(CreateKind::File))
				.add_path(PathBuf::from("/tmp/watch/a.txt"))),
		);

		assert_eq!(
			batch,
			[Event::new(
				"/tmp/watch",
				EventFlags::ITEM_CREATED | EventFlags::ITEM_IS_FILE
			)]
		);
	}

	#[test]
	fn file_granularity_reports_item() {
		let mut batch = Vec::new();
		converter(true).push(
			&mut batch,
			Ok(RawEvent::new(EventKind::Modify(ModifyKind::Name(
				RenameMode::Both,
			)))
			.add_path(PathBuf::from("/tmp/watch/a.txt"))
			.add_path(PathBuf::from("/tmp/watch/b.txt"))),
		);

		assert_eq!(
			batch,
			[
				Event::new("/tmp/watch/a.txt", EventFlags::ITEM_RENAMED),
				Event::new("/tmp/watch/b.txt", EventFlags::ITEM_RENAMED),
			]
		);
	}

	#[test]
	fn watcher_errors_ask_for_rescan_of_roots() {
		let mut batch = Vec::new();
		converter(true).push(&mut batch, Err(::notify::Error::generic("queue overflow")));

		assert_eq!(
			batch,
			[Event::new(
				"/tmp/watch",
				EventFlags::MUST_SCAN_SUBDIRS | EventFlags::USER_DROPPED
			)]
		);
	}
}
