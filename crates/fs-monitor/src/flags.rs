use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
	/// Options used when creating a stream, values mirror the `FSEventStreamCreateFlags` bits.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
	#[serde(transparent)]
	pub struct StreamOptions: u32 {
		/// Deliver the first event of a quiet period right away instead of waiting for the latency.
		const NO_DEFER = 0x0000_0002;
		/// Also report changes to the path of the watched roots themselves.
		const WATCH_ROOT = 0x0000_0004;
		/// Don't report changes made by the current process.
		const IGNORE_SELF = 0x0000_0008;
		/// Report the changed item instead of its containing directory.
		const FILE_LEVEL_EVENTS = 0x0000_0010;
		/// Tag changes made by the current process with [`EventFlags::OWN_EVENT`].
		const MARK_SELF = 0x0000_0020;
	}
}

bitflags! {
	/// Bits delivered along with each changed path, mirroring `FSEventStreamEventFlags`.
	///
	/// They are passed through as they come, unknown bits included.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
	#[serde(transparent)]
	pub struct EventFlags: u32 {
		const MUST_SCAN_SUBDIRS = 0x0000_0001;
		const USER_DROPPED = 0x0000_0002;
		const KERNEL_DROPPED = 0x0000_0004;
		const EVENT_IDS_WRAPPED = 0x0000_0008;
		const HISTORY_DONE = 0x0000_0010;
		const ROOT_CHANGED = 0x0000_0020;
		const MOUNT = 0x0000_0040;
		const UNMOUNT = 0x0000_0080;
		const ITEM_CREATED = 0x0000_0100;
		const ITEM_REMOVED = 0x0000_0200;
		const ITEM_INODE_META_MODIFIED = 0x0000_0400;
		const ITEM_RENAMED = 0x0000_0800;
		const ITEM_MODIFIED = 0x0000_1000;
		const ITEM_FINDER_INFO_MODIFIED = 0x0000_2000;
		const ITEM_OWNER_CHANGED = 0x0000_4000;
		const ITEM_XATTR_MODIFIED = 0x0000_8000;
		const ITEM_IS_FILE = 0x0001_0000;
		const ITEM_IS_DIR = 0x0002_0000;
		const ITEM_IS_SYMLINK = 0x0004_0000;
		const OWN_EVENT = 0x0008_0000;
		const ITEM_IS_HARDLINK = 0x0010_0000;
		const ITEM_IS_LAST_HARDLINK = 0x0020_0000;
		const ITEM_CLONED = 0x0040_0000;
	}
}

impl EventFlags {
	/// Wraps raw bits coming from the OS without dropping any of them.
	#[must_use]
	pub const fn from_native(bits: u32) -> Self {
		Self::from_bits_retain(bits)
	}
}

impl StreamOptions {
	#[must_use]
	pub const fn from_native(bits: u32) -> Self {
		Self::from_bits_retain(bits)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unknown_event_bits_are_kept() {
		let flags = EventFlags::from_native(0x8000_0100);

		assert!(flags.contains(EventFlags::ITEM_CREATED));
		assert_eq!(flags.bits(), 0x8000_0100);
	}

	#[test]
	fn options_combine() {
		let options = StreamOptions::IGNORE_SELF | StreamOptions::FILE_LEVEL_EVENTS;

		assert_eq!(options.bits(), 0x18);
		assert!(!options.contains(StreamOptions::NO_DEFER));
	}
}
