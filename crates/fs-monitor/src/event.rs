use std::{path::PathBuf, slice, vec};

use serde::{Deserialize, Serialize};

use super::{error::HandlerError, flags::EventFlags};

pub type HandlerResult = Result<(), HandlerError>;

/// Caller supplied handler, always invoked on the thread running the owning loop.
pub(crate) type BoxedHandler = Box<dyn FnMut(&EventBatch) -> HandlerResult + Send>;

/// A single changed path along with the bits the OS reported for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
	pub path: PathBuf,
	pub flags: EventFlags,
}

impl Event {
	pub fn new(path: impl Into<PathBuf>, flags: EventFlags) -> Self {
		Self {
			path: path.into(),
			flags,
		}
	}
}

/// Events delivered by one native callback invocation, in the order the OS produced them.
///
/// A batch is handed to the handler as a whole, it's never split or merged with another one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventBatch(Vec<Event>);

impl EventBatch {
	#[must_use]
	pub const fn new(events: Vec<Event>) -> Self {
		Self(events)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> slice::Iter<'_, Event> {
		self.0.iter()
	}

	#[must_use]
	pub fn as_slice(&self) -> &[Event] {
		&self.0
	}

	#[must_use]
	pub fn into_inner(self) -> Vec<Event> {
		self.0
	}
}

impl From<Vec<Event>> for EventBatch {
	fn from(events: Vec<Event>) -> Self {
		Self(events)
	}
}

impl<P: Into<PathBuf>> FromIterator<(P, EventFlags)> for EventBatch {
	fn from_iter<I: IntoIterator<Item = (P, EventFlags)>>(iter: I) -> Self {
		Self(
			iter.into_iter()
				.map(|(path, flags)| Event::new(path, flags))
				.collect(),
		)
	}
}

impl FromIterator<Event> for EventBatch {
	fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl IntoIterator for EventBatch {
	type Item = Event;
	type IntoIter = vec::IntoIter<Event>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

impl<'a> IntoIterator for &'a EventBatch {
	type Item = &'a Event;
	type IntoIter = slice::Iter<'a, Event>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.iter()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn batch_keeps_delivery_order() {
		let batch = [
			("/tmp/watch/b.txt", EventFlags::ITEM_CREATED),
			("/tmp/watch/a.txt", EventFlags::ITEM_REMOVED),
		]
		.into_iter()
		.collect::<EventBatch>();

		let paths = batch
			.iter()
			.map(|event| event.path.to_string_lossy().into_owned())
			.collect::<Vec<_>>();

		assert_eq!(paths, ["/tmp/watch/b.txt", "/tmp/watch/a.txt"]);
		assert_eq!(batch.as_slice()[1].flags, EventFlags::ITEM_REMOVED);
	}
}
