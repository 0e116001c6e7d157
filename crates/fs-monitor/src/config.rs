use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::flags::StreamOptions;

const TEN_MILLIS: Duration = Duration::from_millis(10);

/// Defaults applied to streams scheduled without explicit latency and options,
/// see [`Monitor::schedule_with_defaults`](crate::Monitor::schedule_with_defaults) and
/// [`Observer`](crate::Observer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// How long the backend may hold back events to coalesce them in a single batch.
	pub latency: Duration,
	pub options: StreamOptions,
	pub observer_thread_name: String,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			latency: TEN_MILLIS,
			options: StreamOptions::NO_DEFER,
			observer_thread_name: "fs-monitor-observer".to_string(),
		}
	}
}

impl Config {
	#[must_use]
	pub const fn with_latency(mut self, latency: Duration) -> Self {
		self.latency = latency;
		self
	}

	#[must_use]
	pub const fn with_options(mut self, options: StreamOptions) -> Self {
		self.options = options;
		self
	}

	#[must_use]
	pub fn with_observer_thread_name(mut self, name: impl Into<String>) -> Self {
		self.observer_thread_name = name.into();
		self
	}
}
