use std::io;

use thiserror::Error;

use super::token::{StreamToken, ThreadToken};

/// Whatever a handler wants to report as a failure, it ends the handler's loop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by the native watch facility, keeping its error code around.
#[derive(Debug, Error)]
#[error("native watch resource error <code={code}>: {context}")]
pub struct NativeError {
	pub code: i32,
	pub context: String,
}

impl NativeError {
	/// Used when the native facility failed without giving us an error code.
	pub const UNKNOWN_CODE: i32 = -1;

	pub fn new(code: i32, context: impl Into<String>) -> Self {
		Self {
			code,
			context: context.into(),
		}
	}

	pub fn unknown(context: impl Into<String>) -> Self {
		Self::new(Self::UNKNOWN_CODE, context)
	}
}

impl From<io::Error> for NativeError {
	fn from(e: io::Error) -> Self {
		Self::new(e.raw_os_error().unwrap_or(Self::UNKNOWN_CODE), e.to_string())
	}
}

impl From<notify::Error> for NativeError {
	fn from(e: notify::Error) -> Self {
		let context = e.to_string();

		match e.kind {
			notify::ErrorKind::Io(io_err) => Self::new(
				io_err.raw_os_error().unwrap_or(Self::UNKNOWN_CODE),
				context,
			),
			_ => Self::unknown(context),
		}
	}
}

#[derive(Debug, Error)]
pub enum ScheduleError {
	#[error("stream already scheduled <stream='{0}'>")]
	DuplicateStream(StreamToken),
	#[error("tried to schedule a stream without any paths to watch")]
	EmptyPathSet,
	#[error(transparent)]
	NativeResource(#[from] NativeError),
}

#[derive(Debug, Error)]
pub enum UnscheduleError {
	#[error("stream not found <stream='{0}'>")]
	UnknownStream(StreamToken),
}

#[derive(Debug, Error)]
pub enum LoopError {
	#[error("thread is already running a loop <thread='{0}'>")]
	AlreadyLooping(ThreadToken),
	#[error("handler failed <stream='{stream}'>: {source}")]
	HandlerFailure {
		stream: StreamToken,
		#[source]
		source: HandlerError,
	},
	#[error("failed to hand off event batch to its loop <stream='{stream}'>: {reason}")]
	MarshalFailure { stream: StreamToken, reason: String },
}

impl LoopError {
	/// Failures that came from a stream's dispatch rather than from calling `run_loop` wrong.
	#[must_use]
	pub const fn stream(&self) -> Option<StreamToken> {
		match self {
			Self::AlreadyLooping(_) => None,
			Self::HandlerFailure { stream, .. } | Self::MarshalFailure { stream, .. } => {
				Some(*stream)
			}
		}
	}
}
