use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one logical consumer thread and its loop.
///
/// The monitor never interprets it, it's only a registry key, so callers may build it from any
/// [`Uuid`] they already track or just get a random one with [`ThreadToken::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ThreadToken(Uuid);

/// Identifies one logical watch registration, must be unique among the scheduled streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct StreamToken(Uuid);

macro_rules! impl_token {
	($token:ident) => {
		impl $token {
			#[must_use]
			pub fn new() -> Self {
				Self(Uuid::new_v4())
			}

			#[must_use]
			pub const fn as_uuid(&self) -> &Uuid {
				&self.0
			}
		}

		impl Default for $token {
			fn default() -> Self {
				Self::new()
			}
		}

		impl From<Uuid> for $token {
			fn from(uuid: Uuid) -> Self {
				Self(uuid)
			}
		}

		impl From<$token> for Uuid {
			fn from(token: $token) -> Self {
				token.0
			}
		}

		impl fmt::Display for $token {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				self.0.fmt(f)
			}
		}
	};
}

impl_token!(ThreadToken);
impl_token!(StreamToken);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tokens_keep_their_uuid() {
		let uuid = Uuid::new_v4();

		assert_eq!(ThreadToken::from(uuid).as_uuid(), &uuid);
		assert_eq!(Uuid::from(StreamToken::from(uuid)), uuid);
		assert_eq!(StreamToken::from(uuid).to_string(), uuid.to_string());
	}

	#[test]
	fn new_tokens_are_unique() {
		assert_ne!(ThreadToken::new(), ThreadToken::new());
		assert_ne!(StreamToken::new(), StreamToken::new());
	}
}
