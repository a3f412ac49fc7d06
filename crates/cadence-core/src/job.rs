//! Job identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque job identifier, the only correlation key between a submission and
/// its outcome. Cheap to clone. Serializes as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(Arc<str>);

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(JobId::from)
    }
}

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Mints job ids unique to one broker instance: `<tag>-<seq>`.
///
/// The tag is random so ids from two brokers in the same process do not
/// collide in logs. The sequence never repeats for the minter's lifetime.
#[derive(Debug)]
pub struct JobIdMinter {
    tag: String,
    next: AtomicU64,
}

impl JobIdMinter {
    pub fn new() -> Self {
        Self::with_tag(hex::encode(rand::random::<[u8; 4]>()))
    }

    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn mint(&self) -> JobId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        JobId::from(format!("{}-{seq}", self.tag))
    }
}

impl Default for JobIdMinter {
    fn default() -> Self {
        Self::new()
    }
}
