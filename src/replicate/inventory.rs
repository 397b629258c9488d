//! Local capability and inventory, the two halves of the handshake payload.

use crate::error::{Result, SyncError};
use crate::replicate::protocol::{CapabilityFlags, MAX_KEY_LEN};
use crate::store::BlobStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// Mode
// =============================================================================

/// Replication direction preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Push and pull
    #[default]
    Sync,
    /// Only send blobs to the peer
    Push,
    /// Only accept blobs from the peer
    Pull,
}

impl Mode {
    pub fn push(self) -> bool {
        matches!(self, Mode::Sync | Mode::Push)
    }

    pub fn pull(self) -> bool {
        matches!(self, Mode::Sync | Mode::Pull)
    }
}

impl FromStr for Mode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(Mode::Sync),
            "push" => Ok(Mode::Push),
            "pull" => Ok(Mode::Pull),
            other => Err(SyncError::Config(format!(
                "unknown mode '{}' (expected sync, push or pull)",
                other
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Sync => "sync",
            Mode::Push => "push",
            Mode::Pull => "pull",
        };
        f.write_str(s)
    }
}

// =============================================================================
// KeyFilter
// =============================================================================

type Predicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Predicate restricting which local keys are advertised to the peer.
#[derive(Clone, Default)]
pub struct KeyFilter {
    predicate: Option<Predicate>,
}

impl KeyFilter {
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Some(Arc::new(f)),
        }
    }

    /// Accept keys matching a shell glob, e.g. `2010-*` or `original/*.jpg`.
    pub fn glob(pattern: &str) -> Result<Self> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| SyncError::Config(format!("invalid glob '{}': {}", pattern, e)))?;
        Ok(Self::new(move |key| pattern.matches(key)))
    }

    /// Accept keys containing a match for `pattern`.
    pub fn regex(pattern: &str) -> Result<Self> {
        let re = regex::Regex::new(pattern)
            .map_err(|e| SyncError::Config(format!("invalid regex '{}': {}", pattern, e)))?;
        Ok(Self::new(move |key| re.is_match(key)))
    }

    /// Both filters must accept.
    pub fn and(self, other: KeyFilter) -> Self {
        match (self.predicate, other.predicate) {
            (None, None) => Self::accept_all(),
            (Some(p), None) | (None, Some(p)) => Self { predicate: Some(p) },
            (Some(a), Some(b)) => Self::new(move |key| a(key) && b(key)),
        }
    }

    pub fn accepts(&self, key: &str) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(key))
    }

    pub fn is_accept_all(&self) -> bool {
        self.predicate.is_none()
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_accept_all() {
            f.write_str("KeyFilter(accept-all)")
        } else {
            f.write_str("KeyFilter(custom)")
        }
    }
}

// =============================================================================
// Capability
// =============================================================================

/// What one side allows for a session. Declared locally, never set by the peer.
#[derive(Debug, Clone)]
pub struct Capability {
    pub push: bool,
    pub pull: bool,
    pub filter: KeyFilter,
}

impl Default for Capability {
    fn default() -> Self {
        Self::from_mode(Mode::Sync)
    }
}

impl Capability {
    pub fn from_mode(mode: Mode) -> Self {
        Self {
            push: mode.push(),
            pull: mode.pull(),
            filter: KeyFilter::accept_all(),
        }
    }

    pub fn with_filter(mut self, filter: KeyFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Flags advertised in HELLO.
    pub fn flags(&self) -> CapabilityFlags {
        let mut flags = CapabilityFlags::empty();
        if self.push {
            flags |= CapabilityFlags::PUSH;
        }
        if self.pull {
            flags |= CapabilityFlags::PULL;
        }
        flags
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// The keys one side declares as present, with sizes where known.
///
/// The peer's inventory arrives without sizes; only the local one needs
/// them, to fill in OFFER frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    entries: BTreeMap<String, Option<u64>>,
}

impl Inventory {
    /// List `store` and keep what `filter` accepts.
    pub async fn build(store: &dyn BlobStore, filter: &KeyFilter) -> Result<Self> {
        let listing = store.list().await.map_err(SyncError::StoreList)?;
        let total = listing.len();

        let mut entries = BTreeMap::new();
        for meta in listing {
            if !filter.accepts(&meta.key) {
                continue;
            }
            if meta.key.len() > MAX_KEY_LEN {
                return Err(SyncError::Config(format!(
                    "key of {} bytes exceeds the {} byte limit",
                    meta.key.len(),
                    MAX_KEY_LEN
                )));
            }
            entries.insert(meta.key, Some(meta.size));
        }

        tracing::debug!(
            "Built inventory: {} of {} keys pass the filter",
            entries.len(),
            total
        );
        Ok(Self { entries })
    }

    /// Inventory received from the peer.
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: keys.into_iter().map(|k| (k.into(), None)).collect(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn size_of(&self, key: &str) -> Option<u64> {
        self.entries.get(key).copied().flatten()
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn to_keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Keys present here but not in `other`.
    pub fn difference<'a>(&'a self, other: &'a Inventory) -> impl Iterator<Item = &'a String> {
        self.entries.keys().filter(move |k| !other.contains(k))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
