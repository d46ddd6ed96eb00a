//! Namespace registry.
//!
//! The only shared mutable state on the server. All mutation goes through
//! [`NamespaceRegistry::allocate`], [`NamespaceRegistry::join`] and
//! [`NamespaceRegistry::leave`], serialised by one mutex. A namespace is
//! reclaimed as soon as its last member leaves. A freshly allocated namespace
//! that nobody joins is reclaimed by [`NamespaceRegistry::sweep_unjoined`]
//! once it is older than the grace period.

use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    channel::{ChannelHandle, SessionId},
    error::RegistryError,
};

pub const DEFAULT_NAMESPACE_LEN: usize = 7;

const NAMESPACE_ALPHABET: [char; 62] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
    'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j',
    'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1',
    '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Opaque namespace identifier. Knowing it is enough to join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(String);

impl NamespaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel path clients connect to, e.g. `/abc123`.
    pub fn path(&self) -> String {
        format!("/{}", self.0)
    }

    /// Parses a channel path back into an id. The root path has none.
    pub fn from_path(path: &str) -> Option<Self> {
        let id = path.strip_prefix('/').unwrap_or(path);
        if id.is_empty() {
            None
        } else {
            Some(Self::new(id))
        }
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for NamespaceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// What became of a namespace after one of its members left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    Remaining(usize),
    Reclaimed,
    NotMember,
}

#[derive(Debug)]
struct Namespace {
    members: HashMap<SessionId, ChannelHandle>,
    allocated_at: Instant,
    joined: bool,
}

impl Namespace {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            allocated_at: Instant::now(),
            joined: false,
        }
    }
}

#[derive(Debug)]
pub struct NamespaceRegistry {
    namespaces: Mutex<HashMap<NamespaceId, Namespace>>,
    id_len: usize,
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE_LEN)
    }
}

impl NamespaceRegistry {
    pub fn new(id_len: usize) -> Self {
        Self {
            namespaces: Mutex::new(HashMap::new()),
            id_len,
        }
    }

    /// Creates a namespace with no members under a fresh, unused id.
    pub async fn allocate(&self) -> NamespaceId {
        let len = self.id_len;
        let mut namespaces = self.namespaces.lock().await;
        let id = loop {
            let candidate = NamespaceId(nanoid::nanoid!(len, &NAMESPACE_ALPHABET));
            if !namespaces.contains_key(&candidate) {
                break candidate;
            }
            debug!(namespace = %candidate, "namespace id collision, retrying");
        };

        namespaces.insert(id.clone(), Namespace::new());
        info!(namespace = %id, active = namespaces.len(), "namespace allocated");
        id
    }

    /// Attaches a channel. Returns the member count after joining.
    pub async fn join(
        &self,
        namespace: &str,
        channel: ChannelHandle,
    ) -> Result<usize, RegistryError> {
        let mut namespaces = self.namespaces.lock().await;
        let entry = namespaces
            .get_mut(namespace)
            .ok_or_else(|| unknown(namespace))?;

        entry.joined = true;
        entry.members.insert(channel.sid().to_string(), channel);
        Ok(entry.members.len())
    }

    /// Detaches a channel, reclaiming the namespace when it empties.
    pub async fn leave(&self, namespace: &str, sid: &str) -> Departure {
        let mut namespaces = self.namespaces.lock().await;
        let Some(entry) = namespaces.get_mut(namespace) else {
            return Departure::NotMember;
        };
        if entry.members.remove(sid).is_none() {
            return Departure::NotMember;
        }

        let remaining = entry.members.len();
        if remaining > 0 {
            return Departure::Remaining(remaining);
        }

        namespaces.remove(namespace);
        info!(namespace, active = namespaces.len(), "namespace reclaimed");
        Departure::Reclaimed
    }

    /// Reclaims namespaces nobody joined within `grace` of being allocated.
    /// Returns how many were removed.
    pub async fn sweep_unjoined(&self, grace: Duration) -> usize {
        let mut namespaces = self.namespaces.lock().await;
        let before = namespaces.len();
        namespaces.retain(|id, entry| {
            let keep = entry.joined || entry.allocated_at.elapsed() < grace;
            if !keep {
                debug!(namespace = %id, "reclaiming unjoined namespace");
            }
            keep
        });

        let swept = before - namespaces.len();
        if swept > 0 {
            info!(swept, active = namespaces.len(), "unjoined namespaces reclaimed");
        }
        swept
    }

    pub async fn contains(&self, namespace: &str) -> bool {
        self.namespaces.lock().await.contains_key(namespace)
    }

    pub async fn members(&self, namespace: &str) -> Result<Vec<ChannelHandle>, RegistryError> {
        let namespaces = self.namespaces.lock().await;
        let entry = namespaces.get(namespace).ok_or_else(|| unknown(namespace))?;
        Ok(entry.members.values().cloned().collect())
    }

    /// Every member except `sid`.
    pub async fn peers(
        &self,
        namespace: &str,
        sid: &str,
    ) -> Result<Vec<ChannelHandle>, RegistryError> {
        let mut members = self.members(namespace).await?;
        members.retain(|member| member.sid() != sid);
        Ok(members)
    }

    pub async fn len(&self) -> usize {
        self.namespaces.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Asks every member of every namespace to disconnect. Each channel
    /// leaves through its normal teardown path.
    pub async fn disconnect_all(&self) {
        let channels: Vec<ChannelHandle> = {
            let namespaces = self.namespaces.lock().await;
            namespaces
                .values()
                .flat_map(|entry| entry.members.values().cloned())
                .collect()
        };

        for channel in channels {
            channel.disconnect().await;
        }
    }
}

fn unknown(namespace: &str) -> RegistryError {
    RegistryError::UnknownNamespace {
        namespace: namespace.to_string(),
    }
}
