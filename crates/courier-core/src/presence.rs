//! Presence tracking.
//!
//! Online state is derived from hub membership: a caller is online exactly
//! while the hub holds a live connection for it. This module keeps the part
//! the hub does not, namely when each caller was last seen, and builds the
//! `presence_update` envelopes the hub fans out on each transition.

use crate::connection::CallerId;
use chrono::{DateTime, Utc};
use courier_protocol::OutboundMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Presence of a single caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: CallerId,
    pub online: bool,
    /// Time of the last online or offline transition, if any was observed.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Last-seen book kept inside the hub state.
#[derive(Debug)]
pub(crate) struct PresenceBook {
    enabled: bool,
    last_seen: HashMap<CallerId, DateTime<Utc>>,
}

impl PresenceBook {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_seen: HashMap::new(),
        }
    }

    /// Record a transition and build the announcement for the other callers.
    ///
    /// Returns `None` when announcements are disabled. The timestamp is
    /// recorded either way.
    pub(crate) fn transition(&mut self, caller: &CallerId, online: bool) -> Option<OutboundMessage> {
        let now = Utc::now();
        self.last_seen.insert(caller.clone(), now);

        if !self.enabled {
            return None;
        }
        debug!(caller = %caller, online, "Presence changed");
        Some(OutboundMessage::presence_update(caller.as_str(), online, now))
    }

    pub(crate) fn last_seen(&self, caller: &CallerId) -> Option<DateTime<Utc>> {
        self.last_seen.get(caller).copied()
    }

    pub(crate) fn record(&self, caller: &CallerId, online: bool) -> PresenceRecord {
        PresenceRecord {
            user_id: caller.clone(),
            online,
            last_seen: self.last_seen(caller),
        }
    }
}
