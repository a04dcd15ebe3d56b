//! Single-session ownership
//!
//! At most one connection owns the mutation rights at any time. The slot
//! is plain data owned by the synchronizer task; every decision about
//! granting, takeover and freshness happens there, so no locking is
//! needed here.

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

pub type ConnId = u64;

/// The current owner: connection plus its freshness token pair
#[derive(Debug, Clone)]
pub struct OwnerSlot {
    pub conn_id: ConnId,
    pub session_id: String,
    pub owner_token: String,
    pub since: String,
}

fn fresh_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Default)]
pub struct SessionHub {
    slot: Option<OwnerSlot>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<&OwnerSlot> {
        self.slot.as_ref()
    }

    pub fn is_owner(&self, conn_id: ConnId) -> bool {
        self.slot.as_ref().is_some_and(|s| s.conn_id == conn_id)
    }

    /// Grant ownership if the slot is empty; returns the new slot on grant,
    /// `None` when someone else already owns the session.
    pub fn try_grant(&mut self, conn_id: ConnId) -> Option<OwnerSlot> {
        if self.slot.is_some() {
            return None;
        }
        let slot = OwnerSlot {
            conn_id,
            session_id: fresh_token(),
            owner_token: fresh_token(),
            since: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        self.slot = Some(slot.clone());
        Some(slot)
    }

    /// Install `conn_id` as the owner with a fresh token pair, returning the
    /// displaced owner's connection id (if any) and the new slot. A takeover
    /// by the current owner just rotates its tokens.
    pub fn takeover(&mut self, conn_id: ConnId) -> (Option<ConnId>, OwnerSlot) {
        let old_conn = self
            .slot
            .as_ref()
            .map(|s| s.conn_id)
            .filter(|old| *old != conn_id);
        let slot = OwnerSlot {
            conn_id,
            session_id: fresh_token(),
            owner_token: fresh_token(),
            since: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        self.slot = Some(slot.clone());
        (old_conn, slot)
    }

    /// Freshness gate: a frame is fresh iff it carries exactly the current
    /// `(session_id, owner_token)` pair.
    pub fn is_fresh(&self, session_id: Option<&str>, owner_token: Option<&str>) -> bool {
        match &self.slot {
            Some(slot) => {
                session_id == Some(slot.session_id.as_str())
                    && owner_token == Some(slot.owner_token.as_str())
            }
            None => false,
        }
    }

    /// Clear the slot when its owner disconnects; true if it was the owner
    pub fn release_if_owner(&mut self, conn_id: ConnId) -> bool {
        if self.is_owner(conn_id) {
            self.slot = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_connection_gets_the_slot() {
        let mut hub = SessionHub::new();
        let slot = hub.try_grant(1).unwrap();
        assert!(hub.is_owner(1));
        assert!(hub.try_grant(2).is_none());
        assert!(hub.is_fresh(Some(&slot.session_id), Some(&slot.owner_token)));
    }

    #[test]
    fn takeover_rotates_tokens_and_reports_old_owner() {
        let mut hub = SessionHub::new();
        let first = hub.try_grant(1).unwrap();
        let (old, second) = hub.takeover(2);
        assert_eq!(old, Some(1));
        assert!(hub.is_owner(2));
        assert!(!hub.is_owner(1));
        assert_ne!(first.session_id, second.session_id);
        assert_ne!(first.owner_token, second.owner_token);
        // The displaced pair is stale now.
        assert!(!hub.is_fresh(Some(&first.session_id), Some(&first.owner_token)));
        assert!(hub.is_fresh(Some(&second.session_id), Some(&second.owner_token)));
    }

    #[test]
    fn self_takeover_rotates_without_displacing() {
        let mut hub = SessionHub::new();
        let first = hub.try_grant(7).unwrap();
        let (old, rotated) = hub.takeover(7);
        assert_eq!(old, None);
        assert!(hub.is_owner(7));
        assert_ne!(first.owner_token, rotated.owner_token);
    }

    #[test]
    fn release_only_clears_for_the_owner() {
        let mut hub = SessionHub::new();
        hub.try_grant(1).unwrap();
        assert!(!hub.release_if_owner(2));
        assert!(hub.is_owner(1));
        assert!(hub.release_if_owner(1));
        assert!(hub.owner().is_none());
        // Slot is free again
        assert!(hub.try_grant(2).is_some());
    }

    #[test]
    fn freshness_requires_both_tokens() {
        let mut hub = SessionHub::new();
        let slot = hub.try_grant(1).unwrap();
        assert!(!hub.is_fresh(Some(&slot.session_id), None));
        assert!(!hub.is_fresh(None, Some(&slot.owner_token)));
        assert!(!hub.is_fresh(Some("x"), Some(&slot.owner_token)));
    }
}
