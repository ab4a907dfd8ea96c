//! ACL evaluation (spec §4.4).
//!
//! Evaluation order per `(store, peer_id, operation)`:
//! 1. Exact `(store, peer_id)` policy, if not expired.
//! 2. Wildcard `(store, "*")` policy, if not expired.
//! 3. No policies configured for the store at all: local peer is
//!    read-write, everyone else is read-only.
//! 4. Otherwise deny with `"No matching policy — deny by default"`.

use std::collections::HashMap;
use std::sync::RwLock;

use hyperforge_common::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclMode {
    ReadWrite,
    ReadOnly,
    NoAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub decision: Decision,
    pub mode: Option<AclMode>,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct Policy {
    mode: AclMode,
    expires_at: Option<u64>,
}

impl Policy {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

pub const WILDCARD_PEER: &str = "*";

/// Per-process ACL owner: constructed with explicit configuration, not a
/// hidden global, so tests can inject fresh instances (spec §9
/// "Singletons").
pub struct AccessControl {
    local_peer_id: String,
    // (store, peer_id) -> policy
    policies: RwLock<HashMap<(String, String), Policy>>,
}

impl AccessControl {
    pub fn new(local_peer_id: impl Into<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            policies: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_policy(&self, store: &str, peer_id: &str, mode: AclMode, expires_at: Option<u64>) {
        self.policies.write().unwrap().insert(
            (store.to_string(), peer_id.to_string()),
            Policy { mode, expires_at },
        );
    }

    fn has_any_policy_for_store(&self, store: &str) -> bool {
        self.policies
            .read()
            .unwrap()
            .keys()
            .any(|(s, _)| s == store)
    }

    /// Pure function of the current policy set (spec L7): same inputs,
    /// same output, every time.
    pub fn check(&self, store: &str, peer_id: &str, op: Operation) -> CheckResult {
        let now = now_ms();
        let guard = self.policies.read().unwrap();

        let exact = guard.get(&(store.to_string(), peer_id.to_string()));
        let mode = if let Some(p) = exact.filter(|p| !p.is_expired(now)) {
            Some(p.mode)
        } else if let Some(p) = guard
            .get(&(store.to_string(), WILDCARD_PEER.to_string()))
            .filter(|p| !p.is_expired(now))
        {
            Some(p.mode)
        } else if !self.has_any_policy_for_store(store) {
            Some(if peer_id == self.local_peer_id {
                AclMode::ReadWrite
            } else {
                AclMode::ReadOnly
            })
        } else {
            None
        };
        drop(guard);

        let Some(mode) = mode else {
            return CheckResult {
                decision: Decision::Deny,
                mode: None,
                reason: "No matching policy — deny by default".to_string(),
            };
        };

        let allowed = match (op, mode) {
            (Operation::Write, AclMode::ReadWrite) => true,
            (Operation::Write, _) => false,
            (Operation::Read, AclMode::NoAccess) => false,
            (Operation::Read, _) => true,
        };

        CheckResult {
            decision: if allowed { Decision::Allow } else { Decision::Deny },
            mode: Some(mode),
            reason: if allowed {
                "allowed by policy".to_string()
            } else {
                format!("operation not permitted under mode {mode:?}")
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_deny_for_remote_write_no_policies() {
        let acl = AccessControl::new("local");
        let r = acl.check("store-a", "remote", Operation::Write);
        assert_eq!(r.decision, Decision::Deny);
        let r = acl.check("store-a", "remote", Operation::Read);
        assert_eq!(r.decision, Decision::Allow);
        let r = acl.check("store-a", "local", Operation::Write);
        assert_eq!(r.decision, Decision::Allow);
    }

    #[test]
    fn exact_policy_beats_wildcard() {
        let acl = AccessControl::new("local");
        acl.set_policy("store-a", WILDCARD_PEER, AclMode::NoAccess, None);
        acl.set_policy("store-a", "peer-1", AclMode::ReadWrite, None);
        assert_eq!(
            acl.check("store-a", "peer-1", Operation::Write).decision,
            Decision::Allow
        );
        assert_eq!(
            acl.check("store-a", "peer-2", Operation::Read).decision,
            Decision::Deny
        );
    }

    #[test]
    fn expired_policy_is_ignored_and_falls_through() {
        let acl = AccessControl::new("local");
        acl.set_policy("store-a", "peer-1", AclMode::ReadWrite, Some(1));
        let r = acl.check("store-a", "peer-1", Operation::Write);
        // expired exact policy + no wildcard + a policy exists for the
        // store (just expired) => deny by default, not the zero-policy
        // local-peer carve-out.
        assert_eq!(r.decision, Decision::Deny);
        assert_eq!(r.reason, "No matching policy — deny by default");
    }

    #[test]
    fn l7_acl_is_deterministic() {
        let acl = AccessControl::new("local");
        acl.set_policy("s", "p", AclMode::ReadOnly, None);
        let a = acl.check("s", "p", Operation::Read);
        let b = acl.check("s", "p", Operation::Read);
        assert_eq!(a.decision, b.decision);
        assert_eq!(a.reason, b.reason);
    }
}
