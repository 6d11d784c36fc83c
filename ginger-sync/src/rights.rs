//! Authorization gate consulted before every server verb.
//!
//! ```text
//!   check_rights(user, keyPath, right) ──false──► Authorization error
//!            │ true
//!            ▼
//!        RemoteStore op
//!            │ ok
//!            ▼
//!   create/put/del/add/remove side effect ──err──► RightsUpdateFailed
//! ```
//!
//! [`RuleGate`] evaluates `(right, pattern, predicate)` rules and keeps an
//! ownership table in a [`KvBackend`]: whoever creates a document owns its
//! key path and everything below it.

use crate::storage::KvBackend;
use async_trait::async_trait;
use ginger_core::{KeyPath, Result};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Right {
    Create,
    Get,
    Put,
    Del,
}

impl Right {
    pub fn as_str(&self) -> &'static str {
        match self {
            Right::Create => "create",
            Right::Get => "get",
            Right::Put => "put",
            Right::Del => "del",
        }
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait RightsGate: Send + Sync {
    async fn check_rights(&self, user_id: &str, key_path: &KeyPath, right: Right) -> Result<bool>;

    /// Called after a document was created at `key_path` (bucket plus new id).
    async fn create(&self, _user_id: &str, _key_path: &KeyPath) -> Result<()> {
        Ok(())
    }

    async fn put(&self, _user_id: &str, _key_path: &KeyPath) -> Result<()> {
        Ok(())
    }

    async fn del(&self, _user_id: &str, _key_path: &KeyPath) -> Result<()> {
        Ok(())
    }

    async fn add(&self, _user_id: &str, _key_path: &KeyPath, _items_key_path: &KeyPath, _item_ids: &[String]) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _user_id: &str, _key_path: &KeyPath, _items_key_path: &KeyPath, _item_ids: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Grants everything. Used by the stock server binary and most tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl RightsGate for AllowAll {
    async fn check_rights(&self, _user_id: &str, _key_path: &KeyPath, _right: Right) -> Result<bool> {
        Ok(true)
    }
}

/// Key path pattern. `*` matches one segment, a trailing `**` matches any
/// remainder including none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPathPattern {
    segments: Vec<String>,
}

impl KeyPathPattern {
    /// Parse `a/*/b` or `a/**`. `*` matches one segment, `**` the rest.
    pub fn parse(pattern: &str) -> Self {
        Self {
            segments: pattern.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect(),
        }
    }

    /// Whether `key_path` is covered by this pattern.
    pub fn matches(&self, key_path: &KeyPath) -> bool {
        let path = key_path.segments();
        for (i, segment) in self.segments.iter().enumerate() {
            match segment.as_str() {
                "**" => return true,
                "*" if i < path.len() => {}
                literal if i < path.len() && path[i] == literal => {}
                _ => return false,
            }
        }
        self.segments.len() == path.len()
    }
}

pub type RightsPredicate = Arc<dyn Fn(&str, &KeyPath) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum Predicate {
    Anyone,
    /// The user created the document at the key path or one of its ancestors.
    Owner,
    Users(Vec<String>),
    Custom(RightsPredicate),
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Anyone => f.write_str("Anyone"),
            Predicate::Owner => f.write_str("Owner"),
            Predicate::Users(users) => f.debug_tuple("Users").field(users).finish(),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RightsRule {
    pub right: Right,
    pub pattern: KeyPathPattern,
    pub predicate: Predicate,
}

impl RightsRule {
    pub fn new(right: Right, pattern: &str, predicate: Predicate) -> Self {
        Self { right, pattern: KeyPathPattern::parse(pattern), predicate }
    }
}

const OWNER_PREFIX: &str = "r/";

/// Rule-based gate. A request is allowed when any rule for its right
/// matches the key path and its predicate holds; otherwise it is denied.
pub struct RuleGate {
    rules: Vec<RightsRule>,
    owners: Arc<dyn KvBackend>,
}

impl RuleGate {
    /// Gate with no rules, keeping owners in `owners`. Denies everything until
    /// rules are added.
    pub fn new(owners: Arc<dyn KvBackend>) -> Self {
        Self { rules: Vec::new(), owners }
    }

    pub fn with_rule(mut self, rule: RightsRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Grant `right` on `pattern` to users satisfying `predicate`.
    pub fn allow(self, right: Right, pattern: &str, predicate: Predicate) -> Self {
        self.with_rule(RightsRule::new(right, pattern, predicate))
    }

    /// Anyone may create and read; only the creator of a document may change
    /// or delete it and the containers below it.
    pub fn owner_policy(owners: Arc<dyn KvBackend>) -> Self {
        Self::new(owners)
            .allow(Right::Create, "**", Predicate::Anyone)
            .allow(Right::Get, "**", Predicate::Anyone)
            .allow(Right::Put, "**", Predicate::Owner)
            .allow(Right::Del, "**", Predicate::Owner)
    }

    fn owner_key(key_path: &KeyPath) -> Vec<u8> {
        format!("{}{}", OWNER_PREFIX, key_path.room_key()).into_bytes()
    }

    /// Recorded creator of `key_path`, if any.
    pub fn owner_of(&self, key_path: &KeyPath) -> Result<Option<String>> {
        Ok(self
            .owners
            .get(&Self::owner_key(key_path))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// True when `user_id` owns `key_path` or any ancestor document.
    fn owns(&self, user_id: &str, key_path: &KeyPath) -> Result<bool> {
        let mut current = Some(key_path.clone());
        while let Some(kp) = current {
            if kp.is_document() && self.owner_of(&kp)?.as_deref() == Some(user_id) {
                return Ok(true);
            }
            current = kp.parent();
        }
        Ok(false)
    }

    fn holds(&self, predicate: &Predicate, user_id: &str, key_path: &KeyPath) -> Result<bool> {
        Ok(match predicate {
            Predicate::Anyone => true,
            Predicate::Owner => self.owns(user_id, key_path)?,
            Predicate::Users(users) => users.iter().any(|u| u == user_id),
            Predicate::Custom(f) => f(user_id, key_path),
        })
    }
}

#[async_trait]
impl RightsGate for RuleGate {
    async fn check_rights(&self, user_id: &str, key_path: &KeyPath, right: Right) -> Result<bool> {
        for rule in self.rules.iter().filter(|r| r.right == right && r.pattern.matches(key_path)) {
            if self.holds(&rule.predicate, user_id, key_path)? {
                return Ok(true);
            }
        }
        log::debug!("denied {} on {} to {}", right, key_path, user_id);
        Ok(false)
    }

    async fn create(&self, user_id: &str, key_path: &KeyPath) -> Result<()> {
        self.owners.put(&Self::owner_key(key_path), user_id.as_bytes())
    }

    async fn del(&self, _user_id: &str, key_path: &KeyPath) -> Result<()> {
        self.owners.delete(&Self::owner_key(key_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn gate() -> RuleGate {
        RuleGate::new(Arc::new(MemoryBackend::new()))
            .allow(Right::Create, "animals", Predicate::Anyone)
            .allow(Right::Get, "**", Predicate::Anyone)
            .allow(Right::Put, "animals/*", Predicate::Owner)
            .allow(Right::Del, "animals/*", Predicate::Users(vec!["admin".into()]))
    }

    #[test]
    fn test_pattern_matching() {
        let p = KeyPathPattern::parse("zoo/*/animals");
        assert!(p.matches(&KeyPath::parse("zoo/1/animals")));
        assert!(!p.matches(&KeyPath::parse("zoo/1/animals/2")));
        assert!(!p.matches(&KeyPath::parse("zoo/1")));
        let q = KeyPathPattern::parse("zoo/**");
        assert!(q.matches(&KeyPath::parse("zoo")));
        assert!(q.matches(&KeyPath::parse("zoo/1/animals/2")));
    }

    #[tokio::test]
    async fn test_creator_becomes_owner() {
        let gate = gate();
        let tiger = KeyPath::parse("animals/t1");
        assert!(gate.check_rights("alice", &KeyPath::parse("animals"), Right::Create).await.unwrap());
        gate.create("alice", &tiger).await.unwrap();

        assert!(gate.check_rights("alice", &tiger, Right::Put).await.unwrap());
        assert!(!gate.check_rights("bob", &tiger, Right::Put).await.unwrap());
        assert!(!gate.check_rights("alice", &tiger, Right::Del).await.unwrap());
        assert!(gate.check_rights("admin", &tiger, Right::Del).await.unwrap());

        gate.del("admin", &tiger).await.unwrap();
        assert_eq!(gate.owner_of(&tiger).unwrap(), None);
    }

    #[tokio::test]
    async fn test_ownership_covers_children() {
        let gate = RuleGate::new(Arc::new(MemoryBackend::new())).allow(Right::Put, "zoo/*/animals", Predicate::Owner);
        gate.create("alice", &KeyPath::parse("zoo/1")).await.unwrap();
        assert!(gate.check_rights("alice", &KeyPath::parse("zoo/1/animals"), Right::Put).await.unwrap());
        assert!(!gate.check_rights("alice", &KeyPath::parse("zoo/2/animals"), Right::Put).await.unwrap());
    }

    #[tokio::test]
    async fn test_owner_policy() {
        let gate = RuleGate::owner_policy(Arc::new(MemoryBackend::new()));
        let zoo = KeyPath::parse("zoo/1");
        assert!(gate.check_rights("bob", &KeyPath::parse("zoo"), Right::Create).await.unwrap());
        gate.create("alice", &zoo).await.unwrap();

        let animals = KeyPath::parse("zoo/1/animals");
        assert!(gate.check_rights("bob", &animals, Right::Get).await.unwrap());
        assert!(gate.check_rights("alice", &animals, Right::Put).await.unwrap());
        assert!(gate.check_rights("alice", &animals, Right::Del).await.unwrap());
        assert!(!gate.check_rights("bob", &animals, Right::Put).await.unwrap());
        assert!(!gate.check_rights("bob", &zoo, Right::Del).await.unwrap());
    }

    #[tokio::test]
    async fn test_unmatched_requests_are_denied() {
        let gate = gate();
        assert!(!gate.check_rights("alice", &KeyPath::parse("plants"), Right::Create).await.unwrap());
    }
}
