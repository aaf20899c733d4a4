//! Port registry: the configured local forwarding rules

use crate::accepter::AccepterBinding;
use crate::error::{ForwardError, ForwardResult};
use portmux_transport::ExecContext;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Key of a registered rule
///
/// Rule ids (the human-readable names) may repeat; keys never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule-{}", self.0)
    }
}

/// A local forwarding rule: listen on `listen`, forward to `service`
#[derive(Debug, Clone)]
pub struct PortRule {
    id: String,
    listen: String,
    service: String,
    context: ExecContext,
}

impl PortRule {
    /// Build a rule owning copies of every string
    ///
    /// Fails with [`ForwardError::OutOfMemory`] if any copy cannot be
    /// allocated; the copies made so far are dropped.
    pub fn new(context: ExecContext, listen: &str, service: &str, id: &str) -> ForwardResult<Self> {
        Ok(Self {
            listen: dup_str(listen)?,
            service: dup_str(service)?,
            id: dup_str(id)?,
            context,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn context(&self) -> &ExecContext {
        &self.context
    }
}

/// Copy a string, reporting allocation failure instead of aborting
pub(crate) fn dup_str(s: &str) -> ForwardResult<String> {
    let mut copy = String::new();
    copy.try_reserve_exact(s.len())
        .map_err(|_| ForwardError::OutOfMemory)?;
    copy.push_str(s);
    Ok(copy)
}

/// Registered rules, most recent first, plus their live listeners
#[derive(Debug, Default)]
pub struct PortRegistry {
    rules: VecDeque<(RuleId, PortRule)>,
    bindings: HashMap<RuleId, AccepterBinding>,
    next_key: u64,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a rule
    pub fn insert(&mut self, rule: PortRule) -> ForwardResult<RuleId> {
        self.rules
            .try_reserve(1)
            .map_err(|_| ForwardError::OutOfMemory)?;

        self.next_key += 1;
        let key = RuleId(self.next_key);
        self.rules.push_front((key, rule));
        Ok(key)
    }

    pub fn get(&self, key: RuleId) -> Option<&PortRule> {
        self.rules
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, rule)| rule)
    }

    /// Rules in activation order
    pub fn iter(&self) -> impl Iterator<Item = (RuleId, &PortRule)> {
        self.rules.iter().map(|(key, rule)| (*key, rule))
    }

    pub fn keys(&self) -> Vec<RuleId> {
        self.rules.iter().map(|(key, _)| *key).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Attach the running listener of a rule
    pub fn bind(&mut self, binding: AccepterBinding) {
        self.bindings.insert(binding.rule(), binding);
    }

    pub fn binding(&self, key: RuleId) -> Option<&AccepterBinding> {
        self.bindings.get(&key)
    }

    pub fn is_active(&self, key: RuleId) -> bool {
        self.bindings.contains_key(&key)
    }

    /// Release every listener; the rules stay registered
    pub fn release_listeners(&mut self) -> usize {
        let count = self.bindings.len();
        self.bindings.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rule_copies_strings() {
        let listen = String::from("tcp,3000");
        let rule = PortRule::new(ExecContext::current(), &listen, "forward1", "A").unwrap();
        drop(listen);

        assert_eq!(rule.listen(), "tcp,3000");
        assert_eq!(rule.service(), "forward1");
        assert_eq!(rule.id(), "A");
    }

    #[tokio::test]
    async fn test_registry_is_lifo() {
        let context = ExecContext::current();
        let mut registry = PortRegistry::new();

        let first = registry
            .insert(PortRule::new(context.clone(), "tcp,3000", "one", "A").unwrap())
            .unwrap();
        let second = registry
            .insert(PortRule::new(context, "tcp,3001", "two", "B").unwrap())
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(registry.keys(), vec![second, first]);

        let ids: Vec<&str> = registry.iter().map(|(_, rule)| rule.id()).collect();
        assert_eq!(ids, vec!["B", "A"]);
        assert_eq!(registry.get(first).map(|r| r.service()), Some("one"));
    }

    #[tokio::test]
    async fn test_duplicate_ids_get_distinct_keys() {
        let context = ExecContext::current();
        let mut registry = PortRegistry::new();

        let a = registry
            .insert(PortRule::new(context.clone(), "tcp,3000", "svc", "same").unwrap())
            .unwrap();
        let b = registry
            .insert(PortRule::new(context, "tcp,3001", "svc", "same").unwrap())
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_active(a));
    }
}
