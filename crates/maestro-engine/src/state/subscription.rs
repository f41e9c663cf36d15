//! Pattern-matched change listeners.

use std::sync::{Arc, RwLock};

use maestro_core::sync::IgnoreRwLock as _;
use maestro_core::{AgentId, Result, SubscriptionId};
use regex::Regex;

use super::StateChange;

/// Callback invoked for every matching change written by another agent.
pub type SubscriberCallback = Arc<dyn Fn(&StateChange) -> Result<()> + Send + Sync>;

/// Which keys a subscription listens to.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// Exactly this key
    Exact(String),
    /// Any key starting with this prefix (written as `prefix*`)
    Prefix(String),
    /// Any key the expression matches
    Regex(Regex),
}

impl KeyPattern {
    /// Parse a string pattern: a trailing `*` makes a prefix pattern,
    /// anything else is an exact key.
    pub fn parse(pattern: &str) -> Self {
        pattern.strip_suffix('*').map_or_else(
            || Self::Exact(pattern.to_owned()),
            |prefix| Self::Prefix(prefix.to_owned()),
        )
    }

    /// Build a regular-expression pattern.
    ///
    /// # Errors
    /// Returns an error if `expression` is not a valid regex.
    pub fn regex(expression: &str) -> Result<Self> {
        Ok(Self::Regex(Regex::new(expression)?))
    }

    /// Whether `key` matches.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Regex(regex) => regex.is_match(key),
        }
    }
}

impl From<&str> for KeyPattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

pub(super) struct Subscription {
    pub(super) id: SubscriptionId,
    pattern: KeyPattern,
    agent_id: AgentId,
    pub(super) callback: SubscriberCallback,
}

/// Subscriptions in registration order.
#[derive(Default)]
pub(super) struct SubscriptionRegistry {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    pub(super) fn add(
        &self,
        pattern: KeyPattern,
        agent_id: AgentId,
        callback: SubscriberCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId::default();
        self.subscriptions
            .write_ignore_poison()
            .push(Arc::new(Subscription {
                id,
                pattern,
                agent_id,
                callback,
            }));
        id
    }

    pub(super) fn remove(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write_ignore_poison();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        before != subscriptions.len()
    }

    /// Subscriptions matching `key`, excluding the writer's own.
    pub(super) fn matching(&self, key: &str, writer: &AgentId) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read_ignore_poison()
            .iter()
            .filter(|subscription| {
                subscription.agent_id != *writer && subscription.pattern.matches(key)
            })
            .map(Arc::clone)
            .collect()
    }

    pub(super) fn len(&self) -> usize {
        self.subscriptions.read_ignore_poison().len()
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code has different conventions"
)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_parsing() {
        assert!(matches!(KeyPattern::parse("budget"), KeyPattern::Exact(key) if key == "budget"));
        assert!(matches!(KeyPattern::parse("spec:*"), KeyPattern::Prefix(prefix) if prefix == "spec:"));
    }

    #[test]
    fn test_pattern_matching() {
        let exact = KeyPattern::parse("budget");
        assert!(exact.matches("budget"));
        assert!(!exact.matches("budget:total"));

        let prefix = KeyPattern::parse("spec:*");
        assert!(prefix.matches("spec:1"));
        assert!(prefix.matches("spec:"));
        assert!(!prefix.matches("specs"));

        let regex = match KeyPattern::regex(r"^task:\d+$") {
            Ok(pattern) => pattern,
            Err(error) => panic!("valid regex rejected: {error}"),
        };
        assert!(regex.matches("task:42"));
        assert!(!regex.matches("task:abc"));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(KeyPattern::regex("(unclosed").is_err());
    }

    #[test]
    fn test_registry_excludes_writer() {
        let registry = SubscriptionRegistry::default();
        let noop: SubscriberCallback = Arc::new(|_change: &StateChange| -> Result<()> { Ok(()) });
        registry.add(KeyPattern::parse("spec:*"), AgentId::from("a"), Arc::clone(&noop));
        let id_b = registry.add(KeyPattern::parse("spec:*"), AgentId::from("b"), noop);

        let matching = registry.matching("spec:1", &AgentId::from("a"));
        assert_eq!(matching.len(), 1);
        assert_eq!(matching.first().map(|subscription| subscription.id), Some(id_b));

        assert!(registry.remove(id_b));
        assert!(!registry.remove(id_b));
        assert_eq!(registry.len(), 1);
    }
}
