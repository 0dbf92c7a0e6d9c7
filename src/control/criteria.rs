//! Evaluation predicates for loop iterations.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};

use crate::protocol::Message;

// ============================================================================
// Criteria
// ============================================================================

/// Decides whether a response counts as one completed iteration.
#[derive(Clone)]
pub struct Criteria {
    predicate: Arc<dyn Fn(&Message) -> bool + Send + Sync>,
    label: &'static str,
}

impl Criteria {
    /// Every response counts.
    #[must_use]
    pub fn always() -> Self {
        Self {
            predicate: Arc::new(|_| true),
            label: "always",
        }
    }

    /// A response counts if its body starts with one of `statuses`.
    ///
    /// With no statuses, nothing counts.
    #[must_use]
    pub fn strict(statuses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let statuses: Vec<String> = statuses.into_iter().map(Into::into).collect();
        Self {
            predicate: Arc::new(move |message: &Message| {
                statuses
                    .iter()
                    .any(|status| message.body.starts_with(status.as_str()))
            }),
            label: "strict",
        }
    }

    /// A response counts if `predicate` returns `true`.
    #[must_use]
    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            label: "custom",
        }
    }

    /// Evaluates a response.
    #[inline]
    #[must_use]
    pub fn evaluate(&self, message: &Message) -> bool {
        (self.predicate)(message)
    }
}

impl Default for Criteria {
    fn default() -> Self {
        Self::always()
    }
}

impl fmt::Debug for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Criteria").field(&self.label).finish()
    }
}

/// Deserializes a list of status names into [`Criteria::strict`].
pub(crate) fn strict_statuses<'de, D>(deserializer: D) -> Result<Criteria, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer).map(Criteria::strict)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::MessageKind;

    fn result(body: &str) -> Message {
        Message::new(MessageKind::Result, body)
    }

    #[test]
    fn test_always() {
        assert!(Criteria::always().evaluate(&result("miss")));
        assert!(Criteria::default().evaluate(&result("")));
    }

    #[test]
    fn test_strict_matches_leading_status() {
        let criteria = Criteria::strict(["hit", "catch"]);
        assert!(criteria.evaluate(&result("hit;wait250")));
        assert!(criteria.evaluate(&result("catch")));
        assert!(!criteria.evaluate(&result("miss;hit")));
    }

    #[test]
    fn test_strict_empty_never_counts() {
        let criteria = Criteria::strict(Vec::<String>::new());
        assert!(!criteria.evaluate(&result("hit")));
    }

    #[test]
    fn test_from_fn() {
        let criteria = Criteria::from_fn(|message| message.body.len() > 3);
        assert!(criteria.evaluate(&result("reject")));
        assert!(!criteria.evaluate(&result("hit")));
        assert_eq!(format!("{criteria:?}"), "Criteria(\"custom\")");
    }
}
