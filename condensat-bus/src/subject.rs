//! Subject naming, validation and pattern matching
//!
//! Subjects are hierarchical dot-separated strings such as
//! `Condensat.Monitor.Stack.List`. Subscription patterns support two
//! wildcards:
//! - `*` matches exactly one token
//! - `>` matches one or more trailing tokens (last position only)

use crate::error::{BusError, Result};
use std::collections::HashMap;
use uuid::Uuid;

/// Monitor service subjects
pub mod monitor {
    /// Process-info snapshots pushed by every service instance
    pub const INBOUND: &str = "Condensat.Monitor.Inbound";

    /// Latest status of every known service
    pub const STACK_LIST: &str = "Condensat.Monitor.Stack.List";

    /// Bucketed history of one service
    pub const STACK_SERVICE_HISTORY: &str = "Condensat.Monitor.Stack.ServiceHistory";

    /// All monitor subjects
    pub fn all_subjects() -> Vec<&'static str> {
        vec![INBOUND, STACK_LIST, STACK_SERVICE_HISTORY]
    }
}

/// Generic example subject used by demos and tests
pub const EXAMPLE_REQUEST: &str = "Example.Request";

/// Prefix of reply subjects owned by RPC correlators
pub const INBOX_PREFIX: &str = "_INBOX";

/// Reply subject for one request of one correlator
pub fn inbox_subject(client_id: &str, correlation_id: &str) -> String {
    format!("{INBOX_PREFIX}.{client_id}.{correlation_id}")
}

/// Wildcard pattern covering every reply subject of one correlator
pub fn inbox_pattern(client_id: &str) -> String {
    format!("{INBOX_PREFIX}.{client_id}.*")
}

/// Validate a concrete subject (no wildcards allowed)
pub fn validate_subject(subject: &str) -> Result<()> {
    validate_tokens(subject, false)
}

/// Validate a subscription pattern
pub fn validate_pattern(pattern: &str) -> Result<()> {
    validate_tokens(pattern, true)
}

fn validate_tokens(value: &str, allow_wildcards: bool) -> Result<()> {
    if value.is_empty() {
        return Err(BusError::invalid_subject("subject is empty"));
    }

    let tokens: Vec<&str> = value.split('.').collect();
    for (index, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(BusError::invalid_subject(format!(
                "empty token in '{value}'"
            )));
        }
        if token.chars().any(char::is_whitespace) {
            return Err(BusError::invalid_subject(format!(
                "whitespace in '{value}'"
            )));
        }

        let is_wildcard = *token == "*" || *token == ">";
        if is_wildcard && !allow_wildcards {
            return Err(BusError::invalid_subject(format!(
                "wildcard in concrete subject '{value}'"
            )));
        }
        if !is_wildcard && (token.contains('*') || token.contains('>')) {
            return Err(BusError::invalid_subject(format!(
                "partial wildcard token '{token}' in '{value}'"
            )));
        }
        if *token == ">" && index != tokens.len() - 1 {
            return Err(BusError::invalid_subject(format!(
                "'>' must be the last token in '{value}'"
            )));
        }
    }

    Ok(())
}

/// A subject pattern for subscription matching
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectPattern {
    /// The pattern string (e.g., "_INBOX.client.*")
    pub pattern: String,
    /// Whether this pattern contains wildcards
    pub is_wildcard: bool,
}

impl SubjectPattern {
    /// Create a new validated subject pattern
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        validate_pattern(&pattern)?;
        let is_wildcard = pattern.split('.').any(|t| t == "*" || t == ">");
        Ok(Self {
            pattern,
            is_wildcard,
        })
    }

    /// Check if this pattern matches a subject
    pub fn matches(&self, subject: &str) -> bool {
        if !self.is_wildcard {
            return self.pattern == subject;
        }

        let mut subject_tokens = subject.split('.');
        for pattern_token in self.pattern.split('.') {
            match (pattern_token, subject_tokens.next()) {
                (">", Some(_)) => return true,
                (_, None) => return false,
                ("*", Some(_)) => continue,
                (expected, Some(actual)) if expected == actual => continue,
                _ => return false,
            }
        }

        subject_tokens.next().is_none()
    }
}

/// Routing table from subject patterns to subscriber IDs
#[derive(Debug, Default)]
pub struct SubjectMatcher {
    /// Map of subscriber IDs to their pattern
    subscriptions: HashMap<Uuid, SubjectPattern>,
    /// Insertion order, so delivery order across subscribers is stable
    order: Vec<Uuid>,
}

impl SubjectMatcher {
    /// Create a new subject matcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a pattern
    pub fn subscribe(&mut self, pattern: SubjectPattern, subscriber_id: Uuid) {
        if self.subscriptions.insert(subscriber_id, pattern).is_none() {
            self.order.push(subscriber_id);
        }
    }

    /// Remove a subscriber; returns whether it existed
    pub fn unsubscribe(&mut self, subscriber_id: Uuid) -> bool {
        if self.subscriptions.remove(&subscriber_id).is_some() {
            self.order.retain(|id| *id != subscriber_id);
            true
        } else {
            false
        }
    }

    /// Find all subscribers for a subject
    pub fn find_subscribers(&self, subject: &str) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| {
                self.subscriptions
                    .get(id)
                    .is_some_and(|pattern| pattern.matches(subject))
            })
            .copied()
            .collect()
    }

    /// Get subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }
}
