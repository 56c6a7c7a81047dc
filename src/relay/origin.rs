//! Handshake admission policy

use std::fmt;
use std::sync::Arc;

/// Outcome of evaluating an upgrade request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject,
}

/// Injectable `(origin) -> bool` predicate consulted on every upgrade request.
///
/// Requests without an `Origin` header are evaluated as the empty string.
#[derive(Clone)]
pub struct OriginPolicy {
    check: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl OriginPolicy {
    /// Build a policy from an arbitrary predicate
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
        }
    }

    /// Admit every origin
    pub fn allow_all() -> Self {
        Self::new(|_| true)
    }

    /// Admit only the listed origins (ASCII case-insensitive, trailing `/` ignored)
    pub fn allow_list<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: Vec<String> = origins
            .into_iter()
            .map(|o| normalize(&o.into()).to_string())
            .collect();
        Self::new(move |origin| {
            let origin = normalize(origin);
            allowed.iter().any(|a| a.eq_ignore_ascii_case(origin))
        })
    }

    /// Build the policy described by an `allowed_origins` setting
    pub fn from_allowed_origins(origins: &[String]) -> Self {
        if origins.is_empty() {
            Self::allow_all()
        } else {
            Self::allow_list(origins.iter().cloned())
        }
    }

    pub fn evaluate(&self, origin: &str) -> Admission {
        if (self.check)(origin) {
            Admission::Accept
        } else {
            Admission::Reject
        }
    }
}

impl Default for OriginPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl fmt::Debug for OriginPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginPolicy").finish_non_exhaustive()
    }
}

fn normalize(origin: &str) -> &str {
    origin.trim().trim_end_matches('/')
}
