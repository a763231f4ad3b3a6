//! Query Guard
//!
//! Static keyword checks applied to a candidate query before it may run.
//! The guard only admits or refuses; it never rewrites a query.
//!
//! Matching is plain case-insensitive substring search over the whole
//! statement. It can over-reject (a column called `created_at` contains
//! `CREATE`) and under-reject obfuscated statements. The read-only
//! transaction / read-only connection in the store adapters is the second
//! line of defence.

use crate::error::GuardRejection;
use crate::generator::CandidateQuery;
use std::fmt;
use tracing::warn;

const READ_ONLY_PREFIX: &str = "SELECT";

/// Mutating and administrative keywords, reported in this order.
pub const DENY_LIST: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "INSERT", "UPDATE", "ALTER", "CREATE", "EXEC",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Accepted,
    Rejected(GuardRejection),
}

impl GuardDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GuardDecision::Accepted)
    }
}

/// A query that passed the guard. Only [`QueryGuard::admit`] can build one,
/// so anything that takes an `AcceptedQuery` runs vetted SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedQuery(String);

impl AcceptedQuery {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AcceptedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryGuard;

impl QueryGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, candidate: &str) -> GuardDecision {
        let normalized = candidate.trim().to_ascii_uppercase();

        if !normalized.starts_with(READ_ONLY_PREFIX) {
            return GuardDecision::Rejected(GuardRejection::MissingSelectPrefix);
        }

        match DENY_LIST.iter().find(|keyword| normalized.contains(*keyword)) {
            Some(keyword) => GuardDecision::Rejected(GuardRejection::DeniedKeyword(*keyword)),
            None => GuardDecision::Accepted,
        }
    }

    /// Check a candidate and, if it passes, turn it into an executable query.
    pub fn admit(&self, candidate: CandidateQuery) -> Result<AcceptedQuery, GuardRejection> {
        match self.check(candidate.as_str()) {
            GuardDecision::Accepted => Ok(AcceptedQuery(candidate.into_inner().trim().to_string())),
            GuardDecision::Rejected(rejection) => {
                warn!(sql = %candidate, reason = %rejection, "Guard rejected candidate query");
                Err(rejection)
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn accepted_for_tests(sql: &str) -> AcceptedQuery {
    QueryGuard::new()
        .admit(CandidateQuery::new(sql))
        .expect("test query must pass the guard")
}
