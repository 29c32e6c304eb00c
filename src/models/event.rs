//! Query lifecycle events delivered to before/after listeners.

use crate::models::QueryParam;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single query dispatch as seen by listeners.
///
/// Before-listeners receive the event with `duration_ms == 0` and no error;
/// after-listeners receive the same event with timing and, on failure, the error text.
#[derive(Debug, Clone, Serialize)]
pub struct QueryEvent {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub is_read: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryEvent {
    pub fn new(sql: impl Into<String>, params: &[QueryParam], is_read: bool) -> Self {
        Self {
            sql: sql.into(),
            params: params.to_vec(),
            is_read,
            started_at: Utc::now(),
            duration_ms: 0,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}
