//! Rate-limit reservations: a token grant scheduled for a future instant.

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: Uuid,
    pub key: String,
    pub token_count: u32,
    pub reserved_at: DateTime<Utc>,
    pub execute_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub shard_id: Option<usize>,
}

impl Reservation {
    /// `expires_at = execute_at + 60s`.
    pub fn new(key: String, token_count: u32, delay: chrono::Duration, shard_id: Option<usize>) -> Self {
        let reserved_at = Utc::now();
        let execute_at = reserved_at + delay.max(chrono::Duration::zero());
        let expires_at = execute_at + chrono::Duration::seconds(60);
        Self {
            id: Uuid::new_v4(),
            key,
            token_count,
            reserved_at,
            execute_at,
            expires_at,
            shard_id,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        now >= self.execute_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
