//! Authorization code store
//!
//! Codes are opaque, short-lived, and strictly one-time: consumption is an
//! atomic map removal, so concurrent exchanges of the same code cannot both
//! succeed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::identity::AuthMethod;

/// Authorization code lifetime
pub const CODE_TTL: std::time::Duration = std::time::Duration::from_secs(10 * 60);

fn code_ttl() -> ChronoDuration {
    ChronoDuration::seconds(CODE_TTL.as_secs() as i64)
}

/// Everything bound to an issued code
#[derive(Debug, Clone)]
pub struct AuthCodeRecord {
    pub subject: String,
    pub client_id: String,
    pub scope: Option<String>,
    pub redirect_uri: String,
    pub auth_method: AuthMethod,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// In-memory one-time code store
#[derive(Debug, Default)]
pub struct AuthCodeStore {
    codes: DashMap<String, AuthCodeRecord>,
}

impl AuthCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh code; expired records are swept opportunistically
    pub fn issue(
        &self,
        subject: impl Into<String>,
        client_id: impl Into<String>,
        scope: Option<String>,
        redirect_uri: impl Into<String>,
        auth_method: AuthMethod,
    ) -> String {
        let now = Utc::now();
        self.codes.retain(|_, record| record.expires_at > now);

        let code = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        self.codes.insert(
            code.clone(),
            AuthCodeRecord {
                subject: subject.into(),
                client_id: client_id.into(),
                scope,
                redirect_uri: redirect_uri.into(),
                auth_method,
                issued_at: now,
                expires_at: now + code_ttl(),
            },
        );
        code
    }

    /// Consume a code exactly once; expired codes yield `None`
    pub fn consume(&self, code: &str) -> Option<AuthCodeRecord> {
        let (_, record) = self.codes.remove(code)?;
        if record.expires_at <= Utc::now() {
            return None;
        }
        Some(record)
    }

    /// Number of outstanding codes, for diagnostics
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}
