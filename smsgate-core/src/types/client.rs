use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An API client of the gateway. Provisioned externally; the gateway itself
/// only ever mutates `credit_cents`, and only through the credit ledger or an
/// administrative top-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Opaque identifier.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// bcrypt hash of the API key. Legacy seed rows may carry the literal
    /// key instead.
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    /// Where delivery receipts are forwarded, if the client wants them.
    pub dlr_callback_url: Option<String>,
    /// Secret for signing forwarded receipts.
    #[serde(skip_serializing)]
    pub callback_hmac_secret: Option<String>,
    /// Prepaid balance. Never negative.
    pub credit_cents: i64,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}
