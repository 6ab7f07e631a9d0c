use expgate_core::error::{GateError, GateResult};
use expgate_core::token::AccessToken;

use crate::store::RecordStore;

pub const RECORD_KEY_PREFIX: &str = "access:";

pub fn record_key(token: &str) -> String {
    format!("{RECORD_KEY_PREFIX}{token}")
}

/// Reads and parses a token record. A record that fails to parse is treated
/// as absent, same as an expired one.
pub fn load_token(
    store: &dyn RecordStore,
    token: &str,
    now_ms: u64,
) -> GateResult<Option<AccessToken>> {
    let raw = store
        .get(&record_key(token), now_ms)
        .map_err(|err| GateError::Store(err.to_string()))?;
    Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
}

/// Persists a token record with a TTL derived from its expiry fields.
pub fn save_token(
    store: &dyn RecordStore,
    token: &str,
    record: &AccessToken,
    now_ms: u64,
) -> GateResult<()> {
    let raw =
        serde_json::to_string(record).map_err(|err| GateError::Store(err.to_string()))?;
    store
        .put(
            &record_key(token),
            &raw,
            record.ttl_seconds(now_ms),
            now_ms,
        )
        .map_err(|err| GateError::Store(err.to_string()))
}
