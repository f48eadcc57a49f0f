use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use reward_cascade_proto::StoreError;

use crate::CascadeError;

pub(crate) const MILLIS_PER_DAY: i64 = 86_400_000;

pub(crate) fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn hash_json<T: Serialize>(value: &T) -> Result<String, CascadeError> {
    let bytes = serde_json::to_vec(value).map_err(StoreError::from)?;
    Ok(sha256_hex(&bytes))
}
