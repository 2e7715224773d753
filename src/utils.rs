//! Identifier helpers for contexts and signal records

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32m
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Builds a signal key unique per emit, even when two events share a timestamp.
pub fn new_signal_key(prefix: &str, emitted_at_nanos: i64) -> String {
    format!("{prefix}{emitted_at_nanos}-{}", uuid7())
}

/// Key a watcher waits for to know it should exit. Sits next to the state
/// key, outside the signal prefix, so other contexts ignore it.
pub fn new_watch_stop_key(state_key: &[u8], observer: &str) -> Vec<u8> {
    let mut key = state_key.to_vec();
    key.extend_from_slice(format!(".watch-stop.{observer}-{}", uuid7()).as_bytes());
    key
}
