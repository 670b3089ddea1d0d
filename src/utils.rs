//! Utility functions for identifiers and store keys

use bech32::Bech32m;
use tracing::warn;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Bech32 id for `hrp`. If encoding fails the raw uuid is kept behind the
/// same prefix so the id still names its kind.
pub fn new_prefixed_id(hrp: &str) -> String {
    match new_uuid_to_bech32(hrp) {
        Ok(id) => id,
        Err(e) => {
            warn!(hrp, error = %e, "bech32 id encoding failed, using raw uuid");
            format!("{hrp}{}", uuid7())
        }
    }
}

/// Composite key `a/b`. Ids are bech32 so they never contain a `/`.
pub fn compound_key(a: &str, b: &str) -> Vec<u8> {
    format!("{a}/{b}").into_bytes()
}
