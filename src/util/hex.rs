use std::fmt::Write;

/// Lowercase hex rendering of a byte slice, used for dedup fingerprints and
///  for logging raw datagrams.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}
