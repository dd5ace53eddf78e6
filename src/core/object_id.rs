//! Store-native object identifiers
//!
//! Object ids travel as strings prefixed with `OBJ_` followed by 24 hex digits. The MongoDB
//! backend turns them into native `ObjectId`s; the in-memory store keeps the string.

#[cfg(not(feature = "mongodb_backend"))]
use std::sync::atomic::{AtomicU32, Ordering};

/// Prefix marking a store-native id on the wire
pub const OBJECT_ID_PREFIX: &str = "OBJ_";

/// Generate a new object id in wire form
#[cfg(feature = "mongodb_backend")]
pub fn generate() -> String {
    from_hex(&mongodb::bson::oid::ObjectId::new().to_hex())
}

#[cfg(not(feature = "mongodb_backend"))]
static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a new object id in wire form
///
/// Without the driver the layout is built by hand: 4 bytes of seconds, 5 random bytes,
/// 3 counter bytes.
#[cfg(not(feature = "mongodb_backend"))]
pub fn generate() -> String {
    let secs = chrono::Utc::now().timestamp() as u32;
    let random: [u8; 5] = rand::random();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;

    let mut hex = format!("{:08x}", secs);
    for byte in random {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex.push_str(&format!("{:06x}", counter));
    from_hex(&hex)
}

/// Whether a string is an object id in wire form
pub fn is_object_id(s: &str) -> bool {
    s.strip_prefix(OBJECT_ID_PREFIX)
        .is_some_and(|hex| hex.len() == 24 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

/// The 24-digit hex part of an object id in wire form
pub fn hex_part(s: &str) -> Option<&str> {
    if is_object_id(s) {
        s.strip_prefix(OBJECT_ID_PREFIX)
    } else {
        None
    }
}

/// Wrap a native hex id into wire form
pub fn from_hex(hex: &str) -> String {
    format!("{}{}", OBJECT_ID_PREFIX, hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_well_formed_and_distinct() {
        let a = generate();
        let b = generate();
        assert!(is_object_id(&a), "{}", a);
        assert!(is_object_id(&b), "{}", b);
        assert_ne!(a, b);
    }

    #[cfg(feature = "mongodb_backend")]
    #[test]
    fn test_generated_ids_parse_as_native_ids() {
        let id = generate();
        let hex = hex_part(&id).unwrap();
        assert!(mongodb::bson::oid::ObjectId::parse_str(hex).is_ok());
    }

    #[test]
    fn test_hex_part() {
        let id = from_hex("5f1b2c3d4e5f6a7b8c9d0e1f");
        assert_eq!(hex_part(&id), Some("5f1b2c3d4e5f6a7b8c9d0e1f"));
        assert_eq!(hex_part("U1234"), None);
        assert!(!is_object_id("OBJ_xyz"));
    }
}
