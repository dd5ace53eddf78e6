//! PBKDF2-SHA256 password hashing in the modular-crypt layout
//!
//! Hashes look like `$pbkdf2-sha256$29000$<salt>$<checksum>` where salt and checksum use the
//! adapted base64 alphabet (`.` instead of `+`, no padding).

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha2::Sha256;

pub const HASH_PREFIX: &str = "$pbkdf2-sha256$";
pub const DEFAULT_ROUNDS: u32 = 29000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

fn ab64_encode(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes).replace('+', ".")
}

fn ab64_decode(s: &str) -> Option<Vec<u8>> {
    STANDARD_NO_PAD.decode(s.replace('.', "+")).ok()
}

fn derive(password: &str, salt: &[u8], rounds: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut key);
    key
}

/// Whether a value is already a hash produced by [`hash_password`]
pub fn is_hashed(value: &str) -> bool {
    value.starts_with(HASH_PREFIX)
}

/// Hash a clear-text password with a fresh random salt
pub fn hash_password(password: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    let key = derive(password, &salt, DEFAULT_ROUNDS);
    format!(
        "{}{}${}${}",
        HASH_PREFIX,
        DEFAULT_ROUNDS,
        ab64_encode(&salt),
        ab64_encode(&key)
    )
}

/// Hash unless the value is already hashed
pub fn ensure_hashed(value: &str) -> String {
    if is_hashed(value) {
        value.to_string()
    } else {
        hash_password(value)
    }
}

/// Check a clear-text password against a stored hash
pub fn verify_password(password: &str, hashed: &str) -> bool {
    let Some(rest) = hashed.strip_prefix(HASH_PREFIX) else {
        return false;
    };
    let mut parts = rest.split('$');
    let (Some(rounds), Some(salt), Some(checksum), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let (Ok(rounds), Some(salt), Some(expected)) =
        (rounds.parse::<u32>(), ab64_decode(salt), ab64_decode(checksum))
    else {
        return false;
    };
    let actual = derive(password, &salt, rounds);
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_has_modular_crypt_layout() {
        let hashed = hash_password("some pass");
        assert!(hashed.starts_with("$pbkdf2-sha256$29000$"));
        assert_eq!(hashed.split('$').count(), 5);
    }

    #[test]
    fn test_verify() {
        let hashed = hash_password("some pass");
        assert!(verify_password("some pass", &hashed));
        assert!(!verify_password("other pass", &hashed));
        assert!(!verify_password("some pass", "some pass"));
    }

    #[test]
    fn test_ensure_hashed_is_idempotent() {
        let once = ensure_hashed("secret");
        let twice = ensure_hashed(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_password("a"), hash_password("a"));
    }
}
