//! Password hashing, verification and strength scoring.

use argon2::{
    Argon2,
    password_hash::{PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::collections::HashSet;

use super::{ServiceError, ServiceResult};

pub fn hash_password(password: &str) -> ServiceResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ServiceError::internal(format!("Password hash error: {}", err)))
}

/// True when `password` matches an argon2 `stored` hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match argon2::PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// True when `stored` is the legacy md5 hex digest of `password`.
pub fn is_legacy_md5(password: &str, stored: &str) -> bool {
    format!("{:x}", md5::compute(password)) == stored
}

/// Score from 0 to 100: length and character class variety add points,
/// repeated characters take them away.
pub fn password_strength(password: &str) -> u32 {
    let chars: Vec<char> = password.chars().collect();
    if chars.is_empty() {
        return 0;
    }
    let length = chars.len() as i64;
    let mut score = (length * 4).min(40);
    if length >= 12 {
        score += 20;
    }
    let classes = [
        chars.iter().any(|c| c.is_lowercase()),
        chars.iter().any(|c| c.is_uppercase()),
        chars.iter().any(|c| c.is_ascii_digit()),
        chars.iter().any(|c| !c.is_alphanumeric()),
    ];
    score += 10 * classes.iter().filter(|present| **present).count() as i64;
    let unique = chars.iter().collect::<HashSet<_>>().len() as i64;
    score -= (length - unique) * 2;
    score.clamp(0, 100) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_verify() {
        let hash = hash_password("s3cret!").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret!", &hash));
        assert!(!verify_password("other", &hash));
        assert!(!verify_password("s3cret!", "not-a-hash"));
    }

    #[test]
    fn legacy_md5_digests() {
        assert!(is_legacy_md5("admin", "21232f297a57a5a743894a0e4a801fc3"));
        assert!(!is_legacy_md5("admin", "21232f297a57a5a743894a0e4a801fc4"));
    }

    #[test]
    fn strength_rewards_length_and_variety() {
        assert_eq!(password_strength(""), 0);
        assert!(password_strength("aaaaaaaa") < 40);
        assert!(password_strength("password") < 60);
        assert!(password_strength("Secret123") >= 60);
        assert!(password_strength("Str0ng!Passw0rd") > 90);
        assert_eq!(password_strength("abc"), 22);
        assert_eq!(password_strength("Al1ce!Secret"), 94);
    }
}
