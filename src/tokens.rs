//! Bearer token generation and validation.

use uuid::Uuid;

/// 32 random hex digits grouped `8-4-4-4-12`.
pub fn get_unique_token() -> String {
    Uuid::from_bytes(rand::random::<[u8; 16]>())
        .hyphenated()
        .to_string()
}

/// `token` itself when it is five hex groups of lengths 8-4-4-4-12, else
/// the empty string.
pub fn check_token_format(token: &str) -> String {
    let parts: Vec<&str> = token.split('-').collect();
    let lengths: Vec<usize> = parts.iter().map(|part| part.len()).collect();
    if lengths != [8, 4, 4, 4, 12] {
        return String::new();
    }
    if !parts.iter().all(|part| part.chars().all(|c| c.is_ascii_hexdigit())) {
        return String::new();
    }
    token.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_pass_the_format_check() {
        let token = get_unique_token();
        assert_eq!(token.len(), 36);
        assert_eq!(check_token_format(&token), token);
        assert_ne!(get_unique_token(), token);
    }

    #[test]
    fn malformed_tokens_are_blanked() {
        assert_eq!(check_token_format(""), "");
        assert_eq!(check_token_format("abcd-1234"), "");
        assert_eq!(check_token_format("zzzzzzzz-1234-1234-1234-123456789012"), "");
        assert_eq!(check_token_format("12345678-1234-1234-1234-1234567890123"), "");
        let upper = "ABCDEF01-2345-6789-ABCD-EF0123456789";
        assert_eq!(check_token_format(upper), upper);
    }
}
