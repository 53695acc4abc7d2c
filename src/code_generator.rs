//! Activation code generation and format validation.
//!
//! Codes look like `7K3M-Q9ZD-R2XA-HT5W`: four groups of four characters drawn
//! from the Crockford base32 alphabet (digits plus uppercase letters without
//! `I`, `L`, `O`, `U`).
//!
//! Each code is built from 16 bytes read from the operating system RNG, one
//! symbol per byte. 256 is a multiple of 32, so `byte % 32` is unbiased and a
//! code carries 80 bits of entropy.
//!
//! Uniqueness is not checked here. The store enforces a unique constraint on
//! the code column and callers regenerate on conflict.
//!
//! # Example
//!
//! ```
//! use keyforge::code_generator::{generate_activation_code, validate_code_format};
//!
//! let code = generate_activation_code();
//! assert!(validate_code_format(&code));
//! ```

use rand::rngs::OsRng;
use rand::TryRngCore;

/// Crockford base32 alphabet.
pub const CODE_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Random bytes consumed per code.
pub const CODE_ENTROPY_BYTES: usize = 16;

/// Characters per hyphen-separated group.
pub const GROUP_LENGTH: usize = 4;

/// Number of groups in a code.
pub const GROUP_COUNT: usize = CODE_ENTROPY_BYTES / GROUP_LENGTH;

/// Render raw bytes as a grouped activation code.
///
/// Exposed separately from [`generate_activation_code`] so the rendering is
/// deterministic and testable.
pub fn render_code(bytes: &[u8; CODE_ENTROPY_BYTES]) -> String {
    bytes
        .chunks(GROUP_LENGTH)
        .map(|group| {
            group
                .iter()
                .map(|b| CODE_ALPHABET[usize::from(*b) % CODE_ALPHABET.len()] as char)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Generate a fresh activation code.
///
/// # Panics
///
/// Panics if the operating system entropy source fails. The process cannot
/// issue safe codes without it.
pub fn generate_activation_code() -> String {
    let mut bytes = [0u8; CODE_ENTROPY_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .expect("OsRng failed to produce activation code entropy");
    render_code(&bytes)
}

/// Check that a string has the `XXXX-XXXX-XXXX-XXXX` shape and only uses
/// alphabet characters.
pub fn validate_code_format(code: &str) -> bool {
    let groups: Vec<&str> = code.split('-').collect();
    if groups.len() != GROUP_COUNT {
        return false;
    }

    groups.iter().all(|group| {
        group.len() == GROUP_LENGTH && group.bytes().all(|b| CODE_ALPHABET.contains(&b))
    })
}

/// Normalise user-typed input: trim, uppercase, and map the Crockford
/// look-alikes (`O` to `0`, `I`/`L` to `1`).
pub fn normalize_code(input: &str) -> String {
    input
        .trim()
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            'O' => '0',
            'I' | 'L' => '1',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_code_has_grouped_format() {
        let code = generate_activation_code();
        let groups: Vec<&str> = code.split('-').collect();
        assert_eq!(groups.len(), 4);
        for group in groups {
            assert_eq!(group.len(), 4);
        }
        assert_eq!(code.len(), 19);
    }

    #[test]
    fn generated_code_uses_alphabet_only() {
        for _ in 0..100 {
            let code = generate_activation_code();
            for ch in code.chars().filter(|c| *c != '-') {
                assert!(
                    CODE_ALPHABET.contains(&(ch as u8)),
                    "unexpected character {ch} in {code}"
                );
                assert!(!"ILOU".contains(ch), "ambiguous character {ch} in {code}");
            }
        }
    }

    #[test]
    fn render_is_deterministic() {
        let bytes = [
            0, 1, 2, 3, 31, 32, 33, 255, 10, 17, 18, 19, 20, 21, 22, 23,
        ];
        assert_eq!(render_code(&bytes), "0123-Z01Z-AHJK-MNPQ");
    }

    #[test]
    fn validate_accepts_generated_codes() {
        for _ in 0..50 {
            assert!(validate_code_format(&generate_activation_code()));
        }
    }

    #[test]
    fn validate_rejects_malformed_codes() {
        assert!(!validate_code_format(""));
        assert!(!validate_code_format("ABCD-EFGH-JKMN"));
        assert!(!validate_code_format("ABCD-EFGH-JKMN-PQRS-TVWX"));
        assert!(!validate_code_format("ABC-EFGH-JKMN-PQRS"));
        assert!(!validate_code_format("abcd-efgh-jkmn-pqrs"));
        assert!(!validate_code_format("ABCD-EFGH-JKMN-PQRU"));
    }

    #[test]
    fn normalize_maps_lookalikes() {
        assert_eq!(normalize_code(" abco-1il0-xyzw-0000 "), "ABC0-1110-XYZW-0000");
    }

    #[test]
    fn generated_codes_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let code = generate_activation_code();
            assert!(seen.insert(code.clone()), "duplicate code generated: {code}");
        }
    }
}
