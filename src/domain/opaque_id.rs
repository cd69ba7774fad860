//! Reversible integer obfuscation for identifiers exposed to clients.
//!
//! Tokens are produced with the Hashids scheme: a salted, deterministic
//! permutation of a configured alphabet. No mapping table is stored, and the
//! same salt, alphabet and minimum length always yield the same token for an
//! integer.

use std::fmt;

use thiserror::Error;

use super::error::DomainError;

pub const DEFAULT_ALPHABET: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";
pub const DEFAULT_MIN_LENGTH: usize = 5;

const DEFAULT_SEPARATORS: &[u8] = b"cfhistuCFHISTU";
/// Filter grammar separators, the escape character, and bytes that query
/// string encoding splits on or rewrites.
const RESERVED: &[u8] = b",;:\\&=+%#?/";
const MIN_ALPHABET_LENGTH: usize = 16;
const SEPARATOR_RATIO: f64 = 3.5;
const GUARD_RATIO: f64 = 12.0;

/// Codec parameters as configured.
#[derive(Clone, PartialEq, Eq)]
pub struct CodecParams {
    pub salt: String,
    pub min_length: usize,
    pub alphabet: String,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            salt: String::new(),
            min_length: DEFAULT_MIN_LENGTH,
            alphabet: DEFAULT_ALPHABET.to_string(),
        }
    }
}

impl fmt::Debug for CodecParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecParams")
            .field("salt", &"<redacted>")
            .field("min_length", &self.min_length)
            .field("alphabet", &self.alphabet)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("token is not decodable")]
pub struct NotDecodable;

pub struct OpaqueIdCodec {
    salt: Vec<u8>,
    min_length: usize,
    alphabet: Vec<u8>,
    separators: Vec<u8>,
    guards: Vec<u8>,
    charset: [bool; 128],
}

impl OpaqueIdCodec {
    pub fn new(params: &CodecParams) -> Result<Self, DomainError> {
        if !params.alphabet.is_ascii() {
            return Err(DomainError::codec("alphabet must be ASCII"));
        }
        if params.alphabet.bytes().any(|byte| !byte.is_ascii_graphic()) {
            return Err(DomainError::codec(
                "alphabet must not contain spaces or control characters",
            ));
        }
        if let Some(byte) = params.alphabet.bytes().find(|byte| RESERVED.contains(byte)) {
            return Err(DomainError::codec(format!(
                "alphabet must not contain reserved character {:?}",
                char::from(byte)
            )));
        }
        if !params.salt.is_ascii() {
            return Err(DomainError::codec("salt must be ASCII"));
        }

        let mut unique: Vec<u8> = Vec::with_capacity(params.alphabet.len());
        for byte in params.alphabet.bytes() {
            if !unique.contains(&byte) {
                unique.push(byte);
            }
        }
        if unique.len() < MIN_ALPHABET_LENGTH {
            return Err(DomainError::codec(format!(
                "alphabet needs at least {MIN_ALPHABET_LENGTH} unique characters, got {}",
                unique.len()
            )));
        }

        let mut charset = [false; 128];
        for &byte in &unique {
            charset[usize::from(byte)] = true;
        }

        let salt = params.salt.as_bytes().to_vec();
        let mut separators: Vec<u8> = DEFAULT_SEPARATORS
            .iter()
            .copied()
            .filter(|byte| unique.contains(byte))
            .collect();
        let mut alphabet: Vec<u8> = unique
            .into_iter()
            .filter(|byte| !separators.contains(byte))
            .collect();

        shuffle(&mut separators, &salt);

        if separators.is_empty() || alphabet.len() as f64 / separators.len() as f64 > SEPARATOR_RATIO
        {
            let mut wanted = (alphabet.len() as f64 / SEPARATOR_RATIO).ceil() as usize;
            if wanted == 1 {
                wanted = 2;
            }
            if wanted > separators.len() {
                let diff = wanted - separators.len();
                separators.extend(alphabet.drain(..diff));
            } else {
                separators.truncate(wanted);
            }
        }

        shuffle(&mut alphabet, &salt);

        let guard_count = (alphabet.len() as f64 / GUARD_RATIO).ceil() as usize;
        let guards = if alphabet.len() < 3 {
            separators.drain(..guard_count).collect()
        } else {
            alphabet.drain(..guard_count).collect()
        };

        Ok(Self {
            salt,
            min_length: params.min_length,
            alphabet,
            separators,
            guards,
            charset,
        })
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    pub fn encode(&self, id: u64) -> String {
        let mut alphabet = self.alphabet.clone();
        let numbers_hash = id % 100;
        let lottery = alphabet[(numbers_hash % alphabet.len() as u64) as usize];

        let mut buffer = Vec::with_capacity(1 + self.salt.len() + alphabet.len());
        buffer.push(lottery);
        buffer.extend_from_slice(&self.salt);
        buffer.extend_from_slice(&alphabet);
        buffer.truncate(alphabet.len());
        shuffle(&mut alphabet, &buffer);

        let mut token = vec![lottery];
        token.extend(hash(id, &alphabet));

        if token.len() < self.min_length {
            let index = (numbers_hash + u64::from(token[0])) % self.guards.len() as u64;
            token.insert(0, self.guards[index as usize]);

            if token.len() < self.min_length {
                let index = (numbers_hash + u64::from(token[2])) % self.guards.len() as u64;
                token.push(self.guards[index as usize]);
            }
        }

        let half = alphabet.len() / 2;
        while token.len() < self.min_length {
            let salt = alphabet.clone();
            shuffle(&mut alphabet, &salt);

            let mut padded = Vec::with_capacity(alphabet.len() + token.len());
            padded.extend_from_slice(&alphabet[half..]);
            padded.extend_from_slice(&token);
            padded.extend_from_slice(&alphabet[..half]);
            token = padded;

            let excess = token.len().saturating_sub(self.min_length);
            if excess > 0 {
                let start = excess / 2;
                token = token[start..start + self.min_length].to_vec();
            }
        }

        token.into_iter().map(char::from).collect()
    }

    pub fn decode(&self, token: &str) -> Result<u64, NotDecodable> {
        if token.is_empty() || !token.bytes().all(|byte| self.in_charset(byte)) {
            return Err(NotDecodable);
        }

        let parts: Vec<&[u8]> = token
            .as_bytes()
            .split(|byte| self.guards.contains(byte))
            .collect();
        let breakdown = match parts.len() {
            2 | 3 => parts[1],
            _ => parts[0],
        };
        let Some((&lottery, rest)) = breakdown.split_first() else {
            return Err(NotDecodable);
        };

        let mut pieces = rest.split(|byte| self.separators.contains(byte));
        let (Some(piece), None) = (pieces.next(), pieces.next()) else {
            return Err(NotDecodable);
        };
        if piece.is_empty() {
            return Err(NotDecodable);
        }

        let mut alphabet = self.alphabet.clone();
        let mut buffer = Vec::with_capacity(1 + self.salt.len() + alphabet.len());
        buffer.push(lottery);
        buffer.extend_from_slice(&self.salt);
        buffer.extend_from_slice(&alphabet);
        buffer.truncate(alphabet.len());
        shuffle(&mut alphabet, &buffer);

        let id = unhash(piece, &alphabet).ok_or(NotDecodable)?;
        // only the canonical spelling of an id is accepted
        if self.encode(id) != token {
            return Err(NotDecodable);
        }
        Ok(id)
    }

    /// Cheap check for whether `candidate` could be a token.
    ///
    /// Never true for a string made only of ASCII digits, so a raw numeric id
    /// is never mistaken for an encoded one.
    pub fn looks_like_token(&self, candidate: &str) -> bool {
        !candidate.is_empty()
            && candidate.len() >= self.min_length.max(2)
            && candidate.bytes().all(|byte| self.in_charset(byte))
            && !candidate.bytes().all(|byte| byte.is_ascii_digit())
    }

    fn in_charset(&self, byte: u8) -> bool {
        self.charset
            .get(usize::from(byte))
            .copied()
            .unwrap_or(false)
    }
}

impl fmt::Debug for OpaqueIdCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueIdCodec")
            .field("min_length", &self.min_length)
            .field("alphabet_len", &self.alphabet.len())
            .finish_non_exhaustive()
    }
}

fn shuffle(alphabet: &mut [u8], salt: &[u8]) {
    if salt.is_empty() || alphabet.len() < 2 {
        return;
    }
    let mut v = 0usize;
    let mut p = 0usize;
    for i in (1..alphabet.len()).rev() {
        v %= salt.len();
        let integer = usize::from(salt[v]);
        p += integer;
        let j = (integer + v + p) % i;
        alphabet.swap(i, j);
        v += 1;
    }
}

fn hash(mut input: u64, alphabet: &[u8]) -> Vec<u8> {
    let len = alphabet.len() as u64;
    let mut out = Vec::new();
    loop {
        out.push(alphabet[(input % len) as usize]);
        input /= len;
        if input == 0 {
            break;
        }
    }
    out.reverse();
    out
}

fn unhash(input: &[u8], alphabet: &[u8]) -> Option<u64> {
    let len = alphabet.len() as u64;
    input.iter().try_fold(0u64, |number, byte| {
        let position = alphabet.iter().position(|candidate| candidate == byte)? as u64;
        number.checked_mul(len)?.checked_add(position)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(salt: &str, min_length: usize) -> OpaqueIdCodec {
        OpaqueIdCodec::new(&CodecParams {
            salt: salt.to_string(),
            min_length,
            alphabet: DEFAULT_ALPHABET.to_string(),
        })
        .expect("valid codec")
    }

    #[test]
    fn matches_reference_tokens() {
        assert_eq!(codec("this is my salt", 0).encode(12345), "NkK9");
        assert_eq!(codec("this is my salt", 8).encode(1), "gB0NV05e");
    }

    #[test]
    fn round_trips_across_the_range() {
        let codec = codec("sifter", DEFAULT_MIN_LENGTH);
        for id in [0, 1, 2, 42, 99, 100, 12_345, 987_654_321, u64::from(u32::MAX), u64::MAX] {
            let token = codec.encode(id);
            assert!(token.len() >= DEFAULT_MIN_LENGTH, "{token} too short");
            assert_eq!(codec.decode(&token), Ok(id), "token {token}");
        }
    }

    #[test]
    fn different_salts_yield_different_tokens() {
        assert_ne!(codec("one", 5).encode(7), codec("two", 5).encode(7));
    }

    #[test]
    fn malformed_tokens_are_not_decodable() {
        let codec = codec("sifter", DEFAULT_MIN_LENGTH);
        assert_eq!(codec.decode(""), Err(NotDecodable));
        assert_eq!(codec.decode("ab-cd"), Err(NotDecodable));
        assert_eq!(codec.decode("héllo"), Err(NotDecodable));
    }

    #[test]
    fn altered_tokens_do_not_decode_to_other_ids() {
        let codec = codec("sifter", DEFAULT_MIN_LENGTH);
        let token = codec.encode(42);
        let mut altered = token.clone();
        altered.push('x');
        match codec.decode(&altered) {
            Ok(id) => assert_eq!(codec.encode(id), altered),
            Err(NotDecodable) => {}
        }
    }

    #[test]
    fn numeric_strings_never_look_like_tokens() {
        let codec = codec("this is my salt", 8);
        for candidate in ["0", "42", "12345", "00000000"] {
            assert!(!codec.looks_like_token(candidate), "{candidate}");
        }
        assert!(codec.looks_like_token("gB0NV05e"));
        assert!(!codec.looks_like_token("gB0NV"));
        assert!(!codec.looks_like_token("has space"));
    }

    #[test]
    fn short_alphabets_are_rejected() {
        let err = OpaqueIdCodec::new(&CodecParams {
            salt: "x".to_string(),
            min_length: 0,
            alphabet: "abcdefg".to_string(),
        })
        .expect_err("alphabet too short");
        assert!(matches!(err, DomainError::Codec { .. }));
    }

    #[test]
    fn alphabets_with_spaces_are_rejected() {
        let params = CodecParams {
            alphabet: format!("{DEFAULT_ALPHABET} "),
            ..CodecParams::default()
        };
        assert!(OpaqueIdCodec::new(&params).is_err());
    }

    #[test]
    fn alphabets_with_separators_are_rejected() {
        for reserved in [',', ';', ':', '\\', '&', '=', '+', '%', '#'] {
            let params = CodecParams {
                alphabet: format!("{DEFAULT_ALPHABET}{reserved}"),
                ..CodecParams::default()
            };
            assert!(
                OpaqueIdCodec::new(&params).is_err(),
                "{reserved:?} should be rejected"
            );
        }
    }

    #[test]
    fn debug_output_hides_the_salt() {
        let params = CodecParams {
            salt: "hunter2".to_string(),
            ..CodecParams::default()
        };
        assert!(!format!("{params:?}").contains("hunter2"));
    }
}
