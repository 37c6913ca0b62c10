//! Implements the slightly odd "base32" encoding that's used in Nix.
//!
//! Nix uses a custom alphabet, never pads, and emits the 5-bit groups of
//! the input starting with the most significant one. That last part is why
//! `data_encoding::Encoding` can't be used here.

use thiserror::Error;

const ALPHABET: &[u8; 32] = b"0123456789abcdfghijklmnpqrsvwxyz";

/// Errors that can occur while decoding nixbase32-encoded data.
#[derive(Debug, Eq, PartialEq, Error)]
pub enum Nixbase32DecodeError {
    #[error("character {0:x} not in alphabet")]
    CharacterNotInAlphabet(u8),
    #[error("nonzero carry")]
    NonzeroCarry(),
}

/// Returns the encoded length of an input of length len.
pub const fn encode_len(len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    (len * 8 - 1) / 5 + 1
}

/// Returns the decoded length of an input of length len.
pub const fn decode_len(len: usize) -> usize {
    (len * 5) / 8
}

/// Extracts the 5-bit group starting at bit offset `bit` of `input`.
fn group_at(input: &[u8], bit: usize) -> u8 {
    let (byte, shift) = (bit / 8, bit % 8);
    let low = (input[byte] as u16) >> shift;
    let high = input
        .get(byte + 1)
        .map_or(0, |next| (*next as u16) << (8 - shift));

    ((low | high) & 0x1f) as u8
}

/// Returns encoded input
pub fn encode(input: &[u8]) -> String {
    (0..encode_len(input.len()))
        .rev()
        .map(|n| ALPHABET[group_at(input, n * 5) as usize] as char)
        .collect()
}

/// Maps a nixbase32 character to its index in the alphabet.
fn decode_char(c: u8) -> Option<u8> {
    ALPHABET.iter().position(|a| *a == c).map(|pos| pos as u8)
}

/// Returns decoded input
pub fn decode(input: &[u8]) -> Result<Vec<u8>, Nixbase32DecodeError> {
    let mut output = vec![0u8; decode_len(input.len())];

    // characters are consumed from the end, least significant group first.
    for (n, c) in input.iter().rev().enumerate() {
        let value = decode_char(*c).ok_or(Nixbase32DecodeError::CharacterNotInAlphabet(*c))?;

        let (byte, shift) = (n * 5 / 8, n * 5 % 8);
        let shifted = (value as u16) << shift;

        for (idx, part) in [(byte, shifted as u8), (byte + 1, (shifted >> 8) as u8)] {
            if part == 0 {
                continue;
            }
            // bits that don't fit into the output make the encoding invalid.
            match output.get_mut(idx) {
                Some(out) => *out |= part,
                None => return Err(Nixbase32DecodeError::NonzeroCarry()),
            }
        }
    }

    Ok(output)
}
