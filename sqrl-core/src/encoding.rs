//! Base64URL (unpadded), Base56/Base56Check (checksummed textual identity
//! encoding) and the rescue-code digit encoding used to turn 32 bytes of
//! entropy into the 24-decimal-digit string shown to the user once.

use crate::error::{Result, SqrlError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn base64url_decode(s: &str) -> Result<Vec<u8>> {
    Ok(URL_SAFE_NO_PAD.decode(s)?)
}

/// Alphabet for Base56: digits and letters with visually ambiguous
/// characters (0, O, I, l) removed.
const BASE56_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const BASE56_LINE_LEN: usize = 19;

fn base56_digit(value: u8) -> u8 {
    BASE56_ALPHABET[value as usize]
}

fn base56_value(ch: u8) -> Result<u8> {
    BASE56_ALPHABET
        .iter()
        .position(|&c| c == ch)
        .map(|p| p as u8)
        .ok_or(SqrlError::Encoding("character not in base56 alphabet"))
}

/// Encodes `data` as a big-integer in base 56, without checksums.
pub fn base56_encode(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    let mut digits: Vec<u8> = data.to_vec();
    let mut out = Vec::new();
    while digits.iter().any(|&b| b != 0) {
        let mut remainder: u32 = 0;
        for byte in digits.iter_mut() {
            let acc = (remainder << 8) | *byte as u32;
            *byte = (acc / 56) as u8;
            remainder = acc % 56;
        }
        out.push(base56_digit(remainder as u8));
    }
    // preserve leading zero bytes as leading "first alphabet char" digits
    let leading_zeros = data.iter().take_while(|&&b| b == 0).count();
    for _ in 0..leading_zeros {
        out.push(base56_digit(0));
    }
    out.reverse();
    String::from_utf8(out).expect("alphabet is ASCII")
}

pub fn base56_decode(s: &str) -> Result<Vec<u8>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    let mut bytes = vec![0u8];
    for ch in s.bytes() {
        let value = base56_value(ch)? as u32;
        let mut carry = value;
        for b in bytes.iter_mut().rev() {
            let acc = (*b as u32) * 56 + carry;
            *b = (acc & 0xff) as u8;
            carry = acc >> 8;
        }
        while carry > 0 {
            bytes.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let leading_zero_digits = s.bytes().take_while(|&c| c == BASE56_ALPHABET[0]).count();
    while bytes.len() < leading_zero_digits {
        bytes.insert(0, 0);
    }
    Ok(bytes)
}

/// `check digit = line-index + SHA-256(line + previous-check) mod 56` — the
/// index is folded in modularly after the hash, not as hash input.
fn line_checksum(line: &[u8], line_index: usize, previous_check: u8) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(line);
    hasher.update([previous_check]);
    let digest = hasher.finalize();
    ((line_index + digest[0] as usize) % 56) as u8
}

/// Base56 grouped into 19-character lines, each terminated by a one-digit
/// checksum binding it to the line index and the previous line's checksum.
pub fn base56check_encode(data: &[u8]) -> String {
    let plain = base56_encode(data);
    let mut out = String::new();
    let mut previous_check = 0u8;
    for (index, chunk) in plain.as_bytes().chunks(BASE56_LINE_LEN).enumerate() {
        let check = line_checksum(chunk, index, previous_check);
        out.push_str(std::str::from_utf8(chunk).expect("alphabet is ASCII"));
        out.push(base56_digit(check) as char);
        previous_check = check;
    }
    out
}

pub fn base56check_decode(s: &str) -> Result<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut plain = Vec::new();
    let mut previous_check = 0u8;
    let mut index = 0usize;
    let mut offset = 0usize;
    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        let line_len = remaining.min(BASE56_LINE_LEN + 1);
        if line_len < 2 {
            return Err(SqrlError::Encoding("base56check line too short"));
        }
        let chunk = &bytes[offset..offset + line_len - 1];
        let check_char = bytes[offset + line_len - 1];
        let expected = line_checksum(chunk, index, previous_check);
        if base56_value(check_char)? != expected {
            return Err(SqrlError::Encoding("base56check checksum mismatch"));
        }
        plain.extend_from_slice(chunk);
        previous_check = expected;
        index += 1;
        offset += line_len;
    }
    base56_decode(std::str::from_utf8(&plain).expect("alphabet is ASCII"))
}

/// Converts 64 bytes (512 bits) of entropy into a 24-digit decimal rescue
/// code. The entropy is read as eight little-endian `u64` words; three
/// decimal digits are peeled off the low end of every word in turn, for
/// three passes, matching the reference implementation's `bin2rc` digit
/// interleaving (word0-digit0, word1-digit0, ..., word7-digit0,
/// word0-digit1, ...). Three digits per 64-bit word is ~9.97 bits each,
/// for 79.7 bits of entropy across the 24-digit code.
pub fn rescue_code_from_entropy(entropy: &[u8; 64]) -> String {
    let mut words = [0u64; 8];
    for (word, chunk) in words.iter_mut().zip(entropy.chunks(8)) {
        *word = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
    }
    let mut digits = [0u8; 24];
    let mut pos = 0;
    for _pass in 0..3 {
        for word in words.iter_mut() {
            digits[pos] = (*word % 10) as u8;
            *word /= 10;
            pos += 1;
        }
    }
    digits.iter().map(|&d| (b'0' + d) as char).collect()
}

/// Groups a 24-digit rescue code into the three 8-digit lines shown to users.
pub fn format_rescue_code(digits: &str) -> String {
    digits
        .as_bytes()
        .chunks(8)
        .map(|c| std::str::from_utf8(c).expect("ascii digits"))
        .collect::<Vec<_>>()
        .join("-")
}
