//! VNC authentication: security type selection and the legacy DES
//! challenge-response (RFC 6143 §7.2.2).

use crate::rfb::types::{RfbError, SecurityType};
use cipher::{BlockEncrypt, KeyInit};
use des::Des;

/// Pick a security type from the server's offer.
///
/// VNC authentication is chosen iff it is offered and a password is
/// configured; otherwise None when offered. An offer containing only
/// VNC authentication without a configured password is an error, as is
/// an offer with no supported type at all.
pub fn select_security_type(
    offered: &[u8],
    has_password: bool,
) -> Result<SecurityType, RfbError> {
    let offers = |t: SecurityType| offered.contains(&t.to_byte());

    if has_password && offers(SecurityType::VncAuthentication) {
        return Ok(SecurityType::VncAuthentication);
    }
    if offers(SecurityType::None) {
        return Ok(SecurityType::None);
    }
    if offers(SecurityType::VncAuthentication) {
        return Err(RfbError::auth_required());
    }
    Err(RfbError::protocol("no supported security type"))
}

/// Encrypt a 16-byte VNC authentication challenge.
///
/// The password (first 8 bytes, zero-padded) becomes the DES key after
/// each byte's bit order is reversed (RFC 6143 Errata 4951). The two
/// 8-byte challenge halves are encrypted independently in ECB mode and
/// concatenated.
pub fn encrypt_challenge(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let key = make_des_key(password);

    let mut response = [0u8; 16];
    response[..8].copy_from_slice(&des_encrypt_block(&key, &challenge[..8]));
    response[8..].copy_from_slice(&des_encrypt_block(&key, &challenge[8..]));
    response
}

/// Derive the DES key from a VNC password: truncate/zero-pad to 8 bytes,
/// then reverse the bits of each byte.
fn make_des_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    let bytes = password.as_bytes();
    let n = bytes.len().min(8);
    key[..n].copy_from_slice(&bytes[..n]);
    for b in &mut key {
        *b = reverse_bits(*b);
    }
    key
}

/// Reverse the bit order of a byte (LSB becomes MSB).
fn reverse_bits(mut b: u8) -> u8 {
    let mut out = 0u8;
    for _ in 0..8 {
        out = (out << 1) | (b & 1);
        b >>= 1;
    }
    out
}

/// DES ECB encryption of one 8-byte block.
fn des_encrypt_block(key: &[u8; 8], block: &[u8]) -> [u8; 8] {
    let cipher = Des::new_from_slice(key).expect("DES key must be 8 bytes");
    let mut buf = cipher::generic_array::GenericArray::clone_from_slice(&block[..8]);
    cipher.encrypt_block(&mut buf);
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::types::RfbErrorKind;

    // ── reverse_bits ────────────────────────────────────────────────

    #[test]
    fn reverse_bits_cases() {
        assert_eq!(reverse_bits(0x00), 0x00);
        assert_eq!(reverse_bits(0x01), 0x80);
        assert_eq!(reverse_bits(0xFF), 0xFF);
        // 0x0A = 00001010 -> 01010000 = 0x50
        assert_eq!(reverse_bits(0x0A), 0x50);
    }

    #[test]
    fn reverse_bits_involution() {
        for b in 0..=255u8 {
            assert_eq!(reverse_bits(reverse_bits(b)), b);
        }
    }

    // ── make_des_key ────────────────────────────────────────────────

    #[test]
    fn key_from_empty_password_is_zero() {
        assert_eq!(make_des_key(""), [0u8; 8]);
    }

    #[test]
    fn key_pads_short_password() {
        let key = make_des_key("abc");
        assert_eq!(key[0], reverse_bits(b'a'));
        assert_eq!(key[1], reverse_bits(b'b'));
        assert_eq!(key[2], reverse_bits(b'c'));
        assert_eq!(&key[3..], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn key_truncates_long_password() {
        let key = make_des_key("longpassword");
        assert_eq!(key[7], reverse_bits(b'w'));
    }

    // ── des_encrypt_block ───────────────────────────────────────────

    #[test]
    fn des_known_vector_nist() {
        // Key 0123456789ABCDEF, plaintext "Now is t".
        let key = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];
        let plaintext = *b"Now is t";
        assert_eq!(
            des_encrypt_block(&key, &plaintext),
            [0x3F, 0xA4, 0x0E, 0x8A, 0x98, 0x4D, 0x48, 0x15]
        );
    }

    #[test]
    fn des_zero_key_zero_block() {
        assert_eq!(
            des_encrypt_block(&[0u8; 8], &[0u8; 8]),
            [0x8C, 0xA6, 0x4D, 0xE9, 0xC1, 0xB1, 0x23, 0xA7]
        );
    }

    // ── encrypt_challenge ───────────────────────────────────────────

    #[test]
    fn empty_password_zero_challenge_reference() {
        // Empty password -> all-zero key; each half is DES(0, 0).
        let response = encrypt_challenge("", &[0u8; 16]);
        let block = [0x8C, 0xA6, 0x4D, 0xE9, 0xC1, 0xB1, 0x23, 0xA7];
        assert_eq!(&response[..8], &block);
        assert_eq!(&response[8..], &block);
    }

    #[test]
    fn identical_halves_encrypt_identically() {
        let challenge = [7u8; 16];
        let response = encrypt_challenge("secret", &challenge);
        assert_eq!(response[..8], response[8..]);
        assert_ne!(&response[..8], &challenge[..8]);
    }

    #[test]
    fn distinct_halves_encrypt_distinctly() {
        let mut challenge = [0u8; 16];
        challenge[8] = 1;
        let response = encrypt_challenge("secret", &challenge);
        assert_ne!(response[..8], response[8..]);
    }

    #[test]
    fn deterministic() {
        let challenge = [42u8; 16];
        assert_eq!(
            encrypt_challenge("test", &challenge),
            encrypt_challenge("test", &challenge)
        );
    }

    #[test]
    fn different_passwords_differ() {
        let challenge = [42u8; 16];
        assert_ne!(
            encrypt_challenge("pass1", &challenge),
            encrypt_challenge("pass2", &challenge)
        );
    }

    #[test]
    fn password_beyond_eight_bytes_ignored() {
        let challenge = [3u8; 16];
        assert_eq!(
            encrypt_challenge("12345678", &challenge),
            encrypt_challenge("12345678ignored", &challenge)
        );
    }

    // ── select_security_type ────────────────────────────────────────

    #[test]
    fn selects_vnc_auth_when_password_present() {
        let t = select_security_type(&[1, 2], true).unwrap();
        assert_eq!(t, SecurityType::VncAuthentication);
    }

    #[test]
    fn selects_none_without_password() {
        let t = select_security_type(&[1, 2], false).unwrap();
        assert_eq!(t, SecurityType::None);
    }

    #[test]
    fn selects_none_when_only_none_offered() {
        let t = select_security_type(&[1], true).unwrap();
        assert_eq!(t, SecurityType::None);
    }

    #[test]
    fn vnc_auth_only_without_password_is_auth_required() {
        let err = select_security_type(&[2], false).unwrap_err();
        assert_eq!(err.kind, RfbErrorKind::AuthRequired);
    }

    #[test]
    fn unsupported_offer_is_protocol_error() {
        let err = select_security_type(&[16, 19], true).unwrap_err();
        assert_eq!(err.kind, RfbErrorKind::ProtocolError);
    }

    #[test]
    fn empty_offer_is_protocol_error() {
        assert!(select_security_type(&[], true).is_err());
    }
}
