use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::errors::EngineError;

type HmacSha256 = Hmac<Sha256>;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const TOTP_DIGITS: u32 = 6;
const SECRET_BYTES: usize = 32;

/// Random shared secret, base32 encoded without padding.
pub fn generate_totp_secret() -> String {
    let mut bytes = [0_u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    base32_encode(&bytes)
}

pub fn base32_encode(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut buffer: u32 = 0;
    let mut bits = 0_u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            let index = (buffer >> (bits - 5)) & 0x1f;
            output.push(char::from(BASE32_ALPHABET[index as usize]));
            bits -= 5;
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        let index = (buffer << (5 - bits)) & 0x1f;
        output.push(char::from(BASE32_ALPHABET[index as usize]));
    }
    output
}

pub fn base32_decode(encoded: &str) -> Result<Vec<u8>, EngineError> {
    let mut output = Vec::with_capacity(encoded.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0_u32;
    for raw in encoded.bytes().filter(|byte| *byte != b'=' && *byte != b' ') {
        let upper = raw.to_ascii_uppercase();
        let value = BASE32_ALPHABET
            .iter()
            .position(|candidate| *candidate == upper)
            .ok_or_else(|| EngineError::Internal("totp secret is not base32".to_string()))?;
        buffer = (buffer << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            output.push(((buffer >> (bits - 8)) & 0xff) as u8);
            bits -= 8;
        }
        buffer &= (1 << bits) - 1;
    }
    Ok(output)
}

pub fn time_step(unix_seconds: i64, step_seconds: i64) -> i64 {
    unix_seconds.div_euclid(step_seconds.max(1))
}

/// RFC 6238 code for one time step, HMAC-SHA256 with dynamic truncation.
pub fn totp_code(secret: &str, step: i64) -> Result<String, EngineError> {
    let key = base32_decode(secret)?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|error| EngineError::Internal(format!("failed to initialize totp mac: {error}")))?;
    mac.update(&step.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let binary = (u32::from(digest[offset]) & 0x7f) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]);
    let code = binary % 10_u32.pow(TOTP_DIGITS);
    Ok(format!("{code:0width$}", width = TOTP_DIGITS as usize))
}

/// Returns the matched step when `code` is valid within `±skew_steps` of
/// `unix_seconds`. Steps at or before `last_accepted_step` never match.
pub fn verify_totp(
    secret: &str,
    code: &str,
    unix_seconds: i64,
    step_seconds: i64,
    skew_steps: i64,
    last_accepted_step: Option<i64>,
) -> Result<Option<i64>, EngineError> {
    let code = code.trim();
    if code.len() != TOTP_DIGITS as usize || !code.bytes().all(|byte| byte.is_ascii_digit()) {
        return Ok(None);
    }
    let current = time_step(unix_seconds, step_seconds);
    for step in (current - skew_steps)..=(current + skew_steps) {
        if last_accepted_step.is_some_and(|last| step <= last) {
            continue;
        }
        if totp_code(secret, step)? == code {
            return Ok(Some(step));
        }
    }
    Ok(None)
}

pub fn provisioning_uri(issuer: &str, account: &str, secret: &str, step_seconds: i64) -> String {
    format!(
        "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}&algorithm=SHA256&digits={TOTP_DIGITS}&period={step_seconds}",
        issuer = percent_encode(issuer),
        account = percent_encode(account),
    )
}

fn percent_encode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~' | b'@') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
