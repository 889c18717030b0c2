//! Identifier helpers

use bech32::Bech32m;
use uuid7::uuid7;

use super::error::{LoanError, Result};

pub const REQUEST_HRP: &str = "req_";
pub const USER_HRP: &str = "user_";
pub const BRANCH_HRP: &str = "branch_";
pub const NOTE_HRP: &str = "note_";
pub const SMS_HRP: &str = "sms_";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| LoanError::validation(e.to_string()))?;
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| LoanError::validation(e.to_string()))
}

/// Human readable request number, e.g. `TRN-000042`.
pub fn request_number(prefix: &str, sequence: u64) -> String {
    format!("{prefix}-{sequence:06}")
}

/// `true` when `value` is non-empty and only ASCII digits.
pub fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        let id = new_uuid_to_bech32(REQUEST_HRP).unwrap();
        assert!(id.starts_with("req_1"));
        assert_ne!(id, new_uuid_to_bech32(REQUEST_HRP).unwrap());
    }

    #[test]
    fn empty_hrp_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    #[test]
    fn request_numbers_are_zero_padded() {
        assert_eq!(request_number("TRN", 7), "TRN-000007");
        assert_eq!(request_number("LN", 1_234_567), "LN-1234567");
    }
}
