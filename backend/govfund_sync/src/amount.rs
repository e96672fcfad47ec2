//! Conversion between human-readable ether amounts and integer wei.
//!
//! Everything that crosses the contract boundary is wei. Decimal strings only
//! exist at the edge (HTTP payloads, log lines) and are converted here,
//! exactly, without trimming or reformatting the input first.

use alloy_primitives::utils::{format_units, parse_units};
use alloy_primitives::U256;

use crate::errors::{Result, SyncError};

const ETHER_DECIMALS: u8 = 18;

/// Parse a decimal ether string (`"1"`, `"1.0"`, `"0.000000000000000001"`)
/// into wei.
pub fn parse_ether(input: &str) -> Result<U256> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Validation("amount is empty".to_string()));
    }
    if trimmed.starts_with('-') {
        return Err(SyncError::Validation(format!(
            "amount must not be negative: {trimmed}"
        )));
    }
    if !trimmed.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(SyncError::Validation(format!("malformed amount: {trimmed}")));
    }
    if let Some((_, fraction)) = trimmed.split_once('.') {
        if fraction.len() > ETHER_DECIMALS as usize {
            return Err(SyncError::Validation(format!(
                "amount has more than {ETHER_DECIMALS} decimal places: {trimmed}"
            )));
        }
    }

    parse_units(trimmed, ETHER_DECIMALS)
        .map(Into::into)
        .map_err(|e| SyncError::Validation(format!("malformed amount {trimmed}: {e}")))
}

/// Render wei as a decimal ether string with all 18 decimals.
pub fn format_ether(wei: U256) -> String {
    // 18 decimals is always within range for format_units.
    format_units(wei, ETHER_DECIMALS).unwrap_or_else(|_| wei.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_zero_fraction_is_preserved() {
        assert_eq!(
            parse_ether("1.0").unwrap(),
            U256::from(1_000_000_000_000_000_000u128)
        );
        assert_eq!(
            parse_ether("10").unwrap(),
            U256::from(10_000_000_000_000_000_000u128)
        );
        assert_eq!(
            parse_ether("1.50").unwrap(),
            U256::from(1_500_000_000_000_000_000u128)
        );
    }

    #[test]
    fn smallest_unit() {
        assert_eq!(parse_ether("0.000000000000000001").unwrap(), U256::from(1u8));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_ether("").is_err());
        assert!(parse_ether("-1").is_err());
        assert!(parse_ether("1e18").is_err());
        assert!(parse_ether("abc").is_err());
        assert!(parse_ether("0.0000000000000000001").is_err());
    }

    #[test]
    fn formats_exactly() {
        assert_eq!(
            format_ether(U256::from(1_500_000_000_000_000_000u128)),
            "1.500000000000000000"
        );
        assert_eq!(format_ether(U256::from(1u8)), "0.000000000000000001");
    }
}
