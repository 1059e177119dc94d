use ethers::types::{H256, U256};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Largest scale `Decimal` can carry.
const MAX_DECIMAL_SCALE: u32 = 28;

/// Largest mantissa `Decimal` can carry (2^96 - 1).
const MAX_DECIMAL_MANTISSA: u128 = 79_228_162_514_264_337_593_543_950_335;

/// Converts a raw on-chain magnitude into a decimal using the asset's declared precision.
///
/// Digits that `Decimal` cannot represent are truncated from the low end, so magnitudes
/// below the representable precision resolve to zero instead of failing.
pub fn raw_to_decimal(raw: U256, precision: u32) -> Result<Decimal, ConversionError> {
    let mut mantissa = raw;
    let mut scale = precision;

    while scale > MAX_DECIMAL_SCALE {
        mantissa /= U256::from(10u8);
        scale -= 1;
    }

    while mantissa > U256::from(MAX_DECIMAL_MANTISSA) {
        if scale == 0 {
            return Err(ConversionError::Overflow);
        }
        mantissa /= U256::from(10u8);
        scale -= 1;
    }

    let mantissa: u128 = mantissa.try_into().map_err(|_| ConversionError::Overflow)?;
    let mantissa = i128::try_from(mantissa).map_err(|_| ConversionError::Overflow)?;

    Decimal::try_from_i128_with_scale(mantissa, scale)
        .map(|d| d.normalize())
        .map_err(|e| ConversionError::InvalidDecimal(e.to_string()))
}

pub fn u128_to_decimal(raw: u128, precision: u32) -> Result<Decimal, ConversionError> {
    raw_to_decimal(U256::from(raw), precision)
}

/// Hex form used for ids in logs, storage rows and config files.
pub fn h256_to_string(value: &H256) -> String {
    format!("0x{}", hex::encode(value.as_bytes()))
}

pub fn string_to_h256(s: &str) -> Result<H256, ConversionError> {
    H256::from_str(s.trim()).map_err(|e| ConversionError::InvalidId(format!("{s}: {e}")))
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),
    #[error("Overflow in conversion")]
    Overflow,
    #[error("Invalid id: {0}")]
    InvalidId(String),
}
