use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Converts a wire micro-currency integer into a decimal amount.
pub fn micros_to_amount(micros: i64) -> Decimal {
    Decimal::from(micros) / Decimal::from(1_000_000i64)
}

/// Converts a decimal amount into the wire micro-currency integer.
pub fn amount_to_micros(amount: Decimal) -> i64 {
    (amount * Decimal::from(1_000_000i64))
        .round()
        .to_i64()
        .unwrap_or(0)
}

/// Lossy conversion for JSON payloads whose columns are plain numerics.
pub fn amount_to_f64(amount: Decimal) -> f64 {
    amount.to_f64().unwrap_or(0.0)
}
