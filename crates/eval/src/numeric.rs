//! Numeric model using `rust_decimal`.
//!
//! JSON numbers are converted to `Decimal` for every comparison and
//! arithmetic operation, so `0.1 + 0.2 == 0.3` holds in policy conditions.
//! Division rounds with `RoundingStrategy::MidpointNearestEven`.

use std::cmp::Ordering;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sieve_interchange::BinaryOperator;

use crate::error::EvalError;

/// Scale applied to quotients before they are handed back as JSON.
const DIVISION_SCALE: u32 = 20;

/// Convert a JSON number to a Decimal without going through `f64`.
pub fn to_decimal(n: &serde_json::Number) -> Result<Decimal, EvalError> {
    if let Some(i) = n.as_i64() {
        return Ok(Decimal::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Ok(Decimal::from(u));
    }
    let text = n.to_string();
    Decimal::from_str_exact(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .or_else(|_| Decimal::from_str(&text))
        .map_err(|e| EvalError::arithmetic(format!("number {} out of range: {}", text, e)))
}

/// Convert a Decimal result back into a JSON number.
///
/// Integral results that fit an `i64` stay integers; everything else
/// becomes a JSON float.
pub fn from_decimal(d: Decimal) -> Result<serde_json::Value, EvalError> {
    let d = d.normalize();
    if d.scale() == 0 {
        if let Some(i) = d.to_i64() {
            return Ok(serde_json::Value::from(i));
        }
    }
    d.to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
        .ok_or_else(|| EvalError::arithmetic(format!("{} cannot be represented as JSON", d)))
}

/// Compare two decimals.
pub fn compare(left: Decimal, right: Decimal) -> Ordering {
    left.cmp(&right)
}

/// Evaluate an arithmetic operator over two decimals.
pub fn arithmetic(
    op: BinaryOperator,
    left: Decimal,
    right: Decimal,
) -> Result<Decimal, EvalError> {
    let overflow = || EvalError::arithmetic(format!("{} overflow", op.symbol()));
    match op {
        BinaryOperator::Add => left.checked_add(right).ok_or_else(overflow),
        BinaryOperator::Sub => left.checked_sub(right).ok_or_else(overflow),
        BinaryOperator::Mul => left.checked_mul(right).ok_or_else(overflow),
        BinaryOperator::Div => {
            if right.is_zero() {
                return Err(EvalError::arithmetic("division by zero"));
            }
            let quotient = left.checked_div(right).ok_or_else(overflow)?;
            Ok(quotient.round_dp_with_strategy(DIVISION_SCALE, RoundingStrategy::MidpointNearestEven))
        }
        BinaryOperator::Mod => {
            if right.is_zero() {
                return Err(EvalError::arithmetic("remainder by zero"));
            }
            left.checked_rem(right).ok_or_else(overflow)
        }
        other => Err(EvalError::type_mismatch(format!(
            "'{}' is not an arithmetic operator",
            other.symbol()
        ))),
    }
}

/// Negate a decimal.
pub fn negate(value: Decimal) -> Decimal {
    -value
}
