//! Value operators and the comparison ladder.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::value::Value;

/// Operators usable inside stored expressions and registered binary ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Assign,
    MemberGet,
    Call,
}

/// Comparison methods available to trigger conditions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareMethod {
    #[default]
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl CompareMethod {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "==" | "=" => Some(Self::Equal),
            "!=" | "<>" => Some(Self::NotEqual),
            "<" => Some(Self::LessThan),
            "<=" => Some(Self::LessThanOrEqual),
            ">" => Some(Self::GreaterThan),
            ">=" => Some(Self::GreaterThanOrEqual),
            _ => None,
        }
    }

    pub fn inverted(self) -> Self {
        match self {
            Self::Equal => Self::NotEqual,
            Self::NotEqual => Self::Equal,
            Self::LessThan => Self::GreaterThanOrEqual,
            Self::LessThanOrEqual => Self::GreaterThan,
            Self::GreaterThan => Self::LessThanOrEqual,
            Self::GreaterThanOrEqual => Self::LessThan,
        }
    }

    pub fn operator(self) -> ValueOperator {
        match self {
            Self::Equal => ValueOperator::Equal,
            Self::NotEqual => ValueOperator::NotEqual,
            Self::LessThan => ValueOperator::LessThan,
            Self::LessThanOrEqual => ValueOperator::LessThanOrEqual,
            Self::GreaterThan => ValueOperator::GreaterThan,
            Self::GreaterThanOrEqual => ValueOperator::GreaterThanOrEqual,
        }
    }

    pub fn from_operator(op: ValueOperator) -> Option<Self> {
        match op {
            ValueOperator::Equal => Some(Self::Equal),
            ValueOperator::NotEqual => Some(Self::NotEqual),
            ValueOperator::LessThan => Some(Self::LessThan),
            ValueOperator::LessThanOrEqual => Some(Self::LessThanOrEqual),
            ValueOperator::GreaterThan => Some(Self::GreaterThan),
            ValueOperator::GreaterThanOrEqual => Some(Self::GreaterThanOrEqual),
            _ => None,
        }
    }
}

/// Equality ladder: exact match, then string-aware compare, then numeric
/// coercion, then a registered binary operator. If every rung fails and the
/// operator result cannot coerce to bool, the answer is false.
pub fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if lhs.is_empty() || rhs.is_empty() {
        return false;
    }

    if lhs.type_id() == rhs.type_id() && lhs.eq_exact(rhs) {
        return true;
    }

    if lhs.is_string() || rhs.is_string() {
        if let (Some(a), Some(b)) = (lhs.display_string(), rhs.display_string()) {
            if a == b {
                return true;
            }
        }
    }

    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        if a == b {
            return true;
        }
    }

    lhs.apply_registered_op(ValueOperator::Equal, rhs)
        .as_bool()
        .unwrap_or(false)
}

/// Ordering ladder: same-type ordering, numeric coercion, string compare.
pub fn values_ordering(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    if let Some(ordering) = lhs.cmp_exact(rhs) {
        return Some(ordering);
    }
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return a.partial_cmp(&b);
    }
    if lhs.is_string() && rhs.is_string() {
        return Some(lhs.as_str()?.cmp(rhs.as_str()?));
    }
    None
}

/// Evaluate a comparison between two resolved operands.
pub fn compare_values(lhs: &Value, rhs: &Value, method: CompareMethod) -> bool {
    match method {
        CompareMethod::Equal => values_equal(lhs, rhs),
        CompareMethod::NotEqual => !values_equal(lhs, rhs),
        ordering_method => {
            if let Some(ordering) = values_ordering(lhs, rhs) {
                return match ordering_method {
                    CompareMethod::LessThan => ordering == Ordering::Less,
                    CompareMethod::LessThanOrEqual => ordering != Ordering::Greater,
                    CompareMethod::GreaterThan => ordering == Ordering::Greater,
                    CompareMethod::GreaterThanOrEqual => ordering != Ordering::Less,
                    _ => unreachable!(),
                };
            }

            // Last rung: a registered operator whose result coerces to bool.
            lhs.apply_registered_op(ordering_method.operator(), rhs)
                .as_bool()
                .unwrap_or(false)
        }
    }
}

/// Apply an arithmetic or comparison operator, producing a new value.
///
/// Integer operands stay integral; mixed or float operands evaluate in f64.
/// `Add` concatenates strings. Anything unsupported falls back to a
/// registered binary operator, then to an empty value.
pub fn apply_binary(op: ValueOperator, lhs: &Value, rhs: &Value) -> Value {
    if let Some(method) = CompareMethod::from_operator(op) {
        return Value::new(compare_values(lhs, rhs, method));
    }

    match op {
        ValueOperator::Add if lhs.is_string() || rhs.is_string() => {
            if let (Some(a), Some(b)) = (lhs.display_string(), rhs.display_string()) {
                return Value::new(a + &b);
            }
        }
        ValueOperator::Add
        | ValueOperator::Subtract
        | ValueOperator::Multiply
        | ValueOperator::Divide
        | ValueOperator::Modulus => {
            let integral = lhs.get_ref::<i64>().is_some() && rhs.get_ref::<i64>().is_some()
                || lhs.get_ref::<i32>().is_some() && rhs.get_ref::<i32>().is_some();
            if integral {
                if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
                    return match op {
                        ValueOperator::Add => Value::new(a.wrapping_add(b)),
                        ValueOperator::Subtract => Value::new(a.wrapping_sub(b)),
                        ValueOperator::Multiply => Value::new(a.wrapping_mul(b)),
                        ValueOperator::Divide if b != 0 => Value::new(a / b),
                        ValueOperator::Modulus if b != 0 => Value::new(a % b),
                        _ => {
                            warn!("integer division by zero in expression");
                            Value::empty()
                        }
                    };
                }
            }
            if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
                return match op {
                    ValueOperator::Add => Value::new(a + b),
                    ValueOperator::Subtract => Value::new(a - b),
                    ValueOperator::Multiply => Value::new(a * b),
                    ValueOperator::Divide => Value::new(a / b),
                    ValueOperator::Modulus => Value::new(a % b),
                    _ => Value::empty(),
                };
            }
        }
        _ => {}
    }

    let fallback = lhs.apply_registered_op(op, rhs);
    if fallback.is_empty() {
        warn!(?op, "binary operator unsupported for operand types");
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_exact_and_coerced() {
        assert!(values_equal(&Value::new(3i64), &Value::new(3i64)));
        assert!(values_equal(&Value::new(3i32), &Value::new(3.0f64)));
        assert!(!values_equal(&Value::new(3i64), &Value::new(4i64)));
    }

    #[test]
    fn test_string_aware_compare() {
        assert!(values_equal(
            &Value::new("7".to_string()),
            &Value::new(7i64)
        ));
        assert!(!values_equal(
            &Value::new("seven".to_string()),
            &Value::new(7i64)
        ));
    }

    #[test]
    fn test_ordering_methods() {
        let two = Value::new(2i64);
        let three = Value::new(3.0f64);
        assert!(compare_values(&two, &three, CompareMethod::LessThan));
        assert!(compare_values(&three, &two, CompareMethod::GreaterThanOrEqual));
        assert!(!compare_values(&two, &three, CompareMethod::GreaterThan));
    }

    #[test]
    fn test_non_boolean_mismatch_is_false() {
        // No comparison path exists between these operand types.
        struct Marker;
        crate::value::ensure_registered::<Marker>("OpsMarker");
        let odd = Value::new(Marker);
        assert!(!compare_values(&odd, &Value::new(1i64), CompareMethod::Equal));
        assert!(!compare_values(
            &odd,
            &Value::new(1i64),
            CompareMethod::LessThan
        ));
    }

    #[test]
    fn test_arithmetic() {
        let sum = apply_binary(ValueOperator::Add, &Value::new(2i64), &Value::new(5i64));
        assert_eq!(sum.as_i64(), Some(7));
        let product = apply_binary(ValueOperator::Multiply, &Value::new(2.5f64), &Value::new(4i64));
        assert_eq!(product.as_f64(), Some(10.0));
        let concat = apply_binary(
            ValueOperator::Add,
            &Value::new("a".to_string()),
            &Value::new("b".to_string()),
        );
        assert_eq!(concat.as_str(), Some("ab"));
    }

    #[test]
    fn test_comparison_inversion() {
        assert_eq!(CompareMethod::parse("<"), Some(CompareMethod::LessThan));
        assert_eq!(
            CompareMethod::LessThan.inverted(),
            CompareMethod::GreaterThanOrEqual
        );
    }
}
