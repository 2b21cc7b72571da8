use crate::value::Value;
use std::cmp::Ordering;

/// Total canonical comparator used by ordering, distinct and grouping.
///
/// Ordering rules:
/// 1. Canonical variant rank
/// 2. Variant-specific comparison for same-ranked values
///
/// Numbers compare by magnitude across `Int`/`Float`; NaN sorts above every
/// other number so the order stays total.
#[must_use]
pub fn canonical_cmp(left: &Value, right: &Value) -> Ordering {
    let rank = left.canonical_rank().cmp(&right.canonical_rank());
    if rank != Ordering::Equal {
        return rank;
    }

    canonical_cmp_same_rank(left, right)
}

fn canonical_cmp_same_rank(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => cmp_f64(*a, *b),
        (Value::Int(a), Value::Float(b)) => cmp_int_f64(*a, *b),
        (Value::Float(a), Value::Int(b)) => cmp_int_f64(*b, *a).reverse(),
        (Value::Text(a), Value::Text(b)) => a.cmp(b),
        (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
        (Value::List(a), Value::List(b)) => canonical_cmp_value_list(a, b),
        _ => Ordering::Equal,
    }
}

fn cmp_f64(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        // -0.0 and 0.0 are the same number here.
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

#[expect(clippy::cast_precision_loss)]
fn cmp_int_f64(left: i64, right: f64) -> Ordering {
    cmp_f64(left as f64, right)
}

fn canonical_cmp_value_list(left: &[Value], right: &[Value]) -> Ordering {
    for (left, right) in left.iter().zip(right.iter()) {
        let cmp = canonical_cmp(left, right);
        if cmp != Ordering::Equal {
            return cmp;
        }
    }

    left.len().cmp(&right.len())
}
