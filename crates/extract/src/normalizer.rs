use regex::Regex;
use serde_json::{Number, Value};
use std::sync::LazyLock;

use crate::schema::FieldType;

/// "5 x 10^4", "2.1×10<sup>3</sup>"
static MANTISSA_POWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?\d+(?:\.\d+)?)\s*[x×*]\s*10\s*(?:\^|<sup>)\s*([-−]?\d+)")
        .expect("valid mantissa regex")
});

/// "10^4", "10<sup>4</sup>"
static POWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*(?:\^|<sup>)\s*([-−]?\d+)").expect("valid power regex")
});

/// "1,000", "-0.65", "1e4", ".5"
static PLAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-?(?:\d{1,3}(?:,\d{3})+|\d*\.?\d+)(?:\.\d+)?(?:[eE][-+]?\d+)?")
        .expect("valid number regex")
});

const NULL_MARKERS: [&str; 4] = ["n/a", "null", "none", "not mentioned"];

pub fn is_null_marker(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    t.is_empty() || NULL_MARKERS.contains(&t.as_str())
}

fn parse_exponent(s: &str) -> Option<i32> {
    s.replace('−', "-").parse().ok()
}

/// Pull the first number out of free text such as "50 cycles" or "10<sup>4</sup> s".
/// Ranges ("50-100") yield their first number.
pub fn parse_number(text: &str) -> Option<f64> {
    let mut candidates: Vec<(usize, usize, f64)> = Vec::new();

    if let Some(caps) = MANTISSA_POWER.captures(text) {
        let whole = caps.get(0)?;
        let mantissa: f64 = caps[1].parse().ok()?;
        let exp = parse_exponent(&caps[2])?;
        candidates.push((whole.start(), whole.end(), mantissa * 10f64.powi(exp)));
    }
    if let Some(caps) = POWER.captures(text) {
        let whole = caps.get(0)?;
        let base: f64 = caps[1].parse().ok()?;
        let exp = parse_exponent(&caps[2])?;
        candidates.push((whole.start(), whole.end(), base.powi(exp)));
    }
    if let Some(m) = PLAIN.find(text) {
        if let Ok(v) = m.as_str().replace(',', "").parse::<f64>() {
            candidates.push((m.start(), m.end(), v));
        }
    }

    // Earliest match wins; at the same position the longest reading wins
    candidates
        .into_iter()
        .filter(|(_, _, v)| v.is_finite())
        .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(_, _, v)| v)
}

/// Coerce one raw field value to its declared type. Anything that cannot be
/// coerced becomes null.
pub fn normalize_value(field_type: FieldType, raw: &Value) -> Value {
    match (field_type, raw) {
        (_, Value::Null) => Value::Null,

        (FieldType::Text, Value::String(s)) => {
            if is_null_marker(s) {
                Value::Null
            } else {
                Value::String(s.trim().to_string())
            }
        }
        (FieldType::Text, Value::Number(n)) => Value::String(n.to_string()),
        (FieldType::Text, Value::Bool(b)) => Value::String(b.to_string()),
        (FieldType::Text, Value::Array(items)) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|v| match normalize_value(FieldType::Text, v) {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect();
            if parts.is_empty() {
                Value::Null
            } else {
                Value::String(parts.join(", "))
            }
        }
        (FieldType::Text, Value::Object(_)) => Value::String(raw.to_string()),

        (numeric, _) => {
            let parsed = match raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) if !is_null_marker(s) => parse_number(s),
                _ => None,
            };
            match (numeric, parsed) {
                (FieldType::Integer, Some(v)) if v.abs() < i64::MAX as f64 => {
                    Value::Number(Number::from(v.trunc() as i64))
                }
                (FieldType::Number, Some(v)) => {
                    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
                }
                _ => Value::Null,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_number_variants() {
        assert_eq!(parse_number("50 cycles"), Some(50.0));
        assert_eq!(parse_number("1,000 s"), Some(1000.0));
        assert_eq!(parse_number("1e4"), Some(10000.0));
        assert_eq!(parse_number("10^4 s"), Some(10000.0));
        assert_eq!(parse_number("10<sup>4</sup> sec"), Some(10000.0));
        assert_eq!(parse_number("5 x 10^3"), Some(5000.0));
        assert_eq!(parse_number("50-100 cycles"), Some(50.0));
        assert_eq!(parse_number("-0.65 V"), Some(-0.65));
        assert_eq!(parse_number("no number"), None);
    }

    #[test]
    fn test_integer_fields_truncate() {
        assert_eq!(normalize_value(FieldType::Integer, &json!("200 cycles")), json!(200));
        assert_eq!(normalize_value(FieldType::Integer, &json!(3.9)), json!(3));
        assert_eq!(normalize_value(FieldType::Integer, &json!("-2.7")), json!(-2));
        assert_eq!(normalize_value(FieldType::Integer, &json!("10<sup>4</sup> sec")), json!(10000));
    }

    #[test]
    fn test_number_fields_strip_units() {
        assert_eq!(normalize_value(FieldType::Number, &json!("250 nm")), json!(250.0));
        assert_eq!(normalize_value(FieldType::Number, &json!(1.5)), json!(1.5));
    }

    #[test]
    fn test_failures_become_null() {
        assert_eq!(normalize_value(FieldType::Number, &json!("thick")), Value::Null);
        assert_eq!(normalize_value(FieldType::Integer, &json!("N/A")), Value::Null);
        assert_eq!(normalize_value(FieldType::Integer, &json!(true)), Value::Null);
        assert_eq!(normalize_value(FieldType::Text, &json!("null")), Value::Null);
        assert_eq!(normalize_value(FieldType::Text, &json!("  ")), Value::Null);
    }

    #[test]
    fn test_text_coercions() {
        assert_eq!(normalize_value(FieldType::Text, &json!(" CuO ")), json!("CuO"));
        assert_eq!(normalize_value(FieldType::Text, &json!(2)), json!("2"));
        assert_eq!(normalize_value(FieldType::Text, &json!(["Ag", "Pt"])), json!("Ag, Pt"));
    }
}
