//! Reusable field validators

use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use crate::core::temporal;

/// A rejected value, carrying the validator name and an i18n message key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationFailure {
    pub validator: String,
    pub field: String,
    pub message_key: String,
}

impl ValidationFailure {
    pub fn new(validator: &str, field: &str) -> Self {
        Self {
            validator: validator.to_string(),
            field: field.to_string(),
            message_key: format!("validation.{}", validator),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Validation of field '{}' failed ({}): {}",
            self.field, self.validator, self.message_key
        )
    }
}

impl std::error::Error for ValidationFailure {}

/// Field validator primitives
#[derive(Debug, Clone)]
pub enum Validator {
    /// Rejects null, empty strings, empty lists and empty objects
    NotEmpty,
    /// String must match the pattern; null passes
    Regex(Regex),
    /// Timestamp must lie before now; null passes
    Past,
    /// Timestamp must lie after now; null fails
    Future,
    /// Inclusive lower bound
    Min(f64),
    /// Inclusive upper bound
    Max(f64),
    Email,
    /// List elements must be pairwise distinct
    Unique,
}

fn email_regex() -> &'static Regex {
    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    EMAIL_REGEX.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap()
    })
}

impl Validator {
    /// Build a regex validator
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Validator::Regex(Regex::new(pattern)?))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Validator::NotEmpty => "NotEmpty",
            Validator::Regex(_) => "Regexp",
            Validator::Past => "Past",
            Validator::Future => "Future",
            Validator::Min(_) => "Min",
            Validator::Max(_) => "Max",
            Validator::Email => "Email",
            Validator::Unique => "Unique",
        }
    }

    /// Description used by the meta endpoint
    pub fn describe(&self) -> Value {
        match self {
            Validator::Regex(re) => json!({"type": self.name(), "value": re.as_str()}),
            Validator::Min(v) | Validator::Max(v) => json!({"type": self.name(), "value": v}),
            Validator::Email => json!({"type": self.name(), "value": email_regex().as_str()}),
            _ => json!({"type": self.name()}),
        }
    }

    /// Check a value; `field` names the value in the failure
    pub fn validate(&self, field: &str, value: &Value) -> Result<(), ValidationFailure> {
        let ok = match self {
            Validator::NotEmpty => match value {
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                Value::Array(items) => !items.is_empty(),
                Value::Object(map) => !map.is_empty(),
                _ => true,
            },
            Validator::Regex(re) => match value {
                Value::Null => true,
                Value::String(s) => re.is_match(s),
                other => re.is_match(&other.to_string()),
            },
            Validator::Email => match value {
                Value::Null => true,
                Value::String(s) => email_regex().is_match(s),
                _ => false,
            },
            Validator::Past => match value {
                Value::Null => true,
                v => temporal::timestamp_of(v).is_some_and(|ts| ts < chrono::Utc::now()),
            },
            Validator::Future => {
                temporal::timestamp_of(value).is_some_and(|ts| ts > chrono::Utc::now())
            }
            Validator::Min(min) => match numeric(value) {
                Some(n) => n >= *min,
                None => value.is_null(),
            },
            Validator::Max(max) => match numeric(value) {
                Some(n) => n <= *max,
                None => value.is_null(),
            },
            Validator::Unique => match value {
                Value::Array(items) => {
                    let mut seen = HashSet::new();
                    items.iter().all(|item| seen.insert(item.to_string()))
                }
                _ => true,
            },
        };

        if ok {
            Ok(())
        } else {
            Err(ValidationFailure::new(self.name(), field))
        }
    }
}

/// Numeric view of a value; decimal strings count as numbers
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // === NotEmpty ===

    #[test]
    fn test_not_empty_rejects_empty_values() {
        let v = Validator::NotEmpty;
        assert!(v.validate("name", &json!(null)).is_err());
        assert!(v.validate("name", &json!("")).is_err());
        assert!(v.validate("tags", &json!([])).is_err());
        assert!(v.validate("data", &json!({})).is_err());
    }

    #[test]
    fn test_not_empty_accepts_values() {
        let v = Validator::NotEmpty;
        assert!(v.validate("name", &json!("x")).is_ok());
        assert!(v.validate("count", &json!(0)).is_ok());
        assert!(v.validate("flag", &json!(false)).is_ok());
    }

    // === Regex ===

    #[test]
    fn test_regex_passes_null() {
        let v = Validator::regex("^[a-z]+$").unwrap();
        assert!(v.validate("name", &json!(null)).is_ok());
    }

    #[test]
    fn test_regex_match_and_mismatch() {
        let v = Validator::regex("^[a-z]+$").unwrap();
        assert!(v.validate("name", &json!("abc")).is_ok());
        let err = v.validate("name", &json!("Abc1")).unwrap_err();
        assert_eq!(err.validator, "Regexp");
        assert_eq!(err.field, "name");
    }

    // === Email ===

    #[test]
    fn test_email() {
        let v = Validator::Email;
        assert!(v.validate("email", &json!("user.name+tag@example.co.uk")).is_ok());
        assert!(v.validate("email", &json!("invalid-email")).is_err());
        assert!(v.validate("email", &json!("@example.com")).is_err());
        assert!(v.validate("email", &json!(42)).is_err());
    }

    // === Past / Future ===

    #[test]
    fn test_past_null_passes() {
        assert!(Validator::Past.validate("birth_date", &json!(null)).is_ok());
    }

    #[test]
    fn test_past_and_future_on_dates() {
        assert!(Validator::Past.validate("d", &json!("1980-06-30T00:00:00")).is_ok());
        assert!(Validator::Past.validate("d", &json!("2999-01-01")).is_err());
        assert!(Validator::Future.validate("d", &json!("2999-01-01")).is_ok());
        assert!(Validator::Future.validate("d", &json!("1980-06-30")).is_err());
    }

    #[test]
    fn test_future_null_fails() {
        let err = Validator::Future.validate("due", &json!(null)).unwrap_err();
        assert_eq!(err.message_key, "validation.Future");
    }

    #[test]
    fn test_past_accepts_store_date() {
        let v = json!({"$date": "2001-01-01T00:00:00Z"});
        assert!(Validator::Past.validate("d", &v).is_ok());
    }

    // === Min / Max ===

    #[test]
    fn test_min_max_inclusive() {
        assert!(Validator::Min(1.0).validate("n", &json!(1)).is_ok());
        assert!(Validator::Min(1.0).validate("n", &json!(0)).is_err());
        assert!(Validator::Max(10.0).validate("n", &json!(10)).is_ok());
        assert!(Validator::Max(10.0).validate("n", &json!(10.5)).is_err());
    }

    #[test]
    fn test_min_on_decimal_string() {
        assert!(Validator::Min(0.0).validate("price", &json!("12.50")).is_ok());
        assert!(Validator::Min(0.0).validate("price", &json!("-0.01")).is_err());
    }

    #[test]
    fn test_min_rejects_non_numeric() {
        assert!(Validator::Min(0.0).validate("n", &json!("abc")).is_err());
        assert!(Validator::Min(0.0).validate("n", &json!(null)).is_ok());
    }

    // === Unique ===

    #[test]
    fn test_unique() {
        assert!(Validator::Unique.validate("tags", &json!(["a", "b"])).is_ok());
        assert!(Validator::Unique.validate("tags", &json!(["a", "a"])).is_err());
        assert!(Validator::Unique.validate("tags", &json!(null)).is_ok());
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            Validator::Min(3.0).describe(),
            json!({"type": "Min", "value": 3.0})
        );
        assert_eq!(Validator::NotEmpty.describe(), json!({"type": "NotEmpty"}));
    }

    #[test]
    fn test_failure_display() {
        let f = ValidationFailure::new("Email", "email");
        assert!(f.to_string().contains("'email'"));
    }
}
