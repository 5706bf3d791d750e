use depot_core::{Document, ValidationErrors};
use serde_json::{Map, Value};

use crate::{PropertyType, Schema};

/// Whether a write creates a document or updates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    Update,
}

impl Schema {
    /// Clean a raw payload: drop unknown keys, coerce declared types, apply
    /// defaults (create only, with `"now"` resolved to `now`), and discard
    /// external create-time writes to `system` properties.
    ///
    /// Update mode keeps system values: an update payload is merged into
    /// the stored document afterwards, and that merge is where external
    /// system writes are resolved against the pre-image. Dropping them here
    /// would also drop values a previous sanitize produced, breaking
    /// `sanitize(sanitize(d, create), update) == sanitize(d, create)`.
    ///
    /// Deterministic for a given `now`; the caller stamps the actual
    /// insert time.
    pub fn sanitize(&self, raw: &Map<String, Value>, mode: Mode, internal: bool, now: &str) -> Document {
        let mut clean = Map::new();
        if internal {
            // Engine-initiated writes may carry a pre-assigned id.
            if let Some(id) = raw.get("id") {
                clean.insert("id".into(), id.clone());
            }
        }
        for (name, property) in &self.properties {
            match raw.get(name) {
                Some(value) => {
                    if property.system && !internal && mode == Mode::Create {
                        continue;
                    }
                    clean.insert(name.clone(), coerce(value, property.property_type));
                }
                None => {
                    if mode == Mode::Create {
                        if let Some(default) = &property.default {
                            clean.insert(name.clone(), resolve_default(default, property.property_type, now));
                        }
                    }
                }
            }
        }
        Document(clean)
    }

    /// Re-check a cleaned payload: `required` on create, types always.
    pub fn validate(&self, clean: &Map<String, Value>, mode: Mode) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        for (name, property) in &self.properties {
            match clean.get(name) {
                None | Some(Value::Null) => {
                    if mode == Mode::Create && property.required {
                        errors.add(name, "is required");
                    }
                }
                Some(value) => {
                    if !type_matches(value, property.property_type) {
                        errors.add(name, format!("must be a {}", property.property_type.as_str()));
                    }
                }
            }
        }
        errors
    }
}

fn resolve_default(default: &Value, property_type: PropertyType, now: &str) -> Value {
    if property_type == PropertyType::Date && default == &Value::String("now".into()) {
        return Value::String(now.to_string());
    }
    coerce(default, property_type)
}

/// Best-effort coercion to the declared type. Values that cannot be coerced
/// pass through unchanged for `validate` to reject.
fn coerce(value: &Value, property_type: PropertyType) -> Value {
    match (property_type, value) {
        (PropertyType::Number, Value::String(s)) => {
            if let Ok(n) = s.parse::<i64>() {
                return Value::from(n);
            }
            if let Ok(f) = s.parse::<f64>() {
                if let Some(n) = serde_json::Number::from_f64(f) {
                    return Value::Number(n);
                }
            }
            value.clone()
        }
        (PropertyType::Boolean, Value::String(s)) => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.clone(),
        },
        (PropertyType::String, Value::Number(n)) => Value::String(n.to_string()),
        (PropertyType::Date, Value::String(s)) => match canonical_date(s) {
            Some(rfc3339) => Value::String(rfc3339),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Accept RFC3339 or a plain `YYYY-MM-DD` and normalize to RFC3339 UTC.
fn canonical_date(s: &str) -> Option<String> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(
            dt.with_timezone(&chrono::Utc)
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        );
    }
    let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let dt = date.and_hms_opt(0, 0, 0)?.and_utc();
    Some(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

fn type_matches(value: &Value, property_type: PropertyType) -> bool {
    match property_type {
        PropertyType::String => value.is_string(),
        PropertyType::Number => value.is_number(),
        PropertyType::Boolean => value.is_boolean(),
        PropertyType::Date => value
            .as_str()
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false),
        PropertyType::Array => value.is_array(),
        PropertyType::Object => value.is_object(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: &str = "2026-01-02T03:04:05.000Z";

    fn schema() -> Schema {
        Schema::from_config(
            r#"{"properties": {
                "title": {"type": "string", "required": true},
                "age": {"type": "number"},
                "active": {"type": "boolean"},
                "joined": {"type": "date", "default": "now"},
                "role": {"type": "string", "system": true, "default": "member"},
                "tags": {"type": "array"}
            }}"#,
        )
        .unwrap()
    }

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let clean = schema().sanitize(&obj(json!({"title": "x", "bogus": 1})), Mode::Create, false, NOW);
        assert!(clean.get("bogus").is_none());
        assert_eq!(clean.get("title"), Some(&json!("x")));
    }

    #[test]
    fn values_are_coerced() {
        let clean = schema().sanitize(
            &obj(json!({"title": "x", "age": "42", "active": "true"})),
            Mode::Create,
            false,
            NOW,
        );
        assert_eq!(clean.get("age"), Some(&json!(42)));
        assert_eq!(clean.get("active"), Some(&json!(true)));
    }

    #[test]
    fn date_strings_are_canonicalized() {
        let clean = schema().sanitize(
            &obj(json!({"title": "x", "joined": "2025-06-01"})),
            Mode::Create,
            false,
            NOW,
        );
        assert_eq!(
            clean.get("joined"),
            Some(&json!("2025-06-01T00:00:00.000Z"))
        );
    }

    #[test]
    fn defaults_apply_only_on_create() {
        let s = schema();
        let created = s.sanitize(&obj(json!({"title": "x"})), Mode::Create, false, NOW);
        assert_eq!(created.get("joined"), Some(&json!(NOW)));
        assert_eq!(created.get("role"), Some(&json!("member")));

        let updated = s.sanitize(&obj(json!({"title": "x"})), Mode::Update, false, NOW);
        assert!(updated.get("joined").is_none());
        assert!(updated.get("role").is_none());
    }

    #[test]
    fn system_fields_are_discarded_from_outside_on_create() {
        let s = schema();
        let external = s.sanitize(&obj(json!({"title": "x", "role": "admin"})), Mode::Create, false, NOW);
        // The attempted write is dropped; the declared default applies.
        assert_eq!(external.get("role"), Some(&json!("member")));

        let internal = s.sanitize(&obj(json!({"title": "x", "role": "admin"})), Mode::Create, true, NOW);
        assert_eq!(internal.get("role"), Some(&json!("admin")));
    }

    #[test]
    fn system_fields_pass_through_on_update_for_the_merge_layer() {
        // Update payloads merge into the stored document afterwards; the
        // merge, not sanitize, decides whether a system value may land.
        let s = schema();
        let external = s.sanitize(&obj(json!({"role": "member"})), Mode::Update, false, NOW);
        assert_eq!(external.get("role"), Some(&json!("member")));
    }

    #[test]
    fn required_is_enforced_on_create_only() {
        let s = schema();
        let errors = s.validate(&obj(json!({})), Mode::Create);
        assert_eq!(errors.0.get("title").unwrap(), "is required");
        let errors = s.validate(&obj(json!({})), Mode::Update);
        assert!(errors.is_empty());
    }

    #[test]
    fn uncoercible_values_fail_validation() {
        let s = schema();
        let clean = s.sanitize(&obj(json!({"title": "x", "age": "not-a-number"})), Mode::Create, false, NOW);
        let errors = s.validate(&clean, Mode::Create);
        assert_eq!(errors.0.get("age").unwrap(), "must be a number");
    }

    #[test]
    fn sanitize_is_idempotent_after_first_normalization() {
        let s = schema();
        let raw = obj(json!({"title": "x", "age": "42", "joined": "2025-06-01", "extra": true}));
        let first = s.sanitize(&raw, Mode::Create, false, NOW);
        let second = s.sanitize(&first, Mode::Update, false, NOW);
        assert_eq!(second.0, first.0);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const NOW: &str = "2026-01-02T03:04:05.000Z";

    fn schema() -> Schema {
        Schema::from_config(
            r#"{"properties": {
                "title": {"type": "string"},
                "age": {"type": "number"},
                "active": {"type": "boolean"},
                "joined": {"type": "date", "default": "now"},
                "role": {"type": "string", "system": true, "default": "member"}
            }}"#,
        )
        .unwrap()
    }

    proptest! {
        /// Sanitize(Sanitize(d, create), update) == Sanitize(d, create),
        /// including the system-with-default shape: whether the payload
        /// attempts to write `role` or leaves it to its default, the second
        /// pass must reproduce the first exactly.
        #[test]
        fn sanitize_idempotence(
            title in ".{0,12}",
            age in prop_oneof![
                (0i64..1000).prop_map(|n| json!(n)),
                (0i64..1000).prop_map(|n| json!(n.to_string())),
            ],
            active in any::<bool>(),
            attempted_role in proptest::option::of("[a-z]{1,8}"),
        ) {
            let s = schema();
            let mut raw = json!({"title": title, "age": age, "active": active})
                .as_object().unwrap().clone();
            if let Some(role) = attempted_role {
                raw.insert("role".into(), json!(role));
            }
            let first = s.sanitize(&raw, Mode::Create, false, NOW);
            let second = s.sanitize(&first, Mode::Update, false, NOW);
            prop_assert_eq!(second.0, first.0);
        }
    }
}
