//! Field mapping: turn a raw CRM record into flat application fields.
//!
//! [`resolve`] is a pure function. Simple entries are applied first, then
//! composite entries, so a composite entry wins when both target the same
//! application field.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::models::AdvancedMapping;

/// A CRM record as delivered by the API.
pub type CrmRecord = Map<String, Value>;

/// Map `record` through `mapping`.
///
/// - Simple entries emit the source value whenever the key exists, even if
///   it is an empty string.
/// - Composite entries join the non-blank sources (sorted by `order`) with
///   the entry's separator, values kept as delivered, and are omitted when
///   no source yields a value.
pub fn resolve(record: &CrmRecord, mapping: &AdvancedMapping) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    for (app_field, crm_key) in &mapping.simple {
        if let Some(value) = lookup(record, crm_key).and_then(stringify) {
            out.insert(app_field.clone(), value);
        }
    }

    for entry in &mapping.composite {
        let mut sources: Vec<_> = entry.sources.iter().collect();
        sources.sort_by_key(|s| s.order);

        let parts: Vec<String> = sources
            .iter()
            .filter_map(|s| lookup(record, &s.source_field_key).and_then(stringify))
            .filter(|v| !v.trim().is_empty())
            .collect();

        if parts.is_empty() {
            // A stale simple value for the same field must not survive.
            out.remove(&entry.app_field);
        } else {
            out.insert(entry.app_field.clone(), parts.join(entry.separator()));
        }
    }

    out
}

/// Every application field `mapping` can produce. A field in this set that
/// is missing from [`resolve`]'s output was cleared in the CRM.
pub fn target_fields(mapping: &AdvancedMapping) -> BTreeSet<String> {
    mapping
        .simple
        .keys()
        .chain(mapping.composite.iter().map(|entry| &entry.app_field))
        .cloned()
        .collect()
}

/// Find `key` at the top level, then inside the record's `custom_fields`.
fn lookup<'a>(record: &'a CrmRecord, key: &str) -> Option<&'a Value> {
    record.get(key).or_else(|| {
        record
            .get("custom_fields")
            .and_then(Value::as_object)
            .and_then(|custom| custom.get(key))
    })
}

/// Render a JSON value as an application string. `null` counts as absent.
pub fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(obj) => obj.get("value").and_then(stringify),
        Value::Array(items) => items
            .iter()
            .find(|item| item.get("primary").and_then(Value::as_bool) == Some(true))
            .or_else(|| items.first())
            .and_then(stringify),
    }
}

/// Read an integer id that may be a bare number or an object with `value`.
pub fn integer_field(record: &CrmRecord, key: &str) -> Option<i64> {
    match record.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::Object(obj) => obj.get("value").and_then(Value::as_i64),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompositeFieldEntry, SimpleMapping, CURRENT_VERSION};
    use serde_json::json;

    fn record(value: Value) -> CrmRecord {
        value.as_object().cloned().unwrap()
    }

    fn name_mapping() -> AdvancedMapping {
        AdvancedMapping {
            version: CURRENT_VERSION,
            simple: SimpleMapping::new(),
            composite: vec![CompositeFieldEntry::new(
                "full_name",
                &[("first_name", 0), ("last_name", 1)],
                Some(" "),
            )],
        }
    }

    #[test]
    fn test_composite_joins_in_order() {
        let out = resolve(
            &record(json!({"first_name": "Hans", "last_name": "Mueller"})),
            &name_mapping(),
        );
        assert_eq!(out["full_name"], "Hans Mueller");
    }

    #[test]
    fn test_composite_skips_missing_sources() {
        let out = resolve(&record(json!({"first_name": "Hans"})), &name_mapping());
        assert_eq!(out["full_name"], "Hans");

        let out = resolve(&record(json!({"first_name": "", "last_name": "Mueller"})), &name_mapping());
        assert_eq!(out["full_name"], "Mueller");
    }

    #[test]
    fn test_composite_keeps_source_values() {
        let out = resolve(
            &record(json!({"first_name": "Hans ", "last_name": "   "})),
            &name_mapping(),
        );
        assert_eq!(out["full_name"], "Hans ");
    }

    #[test]
    fn test_target_fields() {
        let mut mapping = name_mapping();
        mapping.simple.insert("website".into(), "web".into());
        let targets = target_fields(&mapping);
        assert_eq!(
            targets.into_iter().collect::<Vec<_>>(),
            vec!["full_name".to_string(), "website".to_string()]
        );
    }

    #[test]
    fn test_composite_omitted_when_empty() {
        let out = resolve(&record(json!({})), &name_mapping());
        assert!(!out.contains_key("full_name"));
    }

    #[test]
    fn test_composite_sorts_by_order_not_position() {
        let mapping = AdvancedMapping {
            version: CURRENT_VERSION,
            simple: SimpleMapping::new(),
            composite: vec![CompositeFieldEntry::new(
                "label",
                &[("city", 2), ("street", 0), ("zip", 1)],
                Some(", "),
            )],
        };
        let out = resolve(
            &record(json!({"street": "Main 1", "zip": "1010", "city": "Vienna"})),
            &mapping,
        );
        assert_eq!(out["label"], "Main 1, 1010, Vienna");
    }

    #[test]
    fn test_simple_emits_empty_only_when_present() {
        let mut simple = SimpleMapping::new();
        simple.insert("website".into(), "web".into());
        simple.insert("notes".into(), "missing".into());
        let mapping = AdvancedMapping {
            version: CURRENT_VERSION,
            simple,
            composite: Vec::new(),
        };
        let out = resolve(&record(json!({"web": ""})), &mapping);
        assert_eq!(out.get("website").map(String::as_str), Some(""));
        assert!(!out.contains_key("notes"));
    }

    #[test]
    fn test_composite_overrides_simple() {
        let mut mapping = name_mapping();
        mapping.simple.insert("full_name".into(), "name".into());
        let out = resolve(
            &record(json!({"name": "H. M.", "first_name": "Hans", "last_name": "Mueller"})),
            &mapping,
        );
        assert_eq!(out["full_name"], "Hans Mueller");

        let out = resolve(&record(json!({"name": "H. M."})), &mapping);
        assert!(!out.contains_key("full_name"));
    }

    #[test]
    fn test_stringify_shapes() {
        assert_eq!(stringify(&json!(42)), Some("42".into()));
        assert_eq!(stringify(&json!(true)), Some("true".into()));
        assert_eq!(stringify(&json!(null)), None);
        assert_eq!(stringify(&json!({"value": "x"})), Some("x".into()));
        assert_eq!(
            stringify(&json!([
                {"value": "a@x.com", "primary": false},
                {"value": "b@x.com", "primary": true}
            ])),
            Some("b@x.com".into())
        );
        assert_eq!(stringify(&json!([{"value": "only"}])), Some("only".into()));
        assert_eq!(stringify(&json!([])), None);
    }

    #[test]
    fn test_custom_fields_lookup() {
        let mut simple = SimpleMapping::new();
        simple.insert("industry".into(), "9f3a".into());
        let mapping = AdvancedMapping {
            version: CURRENT_VERSION,
            simple,
            composite: Vec::new(),
        };
        let out = resolve(&record(json!({"custom_fields": {"9f3a": "Retail"}})), &mapping);
        assert_eq!(out["industry"], "Retail");
    }

    #[test]
    fn test_integer_field() {
        let rec = record(json!({"id": 5, "org_id": {"value": 9}, "owner": "12", "bad": []}));
        assert_eq!(integer_field(&rec, "id"), Some(5));
        assert_eq!(integer_field(&rec, "org_id"), Some(9));
        assert_eq!(integer_field(&rec, "owner"), Some(12));
        assert_eq!(integer_field(&rec, "bad"), None);
        assert_eq!(integer_field(&rec, "absent"), None);
    }

    #[test]
    fn test_deterministic() {
        let rec = record(json!({"first_name": "Hans", "last_name": "Mueller", "name": "x"}));
        let mut mapping = name_mapping();
        mapping.simple.insert("name".into(), "name".into());
        assert_eq!(resolve(&rec, &mapping), resolve(&rec, &mapping));
    }
}
