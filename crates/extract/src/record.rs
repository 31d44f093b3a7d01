use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::normalizer::normalize_value;
use crate::schema::SchemaSpec;

/// One structured answer, persisted as `{"data": [ {field: value, ...} ]}`.
///
/// Every item carries every schema field, in schema order; unknown values are
/// null. Records are built once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub data: Vec<Map<String, Value>>,
}

impl ExtractionRecord {
    pub fn all_null(schema: &SchemaSpec) -> Self {
        let item = schema
            .field_names()
            .map(|name| (name.to_string(), Value::Null))
            .collect();
        Self { data: vec![item] }
    }

    /// Every non-null (field, value) pair across all items, in item then schema order.
    pub fn non_null_fields(&self) -> Vec<(&str, &Value)> {
        self.data
            .iter()
            .flat_map(|item| item.iter())
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.as_str(), v))
            .collect()
    }

    pub fn is_all_null(&self) -> bool {
        self.non_null_fields().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Ok,
    Degraded,
}

impl ExtractionStatus {
    /// Degraded wins.
    pub fn combine(self, other: ExtractionStatus) -> ExtractionStatus {
        if self == ExtractionStatus::Degraded || other == ExtractionStatus::Degraded {
            ExtractionStatus::Degraded
        } else {
            ExtractionStatus::Ok
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub record: ExtractionRecord,
    pub status: ExtractionStatus,
    /// Source file for per-document runs; `None` for the merged context.
    pub unit: Option<String>,
    pub attempts: u32,
    /// Why earlier attempts were rejected, in attempt order.
    pub issues: Vec<String>,
}

/// Check parsed items against `schema` and build a normalized record.
///
/// Unknown keys are dropped. A value that cannot be coerced to its declared
/// type becomes null. The response is rejected only when an item is not an
/// object, an item shares no key with the schema, or a required field ends
/// up null.
pub fn validate_response(
    schema: &SchemaSpec,
    items: &[Value],
) -> Result<ExtractionRecord, Vec<String>> {
    if items.is_empty() {
        return Ok(ExtractionRecord::all_null(schema));
    }

    let mut issues = Vec::new();
    let mut data = Vec::with_capacity(items.len());

    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            issues.push(format!("item {} is not a JSON object", i));
            continue;
        };

        let known = obj.keys().filter(|k| schema.field(k).is_some()).count();
        if !obj.is_empty() && known == 0 {
            issues.push(format!(
                "item {} has none of the expected fields (got: {})",
                i,
                obj.keys().cloned().collect::<Vec<_>>().join(", ")
            ));
            continue;
        }

        let dropped: Vec<&String> = obj.keys().filter(|k| schema.field(k).is_none()).collect();
        if !dropped.is_empty() {
            debug!(?dropped, "Dropping keys not in schema");
        }

        let mut normalized = Map::with_capacity(schema.len());
        for field in &schema.fields {
            let value = obj
                .get(&field.name)
                .map(|raw| normalize_value(field.field_type, raw))
                .unwrap_or(Value::Null);
            if field.required && value.is_null() {
                issues.push(format!("required field `{}` is missing or null in item {}", field.name, i));
            }
            normalized.insert(field.name.clone(), value);
        }
        data.push(normalized);
    }

    if issues.is_empty() {
        Ok(ExtractionRecord { data })
    } else {
        Err(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDefinition, FieldType, build_static_schema, validate_field_defs};
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_validate_normalizes_and_fills_nulls() {
        let schema = build_static_schema();
        let record = validate_response(
            &schema,
            &[json!({"endurance_cycles": "50 cycles", "switching_layer_material": "CuO", "extra": 1})],
        )
        .unwrap();

        let item = &record.data[0];
        assert_eq!(item.len(), schema.len());
        assert_eq!(item["endurance_cycles"], json!(50));
        assert_eq!(item["switching_layer_material"], json!("CuO"));
        assert!(item["top_electrode"].is_null());
        assert!(!item.contains_key("extra"));
        // schema order is preserved
        assert_eq!(item.keys().next().map(String::as_str), Some("numeric_value"));
    }

    #[test]
    fn test_required_field_missing_is_rejected() {
        let fields = validate_field_defs(vec![FieldDefinition::Full {
            name: "on_off_ratio".into(),
            description: None,
            field_type: FieldType::Number,
            required: true,
        }])
        .unwrap();
        let schema = SchemaSpec { id: "u".into(), version: 1, fields };

        let issues = validate_response(&schema, &[json!({"on_off_ratio": "unknown"})]).unwrap_err();
        assert!(issues[0].contains("on_off_ratio"));
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let schema = build_static_schema();
        assert!(validate_response(&schema, &[json!("text")]).is_err());
        assert!(validate_response(&schema, &[json!({"answer": "CuO"})]).is_err());
    }

    #[test]
    fn test_empty_items_give_all_null() {
        let schema = build_static_schema();
        let record = validate_response(&schema, &[]).unwrap();
        assert!(record.is_all_null());
        assert_eq!(record, ExtractionRecord::all_null(&schema));
    }

    #[test]
    fn test_record_json_roundtrip() {
        let schema = build_static_schema();
        let record = validate_response(
            &schema,
            &[json!({"memory_window": 1.5, "year": 2021, "doi": "10.1000/x"})],
        )
        .unwrap();
        let text = serde_json::to_string(&record).unwrap();
        assert!(text.starts_with("{\"data\":[{"));
        let back: ExtractionRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
        for (field, value) in &record.data[0] {
            assert_eq!(&back.data[0][field], value);
        }
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<i64>().prop_map(Value::from),
            // Halves print and parse back exactly
            (-4000i32..4000).prop_map(|n| Value::from(f64::from(n) * 0.5)),
            "[a-zA-Z0-9 ./_-]{0,24}".prop_map(Value::from),
        ]
    }

    proptest! {
        #[test]
        fn prop_record_json_roundtrip(
            items in prop::collection::vec(
                prop::collection::vec(arb_value(), build_static_schema().len()),
                1..4,
            ),
        ) {
            let schema = build_static_schema();
            let record = ExtractionRecord {
                data: items
                    .into_iter()
                    .map(|values| {
                        schema
                            .field_names()
                            .map(str::to_string)
                            .zip(values)
                            .collect::<Map<String, Value>>()
                    })
                    .collect(),
            };

            let back: ExtractionRecord = serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
            prop_assert_eq!(back.data.len(), record.data.len());
            for (got, want) in back.data.iter().zip(&record.data) {
                let got_fields: Vec<&String> = got.keys().collect();
                let want_fields: Vec<&String> = want.keys().collect();
                prop_assert_eq!(got_fields, want_fields);
                for (field, value) in want {
                    prop_assert_eq!(&got[field], value);
                }
            }
        }
    }
}
