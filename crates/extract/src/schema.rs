use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::error::SchemaError;

static FIELD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+(_[a-z\d]+)*$").expect("valid field-name regex"));

pub const STATIC_SCHEMA_ID: &str = "static";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Integer,
    Number,
}

impl FieldType {
    pub fn as_json_type(&self) -> &'static str {
        match self {
            FieldType::Text => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, FieldType::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub description: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn new(name: &str, field_type: FieldType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            field_type,
            required: false,
        }
    }

    /// "switching_layer_material" -> "Switching Layer Material"
    pub fn display_name(&self) -> String {
        self.name
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Ordered set of output fields. Once attached to a request it is never
/// mutated; a new version is built instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub id: String,
    pub version: u32,
    pub fields: Vec<FieldSpec>,
}

impl SchemaSpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_static(&self) -> bool {
        self.id == STATIC_SCHEMA_ID
    }
}

/// A user-supplied field: either a bare name or a full definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldDefinition {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(rename = "type", default)]
        field_type: FieldType,
        #[serde(default)]
        required: bool,
    },
}

impl FieldDefinition {
    pub fn name(&self) -> &str {
        match self {
            FieldDefinition::Name(name) => name,
            FieldDefinition::Full { name, .. } => name,
        }
    }

    fn into_spec(self) -> FieldSpec {
        match self {
            FieldDefinition::Name(name) => FieldSpec {
                description: format!("Value of '{}' as stated in the context", name),
                name,
                field_type: FieldType::Text,
                required: false,
            },
            FieldDefinition::Full { name, description, field_type, required } => FieldSpec {
                description: description
                    .unwrap_or_else(|| format!("Value of '{}' as stated in the context", name)),
                name,
                field_type,
                required,
            },
        }
    }
}

pub fn is_valid_field_name(name: &str) -> bool {
    FIELD_NAME.is_match(name)
}

/// Check names and uniqueness, preserving the caller's order.
pub fn validate_field_defs(defs: Vec<FieldDefinition>) -> Result<Vec<FieldSpec>, SchemaError> {
    if defs.is_empty() {
        return Err(SchemaError::Empty);
    }

    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(defs.len());
    for def in defs {
        if !is_valid_field_name(def.name()) {
            return Err(SchemaError::InvalidFieldName { field: def.name().to_string() });
        }
        if !seen.insert(def.name().to_string()) {
            return Err(SchemaError::DuplicateField { field: def.name().to_string() });
        }
        fields.push(def.into_spec());
    }
    Ok(fields)
}

/// The built-in memristor schema: materials, electrodes, switching metrics
/// and reference metadata.
pub fn build_static_schema() -> SchemaSpec {
    use FieldType::*;

    let fields = vec![
        FieldSpec::new("numeric_value", Text, "Any numeric value directly answering the query, with its unit"),
        FieldSpec::new("switching_layer_material", Text, "Material of the resistive switching layer"),
        FieldSpec::new("synthesis_method", Text, "Method used to synthesize the switching layer"),
        FieldSpec::new("top_electrode", Text, "Top electrode material"),
        FieldSpec::new("top_electrode_thickness", Number, "Top electrode thickness in nm"),
        FieldSpec::new("bottom_electrode", Text, "Bottom electrode material"),
        FieldSpec::new("bottom_electrode_thickness", Number, "Bottom electrode thickness in nm"),
        FieldSpec::new("switching_layer_thickness", Number, "Switching layer thickness in nm"),
        FieldSpec::new("switching_type", Text, "Type of switching behaviour"),
        FieldSpec::new("endurance_cycles", Integer, "Number of switching cycles endured"),
        FieldSpec::new("retention_time", Integer, "Retention time in seconds"),
        FieldSpec::new("memory_window", Number, "Memory window in V"),
        FieldSpec::new("num_states", Text, "Number of distinguishable resistance states"),
        FieldSpec::new("conduction_mechanism", Text, "Dominant conduction mechanism"),
        FieldSpec::new("resistive_switching_mechanism", Text, "Physical mechanism of resistive switching"),
        FieldSpec::new("paper_name", Text, "Title of the paper"),
        FieldSpec::new("doi", Text, "DOI of the paper"),
        FieldSpec::new("year", Integer, "Publication year"),
        FieldSpec::new("source", Text, "Source file the value was found in"),
        FieldSpec::new("custom", Text, "Any other relevant value the query asks for"),
    ];

    SchemaSpec {
        id: STATIC_SCHEMA_ID.to_string(),
        version: 1,
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_schema_is_well_formed() {
        let schema = build_static_schema();
        assert_eq!(schema.len(), 20);
        assert!(schema.fields.iter().all(|f| is_valid_field_name(&f.name)));
        assert_eq!(schema.field("endurance_cycles").unwrap().field_type, FieldType::Integer);
        assert!(schema.fields.iter().all(|f| !f.required));
    }

    #[test]
    fn test_field_name_rules() {
        assert!(is_valid_field_name("switching_type"));
        assert!(is_valid_field_name("layer_2"));
        assert!(!is_valid_field_name("Switching Type"));
        assert!(!is_valid_field_name("switching__type"));
        assert!(!is_valid_field_name("_leading"));
        assert!(!is_valid_field_name("2nd_layer"));
        assert!(!is_valid_field_name(""));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty() {
        let defs = vec![
            FieldDefinition::Name("doi".into()),
            FieldDefinition::Name("doi".into()),
        ];
        assert_eq!(
            validate_field_defs(defs),
            Err(SchemaError::DuplicateField { field: "doi".into() })
        );
        assert_eq!(validate_field_defs(vec![]), Err(SchemaError::Empty));
    }

    #[test]
    fn test_field_definition_accepts_both_forms() {
        let defs: Vec<FieldDefinition> = serde_json::from_str(
            r#"["device_area", {"name": "on_off_ratio", "type": "number", "required": true}]"#,
        )
        .unwrap();
        let fields = validate_field_defs(defs).unwrap();
        assert_eq!(fields[0].field_type, FieldType::Text);
        assert_eq!(fields[1].field_type, FieldType::Number);
        assert!(fields[1].required);
    }

    #[test]
    fn test_display_name() {
        let field = FieldSpec::new("switching_layer_material", FieldType::Text, "");
        assert_eq!(field.display_name(), "Switching Layer Material");
    }
}
