use serde_json::{Map, Value, json};

use index::ScoredChunk;

use crate::llm::Message;
use crate::schema::SchemaSpec;
use crate::store::{Turn, TurnRole};

pub const SYSTEM_INSTRUCTIONS: &str = "You are a specialized AI algorithm for scientific data extraction, designed to analyze research papers. \
Your role is to extract only the relevant information from the provided text. \
If an attribute's value cannot be determined from the context, return null for that attribute. \
Rely solely on the given context to extract information and generate responses. \
Do not use example content to influence the response's content.";

/// Output contract handed to the model: readable instructions plus the JSON
/// schema of the expected `{"data": [...]}` shape.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContract {
    pub instructions: String,
    pub json_schema: Value,
}

pub fn render_prompt_contract(spec: &SchemaSpec) -> PromptContract {
    let mut instructions = String::from(
        "Respond with a single JSON object of the form {\"data\": [ { ... } ]}. \
Each object in \"data\" uses exactly these fields:\n",
    );

    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in &spec.fields {
        let ty = field.field_type.as_json_type();
        let flag = if field.required { ", required" } else { "" };
        instructions.push_str(&format!("- `{}` ({}{}): {}\n", field.name, ty, flag, field.description));

        properties.insert(
            field.name.clone(),
            json!({ "type": [ty, "null"], "description": field.description }),
        );
        if field.required {
            required.push(Value::String(field.name.clone()));
        }
    }
    instructions.push_str(
        "Numeric fields must be bare numbers without units. Use null for anything not stated in the context. \
Output only the JSON object, no markdown and no commentary.",
    );

    let json_schema = json!({
        "type": "object",
        "properties": {
            "data": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                    "additionalProperties": false,
                }
            }
        },
        "required": ["data"],
    });

    PromptContract { instructions, json_schema }
}

#[derive(Debug, Clone)]
pub struct FewShotExample {
    pub query: String,
    pub data: Map<String, Value>,
}

impl FewShotExample {
    /// The example answer restricted to `spec`'s fields; missing fields render
    /// as null. `None` when the example shares no field with the schema.
    pub fn project(&self, spec: &SchemaSpec) -> Option<Value> {
        if !spec.field_names().any(|name| self.data.contains_key(name)) {
            return None;
        }
        let item: Map<String, Value> = spec
            .field_names()
            .map(|name| (name.to_string(), self.data.get(name).cloned().unwrap_or(Value::Null)))
            .collect();
        Some(json!({ "data": [item] }))
    }
}

pub fn builtin_examples() -> Vec<FewShotExample> {
    let data = json!({
        "numeric_value": "Set voltage 1.5v and Reset Voltage -0.65v",
        "switching_layer_material": "CuO",
        "synthesis_method": "Soluton Processable",
        "top_electrode": "Ag",
        "top_electrode_thickness": 500,
        "bottom_electrode": "p-Si",
        "bottom_electrode_thickness": 100,
        "switching_layer_thickness": 250,
        "switching_type": "resistive switching (RS)",
        "endurance_cycles": 50,
        "retention_time": 1000,
        "memory_window": 1000,
        "num_states": "2 (HRS and LRS)",
        "conduction_mechanism": "Bulk",
        "resistive_switching_mechanism": "Ag filament formation",
        "paper_name": "Memristive Devices from CuO Nanoparticles",
        "source": "1.pdf"
    });

    let data = match data {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    vec![FewShotExample {
        query: "Extract the switching layer material, synthesis method, electrodes and their thicknesses, \
switching type, endurance, retention time in seconds, memory window in volts, number of states, \
conduction mechanism, resistive switching mechanism, paper name and source file of the memristor device."
            .to_string(),
        data,
    }]
}

/// The example whose query is closest to `query` by normalized Levenshtein similarity.
pub fn select_example<'a>(query: &str, examples: &'a [FewShotExample]) -> Option<&'a FewShotExample> {
    let query = query.to_lowercase();
    examples.iter().max_by(|a, b| {
        let sa = strsim::normalized_levenshtein(&query, &a.query.to_lowercase());
        let sb = strsim::normalized_levenshtein(&query, &b.query.to_lowercase());
        sa.total_cmp(&sb)
    })
}

/// One block per chunk; `Source ID` is the chunk's position in the context.
pub fn serialize_context(context: &[ScoredChunk]) -> String {
    context
        .iter()
        .enumerate()
        .map(|(i, sc)| {
            let chunk = &sc.chunk;
            let mut block = format!(
                "Source ID: {}\nArticle ID: {}\nArticle Title: {}\nArticle Snippet: {}\nArticle Source: {}",
                i,
                chunk.id,
                chunk.title.as_deref().unwrap_or("Unknown"),
                chunk.text,
                chunk.source_file,
            );
            if let Some(page) = chunk.page {
                block.push_str(&format!("\nPage: {}", page));
            }
            if let Some(doi) = &chunk.doi {
                block.push_str(&format!("\nDOI: {}", doi));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct PromptParts<'a> {
    pub contract: &'a PromptContract,
    pub example: Option<(&'a FewShotExample, Value)>,
    pub history: &'a [Turn],
    pub context: &'a [ScoredChunk],
    pub query: &'a str,
}

/// system + contract, few-shot pair, history tail, context, then the query.
pub fn build_messages(parts: PromptParts<'_>) -> Vec<Message> {
    let mut messages = vec![Message::system(format!(
        "{}\n\n{}",
        SYSTEM_INSTRUCTIONS, parts.contract.instructions
    ))];

    if let Some((example, projected)) = parts.example {
        messages.push(Message::user(format!("Query: {}", example.query)));
        messages.push(Message::assistant(projected.to_string()));
    }

    for turn in parts.history {
        messages.push(match turn.role {
            TurnRole::Human => Message::user(turn.content.clone()),
            TurnRole::Ai => Message::assistant(turn.content.clone()),
        });
    }

    let context = if parts.context.is_empty() {
        "(no context was retrieved)".to_string()
    } else {
        serialize_context(parts.context)
    };
    messages.push(Message::system(format!("context:\n{}", context)));
    messages.push(Message::user(format!("Query: {}", parts.query)));
    messages
}

pub fn build_retry_message(reason: &str) -> Message {
    Message::user(format!(
        "The previous output did not match the schema because {}. \
Answer again with only a JSON object of the form {{\"data\": [ {{ ... }} ]}} using exactly the listed fields.",
        reason
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType, build_static_schema};
    use index::Chunk;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn field_line_count(instructions: &str, name: &str) -> usize {
        let prefix = format!("- `{}` (", name);
        instructions.lines().filter(|l| l.starts_with(&prefix)).count()
    }

    #[test]
    fn test_static_contract_lists_fields_in_order() {
        let spec = build_static_schema();
        let contract = render_prompt_contract(&spec);
        let props = contract.json_schema["properties"]["data"]["items"]["properties"]
            .as_object()
            .unwrap();
        assert_eq!(props.keys().cloned().collect::<Vec<_>>(), spec.field_names().collect::<Vec<_>>());
        assert_eq!(props["endurance_cycles"]["type"], json!(["integer", "null"]));
    }

    #[test]
    fn test_projection_fills_missing_with_null() {
        let spec = SchemaSpec {
            id: "u".into(),
            version: 1,
            fields: vec![
                FieldSpec::new("endurance_cycles", FieldType::Integer, ""),
                FieldSpec::new("device_area", FieldType::Text, ""),
            ],
        };
        let example = &builtin_examples()[0];
        assert_eq!(
            example.project(&spec).unwrap(),
            json!({"data": [{"endurance_cycles": 50, "device_area": null}]})
        );

        let disjoint = SchemaSpec {
            id: "v".into(),
            version: 1,
            fields: vec![FieldSpec::new("band_gap", FieldType::Number, "")],
        };
        assert!(example.project(&disjoint).is_none());
    }

    #[test]
    fn test_select_example_prefers_closest() {
        let mut examples = builtin_examples();
        examples.push(FewShotExample { query: "band gap of perovskite".into(), data: Map::new() });
        let picked = select_example("band gap of the perovskite film", &examples).unwrap();
        assert_eq!(picked.query, "band gap of perovskite");
        assert!(select_example("x", &[]).is_none());
    }

    #[test]
    fn test_messages_layout() {
        let spec = build_static_schema();
        let contract = render_prompt_contract(&spec);
        let chunk = Arc::new(Chunk::new("The device endured 50 cycles.", "1.pdf", Some(3)));
        let context = vec![ScoredChunk { chunk, score: 0.9 }];
        let history = vec![Turn::human("previous q"), Turn::ai("previous a")];
        let examples = builtin_examples();
        let projected = examples[0].project(&spec).unwrap();

        let messages = build_messages(PromptParts {
            contract: &contract,
            example: Some((&examples[0], projected)),
            history: &history,
            context: &context,
            query: "endurance cycles for CuO device",
        });

        assert_eq!(messages.len(), 7);
        assert!(messages[0].content.contains("`endurance_cycles`"));
        assert_eq!(messages[3].content, "previous q");
        assert!(messages[5].content.contains("Source ID: 0\nArticle ID: "));
        assert!(messages[5].content.contains("Article Source: 1.pdf"));
        assert_eq!(messages[6].content, "Query: endurance cycles for CuO device");
    }

    proptest! {
        #[test]
        fn prop_contract_enumerates_each_field_once(
            names in prop::collection::hash_set("[a-z]{1,8}(_[a-z0-9]{1,4}){0,2}", 1..24),
            required_mask in any::<u32>(),
        ) {
            let fields: Vec<FieldSpec> = names
                .iter()
                .enumerate()
                .map(|(i, name)| FieldSpec {
                    name: name.clone(),
                    description: format!("description of {}", name),
                    field_type: FieldType::Text,
                    required: required_mask & (1 << (i % 32)) != 0,
                })
                .collect();
            let spec = SchemaSpec { id: "p".into(), version: 1, fields };
            let contract = render_prompt_contract(&spec);

            for name in &names {
                prop_assert_eq!(field_line_count(&contract.instructions, name), 1);
            }
            let props = contract.json_schema["properties"]["data"]["items"]["properties"]
                .as_object()
                .unwrap();
            prop_assert_eq!(props.len(), names.len());
            let keys: HashSet<&String> = props.keys().collect();
            prop_assert_eq!(keys, names.iter().collect::<HashSet<_>>());
        }
    }
}
