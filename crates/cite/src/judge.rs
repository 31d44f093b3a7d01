use async_trait::async_trait;
use extract::{CompletionRequest, LlmBackend, LlmError, Message};
use index::Chunk;
use serde_json::{Map, Value, json};
use std::sync::Arc;

const JUDGE_PROMPT: &str = "You check whether a passage from a research paper states the given extracted values. \
Answer with a JSON object {\"supported_fields\": [ ... ]} listing only the field names whose value is stated \
or directly implied by the passage. Return an empty list when none are.";

/// Decides which extracted fields a chunk supports.
#[async_trait]
pub trait SupportJudge: Send + Sync {
    async fn supported_fields(
        &self,
        fields: &[(&str, &Value)],
        chunk: &Chunk,
    ) -> Result<Vec<String>, LlmError>;
}

/// Asks a secondary model.
pub struct LlmJudge {
    backend: Arc<dyn LlmBackend>,
}

impl LlmJudge {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }
}

fn parse_verdict(text: &str) -> Option<Vec<String>> {
    let start = text.find(['{', '['])?;
    let end = text.rfind(['}', ']'])?;
    if end < start {
        return None;
    }
    let list = match serde_json::from_str::<Value>(&text[start..=end]).ok()? {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("supported_fields") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };
    Some(
        list.into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    )
}

#[async_trait]
impl SupportJudge for LlmJudge {
    async fn supported_fields(
        &self,
        fields: &[(&str, &Value)],
        chunk: &Chunk,
    ) -> Result<Vec<String>, LlmError> {
        let values: Map<String, Value> = fields
            .iter()
            .map(|(name, value)| (name.to_string(), (*value).clone()))
            .collect();

        let request = CompletionRequest::new(vec![
            Message::system(JUDGE_PROMPT),
            Message::user(format!(
                "Extracted values:\n{}\n\nPassage:\n{}",
                Value::Object(values),
                chunk.text
            )),
        ])
        .with_shape(json!({
            "type": "object",
            "properties": { "supported_fields": { "type": "array", "items": { "type": "string" } } },
            "required": ["supported_fields"],
        }));

        let text = self.backend.complete(&request).await?;
        let verdict = parse_verdict(&text)
            .ok_or_else(|| LlmError::Generation(format!("unreadable judge verdict: {}", text)))?;

        // Only names that were asked about count
        Ok(verdict
            .into_iter()
            .filter(|name| fields.iter().any(|(f, _)| *f == name.as_str()))
            .collect())
    }
}
