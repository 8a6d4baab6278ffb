//! Checks the model's final answer against the declared output shape.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Declared type of an output field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(Self::String),
            "number" | "float" => Ok(Self::Number),
            "integer" | "int" => Ok(Self::Integer),
            "boolean" | "bool" => Ok(Self::Boolean),
            "array" | "list" => Ok(Self::Array),
            "object" => Ok(Self::Object),
            "any" | "" => Ok(Self::Any),
            other => Err(format!(
                "unknown field type '{}' (expected string, number, integer, boolean, array, object or any)",
                other
            )),
        }
    }
}

fn default_required() -> bool {
    true
}

/// One expected field of the final answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }
}

/// Parses `NAME[:TYPE][?]`, as given to `--field`.
impl FromStr for FieldSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (body, required) = match s.strip_suffix('?') {
            Some(body) => (body, false),
            None => (s, true),
        };
        let (name, field_type) = match body.split_once(':') {
            Some((name, ty)) => (name.trim(), ty.parse()?),
            None => (body.trim(), FieldType::Any),
        };
        if name.is_empty() {
            return Err(format!("field '{}' has no name", s));
        }
        Ok(Self {
            name: name.to_string(),
            field_type,
            required,
        })
    }
}

/// The answer did not have the declared shape.
#[derive(Debug, Clone, Error, Serialize)]
#[error("answer failed validation: {}", .problems.join("; "))]
pub struct ValidationError {
    /// The final answer exactly as the model gave it
    pub raw: String,
    pub problems: Vec<String>,
}

/// A validated final answer.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredResult {
    pub raw: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
}

/// Declared shape of the final answer. Empty accepts anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSchema {
    pub fields: Vec<FieldSpec>,
}

impl OutputSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Shape description for the system prompt, e.g. `{"title": string, "score"?: integer}`.
    pub fn describe(&self) -> String {
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                format!(
                    "\"{}\"{}: {}",
                    f.name,
                    if f.required { "" } else { "?" },
                    f.field_type
                )
            })
            .collect();
        format!("{{{}}}", fields.join(", "))
    }

    pub fn validate(&self, raw: &str) -> Result<StructuredResult, ValidationError> {
        let parsed = extract_json(raw);

        if self.fields.is_empty() {
            let data = parsed.unwrap_or_else(|| Value::String(raw.trim().to_string()));
            return Ok(StructuredResult {
                raw: raw.to_string(),
                data,
                formatted: None,
            });
        }

        let reject = |problems: Vec<String>| ValidationError {
            raw: raw.to_string(),
            problems,
        };

        let data = parsed.ok_or_else(|| {
            reject(vec!["answer does not contain a JSON object".to_string()])
        })?;
        let Some(object) = data.as_object() else {
            return Err(reject(vec![format!(
                "expected a JSON object, found {}",
                json_kind(&data)
            )]));
        };

        let mut problems = Vec::new();
        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        problems.push(format!("missing required field '{}'", field.name));
                    }
                }
                Some(value) if !field.field_type.matches(value) => problems.push(format!(
                    "field '{}' should be {}, found {}",
                    field.name,
                    field.field_type,
                    json_kind(value)
                )),
                Some(_) => {}
            }
        }

        if !problems.is_empty() {
            return Err(reject(problems));
        }
        Ok(StructuredResult {
            raw: raw.to_string(),
            data,
            formatted: None,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```\s*json\s*\n(.*?)```").expect("fence regex is valid"));

/// Find JSON in an answer: the whole text, then a ```json fence, then the
/// outermost braces.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(block) = FENCE_RE.captures(trimmed).and_then(|c| c.get(1)) {
        if let Ok(value) = serde_json::from_str(block.as_str().trim()) {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> OutputSchema {
        OutputSchema::new(vec![
            FieldSpec::required("title", FieldType::String),
            FieldSpec::required("score", FieldType::Integer),
            FieldSpec::optional("tags", FieldType::Array),
        ])
    }

    #[test]
    fn parses_field_flags() {
        assert_eq!(
            "score:integer".parse::<FieldSpec>().unwrap(),
            FieldSpec::required("score", FieldType::Integer)
        );
        assert_eq!(
            "tags:array?".parse::<FieldSpec>().unwrap(),
            FieldSpec::optional("tags", FieldType::Array)
        );
        assert_eq!(
            "anything".parse::<FieldSpec>().unwrap(),
            FieldSpec::required("anything", FieldType::Any)
        );
        assert!("x:date".parse::<FieldSpec>().is_err());
        assert!(":string".parse::<FieldSpec>().is_err());
    }

    #[test]
    fn accepts_matching_object() {
        let result = schema()
            .validate(r#"{"title": "Cold plunges", "score": 512}"#)
            .unwrap();
        assert_eq!(result.data["score"], 512);
        assert!(result.formatted.is_none());
    }

    #[test]
    fn finds_json_in_fence_or_prose() {
        let fenced = "Here you go:\n```json\n{\"title\": \"a\", \"score\": 1}\n```\nDone.";
        assert_eq!(schema().validate(fenced).unwrap().data["title"], "a");

        let prose = "The top post is {\"title\": \"b\", \"score\": 2, \"tags\": []} as requested.";
        assert_eq!(schema().validate(prose).unwrap().data["title"], "b");
    }

    #[test]
    fn reports_every_problem_and_keeps_raw() {
        let raw = r#"{"score": "high", "tags": "x"}"#;
        let err = schema().validate(raw).unwrap_err();
        assert_eq!(err.raw, raw);
        assert_eq!(
            err.problems,
            vec![
                "missing required field 'title'",
                "field 'score' should be integer, found string",
                "field 'tags' should be array, found string",
            ]
        );
    }

    #[test]
    fn rejects_answer_without_json() {
        let err = schema().validate("I could not find anything.").unwrap_err();
        assert_eq!(err.problems, vec!["answer does not contain a JSON object"]);

        let err = schema().validate("[1, 2]").unwrap_err();
        assert_eq!(err.problems, vec!["expected a JSON object, found array"]);
    }

    #[test]
    fn null_optional_field_is_accepted() {
        assert!(schema()
            .validate(r#"{"title": "t", "score": 3, "tags": null}"#)
            .is_ok());
    }

    #[test]
    fn empty_schema_accepts_anything() {
        let schema = OutputSchema::default();
        assert_eq!(schema.validate("8").unwrap().data, json!(8));
        assert_eq!(
            schema.validate("  plain text answer ").unwrap().data,
            json!("plain text answer")
        );
    }

    #[test]
    fn describes_shape_for_prompt() {
        assert_eq!(
            schema().describe(),
            r#"{"title": string, "score": integer, "tags"?: array}"#
        );
    }
}
