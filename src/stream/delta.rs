//! Typed shape of one `data:` payload of an OpenAI-compatible chat stream.

use serde::{Deserialize, Deserializer, Serialize};

/// A decoded `data:` payload: `{ "choices": [ { "delta": { ... } } ] }`.
///
/// Every level is optional on the wire. A missing or `null` `choices` array
/// decodes as empty, and unknown fields (ids, usage, finish reasons) are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEvent {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub choices: Vec<DeltaChoice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
}

/// Incremental text carried by one choice.
///
/// `content` and `reasoning_content` are independent: either, both, or
/// neither may be present in a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Delta {
    /// Reasoning text, if present and non-empty.
    #[must_use]
    pub fn reasoning(&self) -> Option<&str> {
        self.reasoning_content.as_deref().filter(|text| !text.is_empty())
    }

    /// Answer text, if present and non-empty.
    #[must_use]
    pub fn answer(&self) -> Option<&str> {
        self.content.as_deref().filter(|text| !text.is_empty())
    }
}

impl DeltaEvent {
    /// Build a single-choice event, used by encoders and tests.
    #[must_use]
    pub fn single(reasoning: Option<&str>, content: Option<&str>) -> Self {
        Self {
            choices: vec![DeltaChoice {
                delta: Some(Delta {
                    content: content.map(str::to_owned),
                    reasoning_content: reasoning.map(str::to_owned),
                }),
            }],
        }
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_only() {
        let event: DeltaEvent =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap();
        let delta = event.choices[0].delta.as_ref().unwrap();
        assert_eq!(delta.answer(), Some("Hi"));
        assert_eq!(delta.reasoning(), None);
    }

    #[test]
    fn test_parse_ignores_unknown_fields_and_nulls() {
        let event: DeltaEvent = serde_json::from_str(
            r#"{"id":"x","created":1,"choices":[{"index":0,"delta":{"role":"assistant","content":null,"reasoning_content":"hm"},"finish_reason":null}],"usage":null}"#,
        )
        .unwrap();
        let delta = event.choices[0].delta.as_ref().unwrap();
        assert_eq!(delta.answer(), None);
        assert_eq!(delta.reasoning(), Some("hm"));
    }

    #[test]
    fn test_parse_null_or_missing_choices() {
        let event: DeltaEvent = serde_json::from_str(r#"{"choices":null}"#).unwrap();
        assert!(event.choices.is_empty());
        let event: DeltaEvent = serde_json::from_str(r#"{"usage":{"total_tokens":3}}"#).unwrap();
        assert!(event.choices.is_empty());
    }

    #[test]
    fn test_choice_without_delta() {
        let event: DeltaEvent =
            serde_json::from_str(r#"{"choices":[{"finish_reason":"stop"}]}"#).unwrap();
        assert!(event.choices[0].delta.is_none());
    }

    #[test]
    fn test_empty_strings_are_absent() {
        let delta = Delta {
            content: Some(String::new()),
            reasoning_content: Some(String::new()),
        };
        assert_eq!(delta.answer(), None);
        assert_eq!(delta.reasoning(), None);
    }

    #[test]
    fn test_truncated_payload_fails() {
        assert!(serde_json::from_str::<DeltaEvent>(r#"{"choices":[{"del"#).is_err());
    }

    #[test]
    fn test_single_serializes_without_absent_fields() {
        let json = serde_json::to_string(&DeltaEvent::single(None, Some("ok"))).unwrap();
        assert_eq!(json, r#"{"choices":[{"delta":{"content":"ok"}}]}"#);
    }
}
