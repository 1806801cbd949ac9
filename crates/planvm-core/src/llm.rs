//! Seam between the VM and the reasoning LLM.
//!
//! The engine never talks to a provider directly; conditional jumps and the
//! `llm_generate` tool go through [`TextGenerator`], implemented by the LLM
//! adapter crate.

use async_trait::async_trait;

use crate::error::VmError;

/// A text-in, text-out generation endpoint.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, context: Option<&str>) -> Result<String, VmError>;
}

/// Extract the first balanced top-level JSON object from free-form LLM
/// output. Skips braces inside string literals.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    for (start, ch) in text.char_indices() {
        if ch != '{' {
            continue;
        }
        if let Some(end) = find_object_end(text, start) {
            let candidate = &text[start..=end];
            if serde_json::from_str::<serde_json::Value>(candidate)
                .map(|v| v.is_object())
                .unwrap_or(false)
            {
                return Some(candidate);
            }
        }
    }
    None
}

fn find_object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text[start..].char_indices() {
        let abs = start + idx;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(abs);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a `{"result": bool, "explanation": string}` reply from a
/// conditional-jump prompt.
pub fn parse_condition_reply(text: &str) -> Result<(bool, String), VmError> {
    let object = extract_first_json_object(text)
        .ok_or_else(|| VmError::llm_parse(format!("no JSON object in reply: {}", text)))?;
    let value: serde_json::Value = serde_json::from_str(object)
        .map_err(|e| VmError::llm_parse(format!("invalid JSON in reply: {}", e)))?;
    let result = value
        .get("result")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| {
            VmError::llm_parse(format!("reply missing boolean 'result': {}", object))
        })?;
    let explanation = value
        .get("explanation")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok((result, explanation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_extract_skips_non_json_braces() {
        let raw = r#"Preface {not json} -> {"result":true,"explanation":"ok"} trailing"#;
        assert_eq!(
            extract_first_json_object(raw),
            Some(r#"{"result":true,"explanation":"ok"}"#)
        );
    }

    #[test]
    fn test_extract_handles_braces_inside_strings() {
        let raw = r#"noise {"message":"value with } brace"} end"#;
        assert_eq!(
            extract_first_json_object(raw),
            Some(r#"{"message":"value with } brace"}"#)
        );
    }

    #[test]
    fn test_parse_condition_reply() {
        let (result, explanation) =
            parse_condition_reply(r#"Sure! {"result": true, "explanation": "4 is even"}"#)
                .unwrap();
        assert!(result);
        assert_eq!(explanation, "4 is even");
    }

    #[test]
    fn test_unquoted_boolean_reply_is_a_parse_error() {
        let err = parse_condition_reply("true").unwrap_err();
        assert_eq!(err.kind, ErrorKind::LlmParse);
    }

    #[test]
    fn test_non_boolean_result_is_a_parse_error() {
        let err = parse_condition_reply(r#"{"result": "yes"}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LlmParse);
    }
}
