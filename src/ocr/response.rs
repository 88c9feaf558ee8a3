//! Model response text handling

use crate::error::PipelineError;
use serde::de::DeserializeOwned;

/// Strip a surrounding Markdown code fence (` ```json ` or bare ` ``` `)
pub fn strip_code_fences(raw: &str) -> &str {
    let text = raw.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse model output as JSON; malformed output is an analysis failure
pub fn parse_model_json<T: DeserializeOwned>(raw: &str, context: &str) -> Result<T, PipelineError> {
    serde_json::from_str(strip_code_fences(raw)).map_err(|e| {
        let preview: String = raw.chars().take(200).collect();
        PipelineError::AnalysisFailure(format!(
            "{}: model returned invalid JSON ({}): {}",
            context, e, preview
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ocr::types::ModelResponse;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n[]\n```\n"), "[]");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn test_parse_fenced_response() {
        let raw = "```json\n{\"device_type\": \"iphone\", \"device_type_confidence\": 0.8, \"apps\": [{\"app_name\": \"Maps\", \"time_spent_minutes\": 5}]}\n```";
        let parsed: ModelResponse = parse_model_json(raw, "IMG_1.png").unwrap();
        assert_eq!(parsed.device_type, "iphone");
        assert_eq!(parsed.apps[0].time_spent_minutes, Some(5.0));
    }

    #[test]
    fn test_garbage_is_analysis_failure() {
        let err = parse_model_json::<ModelResponse>("I cannot read this image", "IMG_2.png").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AnalysisFailure);
    }
}
