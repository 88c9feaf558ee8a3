//! Acceptance checks for model responses

use super::types::{AnalysisWarning, ModelResponse, WarningKind, UNKNOWN};
use crate::error::PipelineError;
use serde_json::json;
use tracing::warn;

/// Device confidence below this is flagged
pub const MIN_DEVICE_CONFIDENCE: f64 = 0.3;

/// Fewer apps than this is flagged
pub const MIN_EXPECTED_APPS: usize = 2;

/// Check a response, returning the warnings to attach
///
/// A response with no apps is rejected outright.
pub fn validate_response(response: &ModelResponse, image_name: &str) -> Result<Vec<AnalysisWarning>, PipelineError> {
    let mut warnings = Vec::new();

    let confidence = response.device_type_confidence;
    if confidence < MIN_DEVICE_CONFIDENCE {
        warnings.push(AnalysisWarning {
            kind: WarningKind::LowDeviceConfidence,
            message: format!("Low device type confidence ({:.2}) for {}", confidence, image_name),
            value: json!(confidence),
        });
    }

    let date = response.date_of_screenshot.trim();
    if date.is_empty() || date == UNKNOWN {
        warnings.push(AnalysisWarning {
            kind: WarningKind::UnknownDate,
            message: format!("Date of screenshot not discernible for {}", image_name),
            value: json!(response.date_of_screenshot),
        });
    }

    let num_apps = response.apps.len();
    if num_apps == 0 {
        return Err(PipelineError::AnalysisFailure(format!(
            "No apps detected in {} - this may indicate a failed analysis",
            image_name
        )));
    }
    if num_apps < MIN_EXPECTED_APPS {
        warnings.push(AnalysisWarning {
            kind: WarningKind::FewAppsDetected,
            message: format!("Only {} app detected in {} - expected multiple apps", num_apps, image_name),
            value: json!(num_apps),
        });
    }

    for warning in &warnings {
        warn!(image = image_name, kind = ?warning.kind, "{}", warning.message);
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ocr::types::AppEntry;

    fn response(confidence: f64, date: &str, apps: usize) -> ModelResponse {
        ModelResponse {
            device_type: "iphone".into(),
            device_type_confidence: confidence,
            date_of_screenshot: date.into(),
            screenshot_timestamp: UNKNOWN.into(),
            apps: (0..apps)
                .map(|i| AppEntry {
                    app_name: format!("App {}", i),
                    time_spent: None,
                    time_spent_minutes: Some(10.0),
                })
                .collect(),
            analysis_notes: None,
        }
    }

    #[test]
    fn test_clean_response_has_no_warnings() {
        let warnings = validate_response(&response(0.95, "2025-07-15", 5), "IMG_1.png").unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_warnings_collected_in_order() {
        let warnings = validate_response(&response(0.1, "unknown", 1), "IMG_1.png").unwrap();
        let kinds: Vec<WarningKind> = warnings.iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![
                WarningKind::LowDeviceConfidence,
                WarningKind::UnknownDate,
                WarningKind::FewAppsDetected
            ]
        );
        assert_eq!(warnings[2].value, json!(1));
    }

    #[test]
    fn test_no_apps_is_failure() {
        let err = validate_response(&response(0.9, "2025-07-15", 0), "IMG_1.png").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AnalysisFailure);
    }

    #[test]
    fn test_confidence_threshold_is_exclusive() {
        let warnings = validate_response(&response(0.3, "2025-07-15", 2), "IMG_1.png").unwrap();
        assert!(warnings.is_empty());
    }
}
