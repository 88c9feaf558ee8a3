//! Structured screenshot analysis records

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder the model uses for fields it cannot read
pub const UNKNOWN: &str = "unknown";

fn unknown() -> String {
    UNKNOWN.to_string()
}

/// One app row read off a screen-time screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppEntry {
    #[serde(default = "unknown")]
    pub app_name: String,
    /// Time as shown on screen, e.g. "1h 12m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_spent: Option<String>,
    #[serde(default)]
    pub time_spent_minutes: Option<f64>,
}

impl AppEntry {
    pub fn minutes(&self) -> f64 {
        self.time_spent_minutes.unwrap_or(0.0)
    }
}

/// Fields the vision model is asked to return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default = "unknown")]
    pub device_type: String,
    #[serde(default)]
    pub device_type_confidence: f64,
    #[serde(default = "unknown")]
    pub date_of_screenshot: String,
    #[serde(default = "unknown")]
    pub screenshot_timestamp: String,
    #[serde(default)]
    pub apps: Vec<AppEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    LowDeviceConfidence,
    UnknownDate,
    FewAppsDetected,
}

/// Non-fatal finding attached to an accepted analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisWarning {
    #[serde(rename = "type")]
    pub kind: WarningKind,
    pub message: String,
    pub value: Value,
}

/// Provenance envelope stored under `_metadata`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub source_image: String,
    pub analysis_timestamp: String,
    pub model_used: String,
    #[serde(default)]
    pub analysis_warnings: Vec<AnalysisWarning>,
    /// Set when the screenshot date was rewritten to the reference year
    #[serde(default)]
    pub date_normalized_to_reference_year: bool,
}

/// Accepted analysis of one screenshot, as persisted in `<stem>_analysis.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotAnalysis {
    #[serde(flatten)]
    pub response: ModelResponse,
    #[serde(rename = "_metadata")]
    pub metadata: AnalysisMetadata,
}

impl ScreenshotAnalysis {
    pub fn has_warnings(&self) -> bool {
        !self.metadata.analysis_warnings.is_empty()
    }

    pub fn total_minutes(&self) -> f64 {
        self.response.apps.iter().map(AppEntry::minutes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_artifact_layout() {
        let analysis = ScreenshotAnalysis {
            response: ModelResponse {
                device_type: "iphone".into(),
                device_type_confidence: 0.9,
                date_of_screenshot: "2025-07-15".into(),
                screenshot_timestamp: "21:04".into(),
                apps: vec![AppEntry {
                    app_name: "YouTube".into(),
                    time_spent: Some("1h 12m".into()),
                    time_spent_minutes: Some(72.0),
                }],
                analysis_notes: None,
            },
            metadata: AnalysisMetadata {
                source_image: "1/R_abc/IMG_1.png".into(),
                analysis_timestamp: "2025-07-16T10:00:00Z".into(),
                model_used: "gemini-2.0-flash".into(),
                analysis_warnings: vec![AnalysisWarning {
                    kind: WarningKind::FewAppsDetected,
                    message: "Only 1 app detected".into(),
                    value: json!(1),
                }],
                date_normalized_to_reference_year: false,
            },
        };
        let value = serde_json::to_value(&analysis).unwrap();

        assert_eq!(value["device_type"], "iphone");
        assert_eq!(value["apps"][0]["time_spent_minutes"], 72.0);
        assert_eq!(value["_metadata"]["analysis_warnings"][0]["type"], "few_apps_detected");
        assert_eq!(analysis.total_minutes(), 72.0);
    }

    #[test]
    fn test_missing_fields_default_to_unknown() {
        let response: ModelResponse = serde_json::from_value(json!({"apps": []})).unwrap();
        assert_eq!(response.device_type, UNKNOWN);
        assert_eq!(response.date_of_screenshot, UNKNOWN);
        assert_eq!(response.device_type_confidence, 0.0);
    }
}
