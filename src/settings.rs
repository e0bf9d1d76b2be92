use crate::container;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Threshold list used whenever the caller omits one or lacks the premium capability.
pub const DEFAULT_THRESHOLDS: &str = "25,50,75,100";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("missing measurement id or event name")]
    MissingIdentifiers,
}

/// Wire shape of a generation request. Every field is optional here; the
/// conversion into [`Settings`] decides what is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default, alias = "ga4MeasurementId")]
    pub measurement_id: Option<String>,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub thresholds: Option<String>,
    #[serde(default)]
    pub selectors: Option<String>,
    #[serde(default)]
    pub spa_fix: Option<bool>,
    #[serde(default)]
    pub ajax_forms: Option<bool>,
    #[serde(default)]
    pub premium: Option<bool>,
}

impl GenerateRequest {
    pub fn into_settings(self) -> Result<Settings, SettingsError> {
        let measurement_id = non_blank(self.measurement_id);
        let event_name = non_blank(self.event_name);
        let (Some(measurement_id), Some(event_name)) = (measurement_id, event_name) else {
            return Err(SettingsError::MissingIdentifiers);
        };
        let thresholds = non_blank(self.thresholds).unwrap_or_else(|| DEFAULT_THRESHOLDS.to_string());
        Ok(Settings {
            measurement_id,
            event_name,
            thresholds,
            selectors: self.selectors.unwrap_or_default(),
            spa_fix: self.spa_fix.unwrap_or(true),
            ajax_forms: self.ajax_forms.unwrap_or(false),
            premium: self.premium.unwrap_or(false),
        })
    }

    /// Loads a request from a `.toml` or `.json` file using the same field names as the HTTP body.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&raw).with_context(|| format!("parsing toml {}", path.display()))
        } else {
            serde_json::from_str(&raw).with_context(|| format!("parsing json {}", path.display()))
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Validated generation input. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub measurement_id: String,
    pub event_name: String,
    pub thresholds: String,
    pub selectors: String,
    pub spa_fix: bool,
    pub ajax_forms: bool,
    pub premium: bool,
}

impl Settings {
    /// Applies the capability gate: without premium, thresholds fall back to the
    /// default set, exclusions are dropped and AJAX form tracking is disabled.
    pub fn gated(self) -> Self {
        if self.premium {
            return self;
        }
        Self {
            thresholds: DEFAULT_THRESHOLDS.to_string(),
            selectors: String::new(),
            ajax_forms: false,
            ..self
        }
    }

    pub fn ajax_enabled(&self) -> bool {
        self.ajax_forms && self.premium
    }

    /// Whether the measurement id or event name carries a `{{name}}` reference.
    pub fn references_variable(&self, name: &str) -> bool {
        [&self.measurement_id, &self.event_name]
            .into_iter()
            .any(|field| container::variable_references(field).any(|r| r == name))
    }

    pub fn listener_params(&self) -> ListenerParams {
        ListenerParams {
            thresholds: self.thresholds.clone(),
            exclusions: self.selectors.clone(),
            nav_fix: self.spa_fix,
        }
    }
}

/// The three values substituted into the emitted listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerParams {
    pub thresholds: String,
    pub exclusions: String,
    pub nav_fix: bool,
}

impl ListenerParams {
    pub fn free_tier(nav_fix: bool) -> Self {
        Self {
            thresholds: DEFAULT_THRESHOLDS.to_string(),
            exclusions: String::new(),
            nav_fix,
        }
    }
}
