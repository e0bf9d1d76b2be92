use crate::ids::{IdAllocator, Slot};
use crate::listener::script;
use crate::listener::{FORM_SUCCESS_EVENT, THRESHOLD_EVENT};
use crate::settings::{ListenerParams, Settings};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

pub const EXPORT_FORMAT_VERSION: u32 = 2;

pub const DOM_READY_TRIGGER_NAME: &str = "ScrollGenius – Init (DOM Ready)";
pub const THRESHOLD_TRIGGER_NAME: &str = "ScrollGenius – Threshold Event";
pub const FORM_SUCCESS_TRIGGER_NAME: &str = "FormGenius – AJAX Success";
pub const SCROLL_PERCENT_VARIABLE_NAME: &str = "DL – scroll_percent";
pub const FORM_URL_VARIABLE_NAME: &str = "DL – formUrl";
pub const CORE_LISTENER_TAG_NAME: &str = "ScrollGenius – Core Listener";
pub const AJAX_LISTENER_TAG_NAME: &str = "FormGenius – AJAX Listener (Custom HTML)";

/// Top-level container export, as accepted by the tag manager's import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerExport {
    pub export_format_version: u32,
    pub container_version: ContainerVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerVersion {
    pub tag: Vec<Tag>,
    pub trigger: Vec<Trigger>,
    pub variable: Vec<Variable>,
    pub built_in_variable: Vec<BuiltInVariable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub tag_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TagType,
    pub parameter: Vec<Parameter>,
    pub firing_trigger_id: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagType {
    /// Custom HTML.
    Html,
    /// GA4 event.
    Gaawe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub trigger_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<Vec<Parameter>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    DomReady,
    CustomEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub variable_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VariableType,
    pub parameter: Vec<Parameter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    /// Data-layer variable.
    #[serde(rename = "v")]
    DataLayer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltInVariable {
    #[serde(rename = "type")]
    pub kind: BuiltInVariableType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuiltInVariableType {
    PageUrl,
    PageHostname,
    PagePath,
}

impl BuiltInVariableType {
    /// Name used when referencing the variable as `{{...}}`.
    pub fn display_name(self) -> &'static str {
        match self {
            BuiltInVariableType::PageUrl => "Page URL",
            BuiltInVariableType::PageHostname => "Page Hostname",
            BuiltInVariableType::PagePath => "Page Path",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<Parameter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<Vec<Parameter>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Template,
    Boolean,
    Integer,
    List,
    Map,
}

impl Parameter {
    fn scalar(kind: ParameterType, key: &str, value: impl Into<String>) -> Self {
        Self {
            kind,
            key: Some(key.to_string()),
            value: Some(value.into()),
            list: None,
            map: None,
        }
    }

    pub fn template(key: &str, value: impl Into<String>) -> Self {
        Self::scalar(ParameterType::Template, key, value)
    }

    pub fn boolean(key: &str, value: bool) -> Self {
        Self::scalar(ParameterType::Boolean, key, value.to_string())
    }

    pub fn integer(key: &str, value: i64) -> Self {
        Self::scalar(ParameterType::Integer, key, value.to_string())
    }

    pub fn list(key: &str, items: Vec<Parameter>) -> Self {
        Self {
            kind: ParameterType::List,
            key: Some(key.to_string()),
            value: None,
            list: Some(items),
            map: None,
        }
    }

    pub fn map(entries: Vec<Parameter>) -> Self {
        Self {
            kind: ParameterType::Map,
            key: None,
            value: None,
            list: None,
            map: Some(entries),
        }
    }

    /// Visits every scalar value, descending into lists and maps.
    fn visit_values<'a>(&'a self, visit: &mut impl FnMut(&'a str)) {
        if let Some(value) = &self.value {
            visit(value);
        }
        for nested in self.list.iter().chain(self.map.iter()).flatten() {
            nested.visit_values(visit);
        }
    }
}

fn keyed<'a>(parameters: &'a [Parameter], key: &str) -> Option<&'a str> {
    parameters
        .iter()
        .find(|p| p.key.as_deref() == Some(key))
        .and_then(|p| p.value.as_deref())
}

fn variable_ref(name: &str) -> String {
    format!("{{{{{name}}}}}")
}

fn dom_ready_trigger(id: String) -> Trigger {
    Trigger {
        trigger_id: id,
        name: DOM_READY_TRIGGER_NAME.to_string(),
        kind: TriggerType::DomReady,
        filter: Some(Vec::new()),
        parameter: None,
    }
}

fn custom_event_trigger(id: String, name: &str, event: &str) -> Trigger {
    Trigger {
        trigger_id: id,
        name: name.to_string(),
        kind: TriggerType::CustomEvent,
        filter: None,
        parameter: Some(vec![
            Parameter::template("eventName", event),
            Parameter::boolean("useRegex", false),
        ]),
    }
}

fn data_layer_variable(id: String, name: &str, path: &str) -> Variable {
    Variable {
        variable_id: id,
        name: name.to_string(),
        kind: VariableType::DataLayer,
        parameter: vec![
            Parameter::integer("dataLayerVersion", 2),
            Parameter::template("name", path),
        ],
    }
}

fn html_tag(id: String, name: &str, html: String, trigger: String) -> Tag {
    Tag {
        tag_id: id,
        name: name.to_string(),
        kind: TagType::Html,
        parameter: vec![
            Parameter::template("html", html),
            Parameter::boolean("supportDocumentWrite", false),
        ],
        firing_trigger_id: vec![trigger],
    }
}

fn analytics_tag(id: String, settings: &Settings, trigger: String) -> Tag {
    Tag {
        tag_id: id,
        name: format!("GA4 Event – {} (ScrollGenius)", settings.event_name),
        kind: TagType::Gaawe,
        parameter: vec![
            Parameter::template("measurementId", settings.measurement_id.clone()),
            Parameter::template("eventName", settings.event_name.clone()),
            Parameter::list(
                "eventParameters",
                vec![Parameter::map(vec![
                    Parameter::template("name", "percent_scrolled"),
                    Parameter::template("value", variable_ref(SCROLL_PERCENT_VARIABLE_NAME)),
                ])],
            ),
        ],
        firing_trigger_id: vec![trigger],
    }
}

/// Assembles the container for `settings`. Pure apart from the ids, which
/// come from `ids`.
pub fn build(settings: &Settings, ids: &IdAllocator) -> ContainerExport {
    let settings = settings.clone().gated();
    let ajax = settings.ajax_enabled();

    let dom_ready = ids.id(Slot::DomReadyTrigger);
    let threshold = ids.id(Slot::ThresholdTrigger);

    let mut trigger = vec![
        dom_ready_trigger(dom_ready.clone()),
        custom_event_trigger(threshold.clone(), THRESHOLD_TRIGGER_NAME, THRESHOLD_EVENT),
    ];
    if ajax {
        trigger.push(custom_event_trigger(
            ids.id(Slot::FormSuccessTrigger),
            FORM_SUCCESS_TRIGGER_NAME,
            FORM_SUCCESS_EVENT,
        ));
    }

    let mut variable = vec![data_layer_variable(
        ids.id(Slot::ScrollPercentVariable),
        SCROLL_PERCENT_VARIABLE_NAME,
        "scroll_percent",
    )];
    if ajax {
        variable.push(data_layer_variable(
            ids.id(Slot::FormUrlVariable),
            FORM_URL_VARIABLE_NAME,
            "formUrl",
        ));
    }

    let mut tag = vec![
        html_tag(
            ids.id(Slot::CoreListenerTag),
            CORE_LISTENER_TAG_NAME,
            script::core_listener_html(&settings.listener_params()),
            dom_ready.clone(),
        ),
        analytics_tag(ids.id(Slot::AnalyticsTag), &settings, threshold),
    ];
    if ajax {
        tag.push(html_tag(
            ids.id(Slot::AjaxListenerTag),
            AJAX_LISTENER_TAG_NAME,
            script::ajax_listener_html(),
            dom_ready,
        ));
    }

    let mut export = ContainerExport {
        export_format_version: EXPORT_FORMAT_VERSION,
        container_version: ContainerVersion {
            tag,
            trigger,
            variable,
            built_in_variable: vec![
                BuiltInVariable {
                    kind: BuiltInVariableType::PageUrl,
                },
                BuiltInVariable {
                    kind: BuiltInVariableType::PageHostname,
                },
                BuiltInVariable {
                    kind: BuiltInVariableType::PagePath,
                },
            ],
        },
    };

    if !settings.premium {
        export.enforce_free_tier(&ids.id(Slot::CoreListenerTag), settings.spa_fix);
    }
    debug!(
        id_base = ids.base(),
        premium = settings.premium,
        ajax,
        tags = export.container_version.tag.len(),
        "container assembled"
    );
    export
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContainerError {
    #[error("duplicate {collection} id {id}")]
    DuplicateId { collection: &'static str, id: String },
    #[error("tag {tag} has no firing trigger")]
    NoFiringTrigger { tag: String },
    #[error("tag {tag} fires on unknown trigger {trigger}")]
    UnknownTrigger { tag: String, trigger: String },
    #[error("{owner} references undeclared variable `{name}`")]
    UndeclaredVariable { owner: String, name: String },
    #[error("expected exactly one {what}, found {found}")]
    Cardinality { what: &'static str, found: usize },
    #[error("AJAX form tracking is only partially present")]
    PartialAjax,
}

static VARIABLE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("variable reference pattern"));

/// Names referenced as `{{name}}` in a parameter value.
pub fn variable_references(value: &str) -> impl Iterator<Item = &str> + '_ {
    VARIABLE_REF
        .captures_iter(value)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
}

impl ContainerExport {
    /// Rewrites the core listener payload with the free-tier parameters,
    /// whatever it was built with.
    pub fn enforce_free_tier(&mut self, core_tag_id: &str, nav_fix: bool) {
        let Some(tag) = self
            .container_version
            .tag
            .iter_mut()
            .find(|t| t.tag_id == core_tag_id)
        else {
            warn!(core_tag_id, "core listener tag missing; nothing to gate");
            return;
        };
        let html = script::core_listener_html(&ListenerParams::free_tier(nav_fix));
        if let Some(param) = tag
            .parameter
            .iter_mut()
            .find(|p| p.key.as_deref() == Some("html"))
        {
            param.value = Some(html);
        }
    }

    pub fn core_listener(&self) -> Option<&Tag> {
        self.container_version
            .tag
            .iter()
            .find(|t| t.name == CORE_LISTENER_TAG_NAME)
    }

    /// The `html` payload of a Custom HTML tag.
    pub fn html_of(tag: &Tag) -> Option<&str> {
        keyed(&tag.parameter, "html")
    }

    /// Checks the cross-references and the fixed shape of the document.
    pub fn verify(&self) -> Result<(), ContainerError> {
        let version = &self.container_version;
        unique_ids("tag", version.tag.iter().map(|t| t.tag_id.as_str()))?;
        unique_ids("trigger", version.trigger.iter().map(|t| t.trigger_id.as_str()))?;
        unique_ids("variable", version.variable.iter().map(|v| v.variable_id.as_str()))?;

        let trigger_ids: HashSet<&str> =
            version.trigger.iter().map(|t| t.trigger_id.as_str()).collect();
        for tag in &version.tag {
            if tag.firing_trigger_id.is_empty() {
                return Err(ContainerError::NoFiringTrigger {
                    tag: tag.name.clone(),
                });
            }
            if let Some(missing) = tag
                .firing_trigger_id
                .iter()
                .find(|id| !trigger_ids.contains(id.as_str()))
            {
                return Err(ContainerError::UnknownTrigger {
                    tag: tag.name.clone(),
                    trigger: missing.clone(),
                });
            }
        }

        let declared: HashSet<&str> = version
            .variable
            .iter()
            .map(|v| v.name.as_str())
            .chain(version.built_in_variable.iter().map(|b| b.kind.display_name()))
            .collect();
        let owners = version
            .tag
            .iter()
            .map(|t| (&t.name, t.parameter.as_slice()))
            .chain(
                version
                    .trigger
                    .iter()
                    .map(|t| (&t.name, t.parameter.as_deref().unwrap_or_default())),
            )
            .chain(version.variable.iter().map(|v| (&v.name, v.parameter.as_slice())));
        for (owner, parameters) in owners {
            let mut undeclared = None;
            for parameter in parameters {
                parameter.visit_values(&mut |value| {
                    for name in variable_references(value) {
                        if undeclared.is_none() && !declared.contains(name) {
                            undeclared = Some(name.to_string());
                        }
                    }
                });
            }
            if let Some(name) = undeclared {
                return Err(ContainerError::UndeclaredVariable {
                    owner: owner.clone(),
                    name,
                });
            }
        }

        let dom_ready: Vec<&Trigger> = version
            .trigger
            .iter()
            .filter(|t| t.kind == TriggerType::DomReady)
            .collect();
        exactly_one("DOM ready trigger", dom_ready.len())?;

        let threshold_triggers: Vec<&Trigger> = custom_event_triggers(version, THRESHOLD_EVENT);
        exactly_one("threshold trigger", threshold_triggers.len())?;
        let threshold_id = threshold_triggers[0].trigger_id.as_str();
        let analytics = version
            .tag
            .iter()
            .filter(|t| {
                t.kind == TagType::Gaawe && t.firing_trigger_id.iter().any(|id| id == threshold_id)
            })
            .count();
        exactly_one("analytics tag on the threshold trigger", analytics)?;

        let ajax_parts = [
            custom_event_triggers(version, FORM_SUCCESS_EVENT).len(),
            version
                .variable
                .iter()
                .filter(|v| v.name == FORM_URL_VARIABLE_NAME)
                .count(),
            version
                .tag
                .iter()
                .filter(|t| t.name == AJAX_LISTENER_TAG_NAME)
                .count(),
        ];
        if ajax_parts.iter().any(|n| *n > 1) || ajax_parts.iter().any(|n| *n != ajax_parts[0]) {
            return Err(ContainerError::PartialAjax);
        }
        Ok(())
    }
}

fn custom_event_triggers<'a>(version: &'a ContainerVersion, event: &str) -> Vec<&'a Trigger> {
    version
        .trigger
        .iter()
        .filter(|t| {
            t.kind == TriggerType::CustomEvent
                && t.parameter
                    .as_deref()
                    .and_then(|p| keyed(p, "eventName"))
                    == Some(event)
        })
        .collect()
}

fn unique_ids<'a>(
    collection: &'static str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<(), ContainerError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ContainerError::DuplicateId {
                collection,
                id: id.to_string(),
            });
        }
    }
    Ok(())
}

fn exactly_one(what: &'static str, found: usize) -> Result<(), ContainerError> {
    if found == 1 {
        Ok(())
    } else {
        Err(ContainerError::Cardinality { what, found })
    }
}
