//! # Event Templates
//!
//! Exporters may rewrite the message and source fields of the outgoing record from
//! the event's enrichment context. A template is literal text with `{{ .Path }}`
//! actions, e.g. `"{{ .Service.Name }} / {{ .Pod.Status.PodIP }}"`.
//!
//! Paths are resolved against `{"Event": …, "Pod": …, "Service": …}`. Keys match
//! case-insensitively and fields of an object's `metadata` are promoted, so
//! `.Pod.Name` reads `Pod.metadata.name`.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::TemplateError;
use crate::exporter::proto::{Event, Source};
use crate::registry::{EnrichmentContext, Registry};
use crate::types::RawEvent;

/// Upper bound on waiting for the enrichment context before sending anyway.
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(60);

static ACTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").unwrap());
static FIELD_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\.[A-Za-z_][A-Za-z0-9_]*)+$").unwrap());

// ================================================================================================
// TEMPLATE CONFIG
// ================================================================================================

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceTemplateConfig {
    pub service: String,
    pub service_instance: String,
    pub endpoint: String,
}

/// `template` block of an exporter config.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EventTemplateConfig {
    pub message: String,
    pub source: SourceTemplateConfig,
}

// ================================================================================================
// TEMPLATE
// ================================================================================================

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(Vec<String>),
}

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(name: &str, source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for action in ACTION.captures_iter(source) {
            let Some(whole) = action.get(0) else {
                continue;
            };
            push_literal(name, &mut segments, &source[last..whole.start()], last)?;

            let body = action[1].trim();
            if !FIELD_PATH.is_match(body) {
                return Err(TemplateError::InvalidAction {
                    name: name.to_string(),
                    action: body.to_string(),
                });
            }
            segments.push(Segment::Field(
                body.split('.')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ));
            last = whole.end();
        }
        push_literal(name, &mut segments, &source[last..], last)?;

        Ok(Template {
            name: name.to_string(),
            segments,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn render(&self, context: &Value) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(path) => {
                    let value = lookup(context, path).ok_or_else(|| TemplateError::MissingField {
                        name: self.name.clone(),
                        path: format!(".{}", path.join(".")),
                    })?;
                    write_value(&mut out, value);
                }
            }
        }
        Ok(out)
    }
}

fn push_literal(
    name: &str,
    segments: &mut Vec<Segment>,
    text: &str,
    offset: usize,
) -> Result<(), TemplateError> {
    if let Some(open) = text.find("{{") {
        return Err(TemplateError::UnclosedAction {
            name: name.to_string(),
            offset: offset + open,
        });
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

fn lookup<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |value, key| field(value, key))
}

fn field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    object
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
        .or_else(|| {
            object
                .get("metadata")
                .and_then(|meta| meta.as_object())
                .and_then(|meta| meta.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)))
                .map(|(_, v)| v)
        })
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

// ================================================================================================
// EVENT TEMPLATE
// ================================================================================================

/// The four optional field templates of an exporter, compiled at init.
#[derive(Debug, Clone, Default)]
pub struct EventTemplate {
    message: Option<Template>,
    service: Option<Template>,
    service_instance: Option<Template>,
    endpoint: Option<Template>,
}

fn compile_field(name: &str, source: &str) -> Result<Option<Template>, TemplateError> {
    if source.is_empty() {
        return Ok(None);
    }
    let template = Template::parse(name, source)?;
    Ok((!template.is_empty()).then_some(template))
}

impl EventTemplate {
    pub fn compile(config: &EventTemplateConfig) -> Result<Self, TemplateError> {
        Ok(EventTemplate {
            message: compile_field("EventMessageTemplate", &config.message)?,
            service: compile_field("EventSourceServiceTemplate", &config.source.service)?,
            service_instance: compile_field(
                "EventServiceInstanceTemplate",
                &config.source.service_instance,
            )?,
            endpoint: compile_field("EventEndpointTemplate", &config.source.endpoint)?,
        })
    }

    /// Applies every field template to `event`. A render error or an empty result
    /// leaves the field untouched.
    pub fn apply(&self, context: &EnrichmentContext, event: &mut Event) {
        let value = match serde_json::to_value(context) {
            Ok(value) => value,
            Err(err) => {
                debug!("failed to encode template context, using defaults. {}", err);
                return;
            }
        };
        if log::log_enabled!(log::Level::Debug) {
            debug!("template context {}", value);
        }

        let source = event.source.get_or_insert_with(Source::default);
        substitute(&self.service, &value, &mut source.service);
        substitute(&self.service_instance, &value, &mut source.service_instance);
        substitute(&self.endpoint, &value, &mut source.endpoint);
        substitute(&self.message, &value, &mut event.message);
    }

    /// Resolves the context of `raw` and renders into `event`, giving up after
    /// `timeout`. On timeout `event` keeps whatever had been substituted.
    pub async fn render_within(
        &self,
        registry: &Registry,
        raw: &Arc<RawEvent>,
        event: &mut Event,
        timeout: Duration,
        lifetime: &CancellationToken,
    ) {
        let deadline = Instant::now() + timeout;
        let render = async {
            let context = registry.get_context(raw, deadline, lifetime).await;
            self.apply(&context, event);
        };
        if timeout_at(deadline, render).await.is_err() {
            debug!(
                "rendering event {} timed out after {:?}, sending it as is",
                raw.uid, timeout
            );
        }
    }
}

fn substitute(template: &Option<Template>, context: &Value, destination: &mut String) {
    let Some(template) = template else {
        return;
    };
    match template.render(context) {
        Ok(rendered) if !rendered.is_empty() => *destination = rendered,
        Ok(_) => {}
        Err(err) => debug!("failed to render the template, using the default event content. {}", err),
    }
}
