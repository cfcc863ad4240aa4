//! Container list filters.
//!
//! Parses the Docker `filters` query parameter, which arrives either as
//! `{"key":["value",...]}` or as the legacy `{"key":{"value":true}}`.

use crate::error::{CoreError, Result};
use crate::image::normalize_reference;
use crate::state::{Container, ContainerState};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// Criteria for selecting containers from the store.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// Accepted states; empty accepts all.
    pub states: Vec<ContainerState>,
    /// Required labels: key, optionally with an exact value.
    pub labels: Vec<(String, Option<String>)>,
    /// Name patterns, matched against the name with and without its slash.
    pub names: Vec<Regex>,
    /// Id prefixes.
    pub ids: Vec<String>,
    /// Image references or ids.
    pub ancestors: Vec<String>,
}

impl ContainerFilter {
    /// Parses a Docker filter document.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed JSON, unknown states, invalid
    /// name patterns or unsupported keys.
    pub fn from_docker_json(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let parsed: HashMap<String, Value> = serde_json::from_str(raw)
            .map_err(|e| CoreError::validation(format!("invalid filters: {e}")))?;

        let mut filter = Self::default();
        for (key, value) in parsed {
            for item in filter_values(&key, &value)? {
                match key.as_str() {
                    "status" | "state" => {
                        let state = ContainerState::parse(&item).ok_or_else(|| {
                            CoreError::validation(format!("invalid filter 'status={item}'"))
                        })?;
                        filter.states.push(state);
                    }
                    "label" => {
                        let (k, v) = match item.split_once('=') {
                            Some((k, v)) => (k.to_string(), Some(v.to_string())),
                            None => (item.clone(), None),
                        };
                        filter.labels.push((k, v));
                    }
                    "name" => {
                        let re = Regex::new(&item).map_err(|e| {
                            CoreError::validation(format!("invalid filter 'name={item}': {e}"))
                        })?;
                        filter.names.push(re);
                    }
                    "id" => filter.ids.push(item),
                    "ancestor" => filter.ancestors.push(item),
                    other => {
                        return Err(CoreError::validation(format!(
                            "invalid filter '{other}'"
                        )))
                    }
                }
            }
        }
        Ok(filter)
    }

    /// Whether the filter restricts states explicitly.
    #[must_use]
    pub fn has_state_filter(&self) -> bool {
        !self.states.is_empty()
    }

    /// Tests a container against every criterion.
    ///
    /// Keys are combined with AND. Values of one key are combined with OR,
    /// except labels, which must all be present.
    #[must_use]
    pub fn matches(&self, container: &Container) -> bool {
        if !self.states.is_empty() && !self.states.contains(&container.state) {
            return false;
        }
        if !any_or_empty(&self.ids, |p| container.id.starts_with(p.as_str())) {
            return false;
        }
        let bare_name = container.name.trim_start_matches('/');
        if !any_or_empty(&self.names, |re| {
            re.is_match(&container.name) || re.is_match(bare_name)
        }) {
            return false;
        }
        let labels_ok = self.labels.iter().all(|(k, v)| {
            container
                .config
                .labels
                .get(k)
                .is_some_and(|actual| v.as_ref().map_or(true, |want| want == actual))
        });
        if !labels_ok {
            return false;
        }
        any_or_empty(&self.ancestors, |a| {
            container.image_id == *a
                || container.image_id.trim_start_matches("sha256:").starts_with(a.as_str())
                || normalize_reference(&container.config.image) == normalize_reference(a)
        })
    }
}

fn any_or_empty<T>(values: &[T], pred: impl FnMut(&T) -> bool) -> bool {
    values.is_empty() || values.iter().any(pred)
}

fn filter_values(key: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(ToString::to_string)
                    .ok_or_else(|| CoreError::validation(format!("invalid value for filter '{key}'")))
            })
            .collect(),
        Value::Object(map) => Ok(map
            .iter()
            .filter(|(_, enabled)| enabled.as_bool().unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect()),
        Value::String(s) => Ok(vec![s.clone()]),
        _ => Err(CoreError::validation(format!(
            "invalid value for filter '{key}'"
        ))),
    }
}
