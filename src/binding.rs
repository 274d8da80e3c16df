//! Workflow bindings and their cached parameter schemas.
//!
//! A binding is the tuple (endpoint, credential, cached schema) identifying
//! one remote workflow. The cached schema is the authoritative description
//! used for row validation and template shaping; it is never inferred from
//! row content and only changes through an explicit sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a workflow binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingId(pub Uuid);

impl BindingId {
    pub fn new() -> Self {
        BindingId(Uuid::new_v4())
    }
}

impl Default for BindingId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BindingId {
    fn from(uuid: Uuid) -> Self {
        BindingId(uuid)
    }
}

impl std::ops::Deref for BindingId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Parameter kinds accepted by the remote workflow service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Select,
    Paragraph,
    File,
}

/// One input parameter of a workflow, as described by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl ParameterSpec {
    /// Check a single cell against this parameter.
    ///
    /// Returns a human-readable rejection reason, or `None` when the cell is
    /// acceptable. An empty cell is only rejected for required parameters.
    pub fn check_cell(&self, cell: &str) -> Option<String> {
        let cell = cell.trim();
        if cell.is_empty() {
            return self
                .required
                .then(|| format!("required parameter '{}' is empty", self.name));
        }
        match self.kind {
            ParameterType::Number => cell
                .parse::<f64>()
                .is_err()
                .then(|| format!("'{}' is not a number for parameter '{}'", cell, self.name)),
            ParameterType::Select => {
                (!self.options.is_empty() && !self.options.iter().any(|o| o == cell)).then(|| {
                    format!(
                        "'{}' is not one of the allowed options for parameter '{}'",
                        cell, self.name
                    )
                })
            }
            ParameterType::String | ParameterType::Paragraph | ParameterType::File => None,
        }
    }
}

/// The cached parameter schema of a workflow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub parameters: Vec<ParameterSpec>,
}

impl ParameterSchema {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn required_names(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
    }
}

/// A registered workflow binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowBinding {
    pub id: BindingId,
    pub name: String,
    pub description: Option<String>,
    /// Base URL of the remote service, without the `/workflows/run` suffix
    pub base_url: String,
    /// Bearer credential presented on every call
    pub credential: String,
    /// Schema cached from the remote service; `None` only for bindings that
    /// have never synced successfully
    pub schema: Option<ParameterSchema>,
    pub synced_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Mutable fields accepted by `update_binding`.
///
/// The endpoint itself is not updatable; replacing the endpoint is creating
/// a different binding.
#[derive(Debug, Clone, Default)]
pub struct BindingUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub credential: Option<String>,
    pub active: Option<bool>,
}

/// A single field error produced while validating a sheet row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    /// 0-based row position in the unmodified input sheet
    pub source_row_index: u32,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "row {} field '{}': {}",
            self.source_row_index, self.field, self.message
        )
    }
}
