//! Widget domain types: definitions, their placements on dashboard grids,
//! and the per-instance execution state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution state of a widget instance.
///
/// `Stopped` is both the initial state and the state forced on every
/// instance when the scheduler is reinitialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WidgetState {
    Running,
    #[default]
    Stopped,
    Warning,
}

impl WidgetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WidgetState::Running => "RUNNING",
            WidgetState::Stopped => "STOPPED",
            WidgetState::Warning => "WARNING",
        }
    }
}

impl fmt::Display for WidgetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for WidgetState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(WidgetState::Running),
            "STOPPED" => Ok(WidgetState::Stopped),
            "WARNING" => Ok(WidgetState::Warning),
            other => anyhow::bail!("unknown widget state '{}'", other),
        }
    }
}

/// Type of a widget or category parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    #[default]
    Text,
    Number,
    Boolean,
    Combo,
    MultiCombo,
    /// Encrypted at rest, decrypted only inside the execution task.
    Password,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Text => "TEXT",
            DataType::Number => "NUMBER",
            DataType::Boolean => "BOOLEAN",
            DataType::Combo => "COMBO",
            DataType::MultiCombo => "MULTI_COMBO",
            DataType::Password => "PASSWORD",
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, DataType::Password)
    }
}

impl FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(DataType::Text),
            "NUMBER" => Ok(DataType::Number),
            "BOOLEAN" => Ok(DataType::Boolean),
            "COMBO" => Ok(DataType::Combo),
            "MULTI_COMBO" => Ok(DataType::MultiCombo),
            "PASSWORD" => Ok(DataType::Password),
            other => anyhow::bail!("unknown data type '{}'", other),
        }
    }
}

/// A parameter declared by a widget definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetParam {
    pub name: String,
    pub default_value: Option<String>,
    pub data_type: DataType,
    pub required: bool,
}

/// A global parameter shared by every widget of a category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryParameter {
    pub key: String,
    pub value: String,
    pub data_type: DataType,
}

/// A widget definition: the user-authored script and its scheduling knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Widget {
    pub id: i64,
    pub name: String,
    pub script: Option<String>,
    pub delay_secs: Option<i64>,
    pub timeout_secs: Option<i64>,
    pub params: Vec<WidgetParam>,
    pub category_parameters: Vec<CategoryParameter>,
}

/// One placement of a widget on a dashboard grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WidgetInstance {
    pub id: i64,
    pub dashboard_id: i64,
    pub dashboard_token: String,
    pub grid_id: i64,
    pub widget: Widget,
    /// Line-oriented `key=value` configuration.
    pub configuration: Option<String>,
    pub state: WidgetState,
    pub log: Option<String>,
    pub data: Option<String>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl WidgetInstance {
    /// Stand-in used when an instance cannot be found. It has no script and
    /// is therefore never executable.
    pub fn placeholder(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardGrid {
    pub id: i64,
    pub widget_instance_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dashboard {
    pub id: i64,
    pub token: String,
    pub name: String,
    pub grids: Vec<DashboardGrid>,
}

impl Dashboard {
    /// Every widget instance across all grids, in grid order.
    pub fn widget_instance_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.grids
            .iter()
            .flat_map(|grid| grid.widget_instance_ids.iter().copied())
    }
}

/// Parse a `key=value` configuration into a property map.
///
/// Blank lines and `#` comments are skipped. The first `=` splits key from
/// value; a line without `=` yields an empty value.
pub fn parse_properties(configuration: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    for line in configuration.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (line, ""),
        };
        if !key.is_empty() {
            properties.insert(key.to_string(), value.to_string());
        }
    }
    properties
}

/// True when `data` is a JSON object or array.
pub fn is_structured(data: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(data),
        Ok(serde_json::Value::Object(_)) | Ok(serde_json::Value::Array(_))
    )
}
