//! Per-tick telemetry
//!
//! Two sinks exist side by side:
//! - `State`: a string-keyed snapshot of every sub-component, rebuilt from
//!   scratch each tick and handed to the host's tick callback
//! - `Graph`: named time series of normalized occupancy ratios
//!   (`elapsed * fps * 0.5`, so 1.0 means a step consumed a full half-frame
//!   budget), kept current for dashboards
//!
//! State values serialize to JSON so hosts can publish them over OSC or
//! HTTP without knowing the shape in advance.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use log::debug;
use serde::Serialize;

/// One value in the telemetry state tree
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    Text(String),
    Int(i64),
    Real(f64),
    Bool(bool),
    List(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Text(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Text(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Int(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Real(v)
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

/// String-keyed telemetry snapshot, replaced (not merged) every tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct State {
    values: BTreeMap<String, StateValue>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Insert or replace a single value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Insert or replace a whole sub-tree under `prefix`
    pub fn insert_tree(&mut self, prefix: impl Into<String>, tree: State) {
        self.values
            .insert(prefix.into(), StateValue::Map(tree.values));
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateValue)> {
        self.values.iter()
    }

    /// Serialize the whole snapshot as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.values).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Color hint for a graph series
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

#[derive(Debug, Clone)]
struct Series {
    color: Option<Color>,
    value: f64,
}

/// Diagnostics graph: named series of normalized occupancy ratios
///
/// Thread-safe; the channel loop writes it every tick and listeners receive
/// a shared handle so schedulers can record their own series (e.g.
/// `skipped-schedule`) next to the loop's.
pub struct Graph {
    text: Mutex<String>,
    series: Mutex<HashMap<String, Series>>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            text: Mutex::new(String::new()),
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Register or recolor a series
    pub fn set_color(&self, name: &str, color: Color) {
        let mut series = self.series.lock().unwrap();
        series
            .entry(name.to_string())
            .and_modify(|s| s.color = Some(color))
            .or_insert(Series {
                color: Some(color),
                value: 0.0,
            });
    }

    /// Record the latest normalized value for a series
    pub fn set_value(&self, name: &str, value: f64) {
        let mut series = self.series.lock().unwrap();
        series
            .entry(name.to_string())
            .and_modify(|s| s.value = value)
            .or_insert(Series {
                color: None,
                value,
            });
        if value > 1.0 {
            debug!("graph: {} over budget ({:.3})", name, value);
        }
    }

    /// Latest recorded value, if the series exists
    pub fn value(&self, name: &str) -> Option<f64> {
        self.series.lock().unwrap().get(name).map(|s| s.value)
    }

    pub fn color(&self, name: &str) -> Option<Color> {
        self.series.lock().unwrap().get(name).and_then(|s| s.color)
    }

    /// Set the graph's caption (e.g. the owning channel's identity)
    pub fn set_text(&self, text: impl Into<String>) {
        *self.text.lock().unwrap() = text.into();
    }

    pub fn text(&self) -> String {
        self.text.lock().unwrap().clone()
    }

    /// Names of all registered series
    pub fn series_names(&self) -> Vec<String> {
        self.series.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
