//! # Native Classifier Outputs
//!
//! Each classifier family answers in its own shape. The tables inside those answers
//! arrive in pandas "split" orientation (`columns`, `index`, `data`), with NaN written
//! as `null` and cells that may be numbers, numeric strings, or free text.
//!
//! This module only decodes those shapes and coerces individual cells. Deciding what
//! a cell means is the adapters' job.

use crate::types::LabelScores;
use serde::{Deserialize, Deserializer};
use serde_json::Value as Json;

/// One native table in pandas split orientation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NativeTable {
    #[serde(default, deserialize_with = "labels")]
    pub columns: Vec<String>,
    #[serde(default, deserialize_with = "labels")]
    pub index: Vec<String>,
    #[serde(default)]
    pub data: Vec<Vec<Json>>,
}

/// A borrowed view of one table row.
#[derive(Debug, Clone, Copy)]
pub struct TableRow<'a> {
    columns: &'a [String],
    cells: &'a [Json],
}

impl NativeTable {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, i: usize) -> Option<TableRow<'_>> {
        self.data.get(i).map(|cells| TableRow {
            columns: &self.columns,
            cells,
        })
    }

    /// The row whose index label equals `key`.
    pub fn row_by_index(&self, key: &str) -> Option<TableRow<'_>> {
        let position = self.index.iter().position(|k| k == key)?;
        self.row(position)
    }
}

impl<'a> TableRow<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Json> {
        let position = self.columns.iter().position(|c| c == column)?;
        self.cells.get(position)
    }

    pub fn iter(self) -> impl Iterator<Item = (&'a str, &'a Json)> + 'a {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.cells.iter())
    }
}

/// ALLSorts: a predictions table and a parallel probabilities table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlatNative {
    pub predictions: NativeTable,
    #[serde(default)]
    pub probabilities: NativeTable,
}

/// One level of a TALLSorts result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NativeLevel {
    pub name: String,
    #[serde(default)]
    pub calls_df: Option<NativeTable>,
    #[serde(default)]
    pub probs_raw_df: Option<NativeTable>,
}

/// TALLSorts: levels in the classifier's own order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HierarchicalNative {
    pub levels: Vec<NativeLevel>,
}

/// Bridge: predictions, probabilities and latent embedding tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeNative {
    pub predictions: NativeTable,
    #[serde(default)]
    pub probabilities: NativeTable,
    #[serde(default)]
    pub latents: NativeTable,
}

fn labels<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Json> = Vec::deserialize(deserializer)?;
    Ok(raw.iter().map(label_text).collect())
}

fn label_text(json: &Json) -> String {
    match json {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The result of coercing one cell to a number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coerced {
    Number(f64),
    /// `null` or NaN: no value, but not malformed either.
    Missing,
    /// Free text, an infinity, or a structured value that is not a number.
    Unparseable,
}

pub fn coerce_number(cell: &Json) -> Coerced {
    match cell {
        Json::Number(n) => n.as_f64().map_or(Coerced::Unparseable, finite_or_unparseable),
        Json::Null => Coerced::Missing,
        Json::Bool(b) => Coerced::Number(if *b { 1.0 } else { 0.0 }),
        Json::String(s) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_nan() => Coerced::Missing,
            Ok(v) => finite_or_unparseable(v),
            Err(_) => Coerced::Unparseable,
        },
        Json::Array(_) | Json::Object(_) => Coerced::Unparseable,
    }
}

/// Infinite scores cannot be ranked or written as JSON numbers.
fn finite_or_unparseable(v: f64) -> Coerced {
    if v.is_finite() {
        Coerced::Number(v)
    } else {
        Coerced::Unparseable
    }
}

/// A cell rendered as a label; `None` for `null`.
pub fn cell_label(cell: &Json) -> Option<String> {
    match cell {
        Json::Null => None,
        other => Some(label_text(other)),
    }
}

/// Collects the numeric cells of a row as label scores.
///
/// `label_for` maps a column name to the label it scores, or `None` to skip the
/// column. Missing values are kept as NaN; unparseable values drop just that entry
/// and are reported through the log.
pub fn collect_scores<F>(row: TableRow<'_>, mut label_for: F) -> LabelScores
where
    F: FnMut(&str) -> Option<String>,
{
    let mut scores = LabelScores::new();
    for (column, cell) in row.iter() {
        let Some(label) = label_for(column) else {
            continue;
        };
        match coerce_number(cell) {
            Coerced::Number(v) => scores.insert(label, v),
            Coerced::Missing => scores.insert(label, f64::NAN),
            Coerced::Unparseable => {
                log::warn!(
                    "Dropped '{}': value {} is not a number.",
                    column,
                    cell
                );
            }
        }
    }
    scores
}
