//! Reshaping datum rows into per-series column frames.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use grafana_plugin_sdk::{data, prelude::*};
use serde_json::Value;

use crate::{
    executor::Datum,
    planner::{QueryMode, QueryPlan, SeriesIdentity},
    Error, Result,
};

/// The name of the time column of every frame.
pub const TIME_FIELD: &str = "Time";

/// The values of one metric, aligned with the time column of its frame.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricColumn {
    /// The metric, also used as the field name.
    pub name: String,
    /// One slot per row; `None` where the row lacked a numeric value.
    pub values: Vec<Option<f64>>,
}

/// The rows of one node/source series, in column form.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesFrame {
    /// The series key, also used as the frame name.
    pub key: String,
    /// The reference id of the query the series answers.
    pub ref_id: String,
    /// The row timestamps, in arrival order.
    pub time: Vec<DateTime<Utc>>,
    /// One column per requested metric, in request order.
    pub metrics: Vec<MetricColumn>,
}

impl SeriesFrame {
    fn new(key: String, series: &SeriesIdentity) -> Self {
        Self {
            key,
            ref_id: series.ref_id.clone(),
            time: Vec::new(),
            metrics: series
                .metrics
                .iter()
                .map(|name| MetricColumn {
                    name: name.clone(),
                    values: Vec::new(),
                })
                .collect(),
        }
    }

    fn push(&mut self, time: DateTime<Utc>, datum: &Datum) {
        self.time.push(time);
        for column in &mut self.metrics {
            column.values.push(datum.fields.get(&column.name).and_then(metric_value));
        }
    }

    /// Convert into a Grafana data frame named after the series key.
    pub fn into_frame(self) -> data::Frame {
        data::Frame::new(self.key)
            .with_field(self.time.into_field(TIME_FIELD))
            .with_fields(
                self.metrics
                    .into_iter()
                    .map(|column| column.values.into_opt_field(column.name)),
            )
    }
}

/// The key of the series `datum` belongs to: `"<node> <source>"` when several
/// nodes are involved, else just the source id.
pub fn series_key(series: &SeriesIdentity, datum: &Datum) -> String {
    if series.has_multiple_nodes() {
        format!("{} {}", datum.node_id, datum.source_id)
    } else {
        datum.source_id.clone()
    }
}

/// Group `rows` into one frame per series key.
///
/// Frames are returned in the order their keys were first seen, and rows keep
/// their arrival order within each frame.
pub fn reshape(plan: &QueryPlan, rows: &[Datum]) -> Result<Vec<SeriesFrame>> {
    let time_field = match plan.mode {
        QueryMode::List | QueryMode::Combining => "created",
        QueryMode::Reading(_) => "endDate",
    };
    let mut frames: Vec<SeriesFrame> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for datum in rows {
        let time = parse_timestamp(datum.fields.get(time_field))?;
        let key = series_key(&plan.series, datum);
        let i = match index.get(&key) {
            Some(&i) => i,
            None => {
                index.insert(key.clone(), frames.len());
                frames.push(SeriesFrame::new(key, &plan.series));
                frames.len() - 1
            }
        };
        frames[i].push(time, datum);
    }
    Ok(frames)
}

fn metric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_timestamp(value: Option<&Value>) -> Result<DateTime<Utc>> {
    match value {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| parse_naive(s, "%Y-%m-%d %H:%M:%S%.fZ"))
            .or_else(|_| parse_naive(s, "%Y-%m-%d %H:%M:%S%.f"))
            .map_err(|_| Error::InvalidTimestamp(s.clone())),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| Error::InvalidTimestamp(n.to_string())),
        Some(other) => Err(Error::InvalidTimestamp(other.to_string())),
        None => Err(Error::InvalidTimestamp("<missing>".to_string())),
    }
}

// SolarNetwork writes timestamps as `2024-01-01 00:00:00.000Z`.
fn parse_naive(s: &str, format: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, format).map(|t| t.and_utc())
}
