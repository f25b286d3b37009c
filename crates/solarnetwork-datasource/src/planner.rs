//! Turning dashboard queries into datum filters.

use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::{
    domain::{Aggregation, CombiningType, DatumReadingType},
    filter::DatumFilter,
    Error, Result,
};

/// The node id standing in for a group of combined nodes.
pub const COMBINED_NODE_ID: i64 = -1;

/// The source id standing in for combined sources.
pub const COMBINED_SOURCE_ID: &str = "Sum";

/// The aggregation used by combining queries when none was chosen.
const DEFAULT_COMBINING_AGGREGATION: Aggregation = Aggregation::FiveMinute;

/// A query as sent by the query editor, before validation.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryJson {
    /// `list` or `reading`, or their legacy `datumList`/`datumReading` names.
    pub query_type: Option<String>,
    /// The nodes to query.
    pub node_ids: Vec<i64>,
    /// Source ids or wildcard patterns.
    pub source_ids: Vec<String>,
    /// The datum properties to chart.
    pub metrics: Vec<String>,
    /// A combining type name, or `none`.
    pub combining_type: Option<String>,
    /// An aggregation name, `auto` or `none`.
    pub aggregation: Option<String>,
    /// A datum reading type name.
    pub datum_reading_type: Option<String>,
}

/// Which API a target is answered from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryType {
    /// The datum list API.
    #[default]
    List,
    /// The datum reading API.
    Reading,
}

impl FromStr for QueryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "list" | "datumList" => Ok(Self::List),
            "reading" | "datumReading" => Ok(Self::Reading),
            other => Err(Error::UnknownQueryType(other.to_string())),
        }
    }
}

/// The aggregation requested by a target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AggregationChoice {
    /// Pick an aggregation from the span of the time range.
    #[default]
    Auto,
    /// Return raw datum.
    None,
    /// Always use this aggregation.
    Fixed(Aggregation),
}

impl FromStr for AggregationChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else if s.eq_ignore_ascii_case("none") {
            Ok(Self::None)
        } else {
            s.parse().map(Self::Fixed)
        }
    }
}

/// One validated dashboard query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryTarget {
    /// The Grafana reference id of the query.
    pub ref_id: String,
    /// The nodes to query; duplicates are allowed.
    pub node_ids: Vec<i64>,
    /// Source ids or wildcard patterns.
    pub source_ids: Vec<String>,
    /// The datum properties to chart, one field each.
    pub metrics: Vec<String>,
    /// Which API answers the query.
    pub query_type: QueryType,
    /// Merge nodes and sources server-side, for list queries.
    pub combining_type: Option<CombiningType>,
    /// The requested aggregation.
    pub aggregation: AggregationChoice,
    /// The reading type, for reading queries.
    pub datum_reading_type: DatumReadingType,
}

impl QueryTarget {
    /// Validate the raw JSON of the query with reference id `ref_id`.
    pub fn from_json(ref_id: impl Into<String>, json: QueryJson) -> Result<Self> {
        let combining_type = match json.combining_type.as_deref() {
            None | Some("") => None,
            Some(s) if s.eq_ignore_ascii_case("none") => None,
            Some(s) => Some(s.parse()?),
        };
        Ok(Self {
            ref_id: ref_id.into(),
            node_ids: json.node_ids,
            source_ids: json.source_ids,
            metrics: json.metrics,
            query_type: json.query_type.as_deref().unwrap_or_default().parse()?,
            combining_type,
            aggregation: json.aggregation.as_deref().unwrap_or_default().parse()?,
            datum_reading_type: match json.datum_reading_type.as_deref() {
                None | Some("") => DatumReadingType::default(),
                Some(s) => s.parse()?,
            },
        })
    }
}

/// How the rows of a plan are fetched and timestamped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryMode {
    /// A plain datum list.
    List,
    /// A datum list with nodes and sources merged server-side.
    Combining,
    /// A datum reading of the given type.
    Reading(DatumReadingType),
}

/// The identity frames of a plan are keyed by.
///
/// For combining plans this is the combined identity rather than the
/// requested nodes and sources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeriesIdentity {
    /// The reference id frames are reported under.
    pub ref_id: String,
    /// The node ids, `[-1]` once combined.
    pub node_ids: Vec<i64>,
    /// The source ids, `["Sum"]` once combined.
    ///
    /// Frame keys take their source from the returned datum, which for
    /// combined rows is the combining type's name.
    pub source_ids: Vec<String>,
    /// The metric columns of every frame, in order.
    pub metrics: Vec<String>,
}

impl SeriesIdentity {
    /// Whether more than one distinct node is involved, in which case series
    /// keys include the node id.
    pub fn has_multiple_nodes(&self) -> bool {
        self.node_ids.iter().collect::<BTreeSet<_>>().len() > 1
    }
}

/// A filter ready to execute, with the mode and identity needed to read its results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryPlan {
    /// The filter to request.
    pub filter: DatumFilter,
    /// The API to request it from.
    pub mode: QueryMode,
    /// The identity of the resulting series.
    pub series: SeriesIdentity,
}

/// The aggregation `auto` resolves to for a range spanning `span`.
pub fn auto_aggregation(span: Duration) -> Option<Aggregation> {
    let days = span.num_seconds() as f64 / 86_400.0;
    if days > 366.0 {
        Some(Aggregation::Month)
    } else if days > 30.0 {
        Some(Aggregation::Day)
    } else if days > 7.0 {
        Some(Aggregation::Hour)
    } else {
        None
    }
}

/// Plan `target` over the range `from..to`.
pub fn plan(target: &QueryTarget, from: DateTime<Utc>, to: DateTime<Utc>) -> QueryPlan {
    // The API treats the end date as exclusive at minute precision.
    let to = to + Duration::minutes(1);
    let aggregation = match target.aggregation {
        AggregationChoice::Auto => auto_aggregation(to - from),
        AggregationChoice::None => None,
        AggregationChoice::Fixed(aggregation) => Some(aggregation),
    };
    let base = DatumFilter {
        start_date: Some(from),
        end_date: Some(to),
        aggregation,
        ..Default::default()
    };
    let identity = SeriesIdentity {
        ref_id: target.ref_id.clone(),
        node_ids: target.node_ids.clone(),
        source_ids: target.source_ids.clone(),
        metrics: target.metrics.clone(),
    };

    let plan = match (target.query_type, target.combining_type) {
        (QueryType::Reading, _) => QueryPlan {
            filter: DatumFilter {
                node_ids: target.node_ids.clone(),
                source_ids: target.source_ids.clone(),
                ..base
            },
            mode: QueryMode::Reading(target.datum_reading_type),
            series: identity,
        },
        (QueryType::List, None) => QueryPlan {
            filter: DatumFilter {
                node_ids: target.node_ids.clone(),
                source_ids: target.source_ids.clone(),
                ..base
            },
            mode: QueryMode::List,
            series: identity,
        },
        (QueryType::List, Some(combining_type)) => {
            let nodes: BTreeSet<i64> = target.node_ids.iter().copied().collect();
            let mut node_id_maps = BTreeMap::new();
            if nodes.len() > 1 {
                node_id_maps.insert(COMBINED_NODE_ID, nodes);
            }
            QueryPlan {
                filter: DatumFilter {
                    node_ids: target.node_ids.clone(),
                    source_ids: target.source_ids.clone(),
                    aggregation: aggregation.or(Some(DEFAULT_COMBINING_AGGREGATION)),
                    combining_type: Some(combining_type),
                    node_id_maps,
                    source_id_maps: BTreeMap::from([(
                        combining_type.name().to_string(),
                        target.source_ids.iter().cloned().collect(),
                    )]),
                    ..base
                },
                mode: QueryMode::Combining,
                series: SeriesIdentity {
                    node_ids: vec![COMBINED_NODE_ID],
                    source_ids: vec![COMBINED_SOURCE_ID.to_string()],
                    ..identity
                },
            }
        }
    };
    debug!(ref_id = %target.ref_id, mode = ?plan.mode, aggregation = ?plan.filter.aggregation, "Planned query");
    plan
}
