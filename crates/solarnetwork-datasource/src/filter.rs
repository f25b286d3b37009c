//! Datum filters and the API requests built from them.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::domain::{Aggregation, CombiningType, DatumReadingType};

const NODES_PATH: &str = "/solarquery/api/v1/sec/nodes";
const DATUM_LIST_PATH: &str = "/solarquery/api/v1/sec/datum/list";
const DATUM_READING_PATH: &str = "/solarquery/api/v1/sec/datum/reading";

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Criteria for a datum list or datum reading request.
///
/// Filters are built fresh for every request and never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatumFilter {
    /// The nodes to return datum for.
    pub node_ids: Vec<i64>,
    /// The sources to return datum for; may contain wildcard patterns.
    pub source_ids: Vec<String>,
    /// Inclusive start of the query.
    pub start_date: Option<DateTime<Utc>>,
    /// Exclusive end of the query.
    pub end_date: Option<DateTime<Utc>>,
    /// Server-side aggregation to apply.
    pub aggregation: Option<Aggregation>,
    /// How grouped series are merged.
    pub combining_type: Option<CombiningType>,
    /// Virtual node ids mapped to the real nodes they combine.
    pub node_id_maps: BTreeMap<i64, BTreeSet<i64>>,
    /// Virtual source ids mapped to the real sources they combine.
    pub source_id_maps: BTreeMap<String, BTreeSet<String>>,
    /// Maximum number of results per page.
    pub max: Option<usize>,
    /// Offset of the first result of the page.
    pub offset: Option<usize>,
}

impl DatumFilter {
    /// A copy of this filter restricted to one page of results.
    pub fn page(&self, max: usize, offset: usize) -> Self {
        Self {
            max: Some(max),
            offset: Some(offset),
            ..self.clone()
        }
    }

    /// Encode the filter as query parameters, skipping anything unset.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if !self.node_ids.is_empty() {
            pairs.push(("nodeIds".to_string(), join(&self.node_ids)));
        }
        if !self.source_ids.is_empty() {
            pairs.push(("sourceIds".to_string(), self.source_ids.join(",")));
        }
        if let Some(start) = self.start_date {
            pairs.push(("startDate".to_string(), start.format(DATE_FORMAT).to_string()));
        }
        if let Some(end) = self.end_date {
            pairs.push(("endDate".to_string(), end.format(DATE_FORMAT).to_string()));
        }
        if let Some(aggregation) = self.aggregation {
            pairs.push(("aggregation".to_string(), aggregation.name().to_string()));
        }
        if let Some(combining_type) = self.combining_type {
            pairs.push(("combiningType".to_string(), combining_type.name().to_string()));
        }
        pairs.extend(map_pairs("nodeIdMaps", &self.node_id_maps));
        pairs.extend(map_pairs("sourceIdMaps", &self.source_id_maps));
        if let Some(max) = self.max {
            pairs.push(("max".to_string(), max.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs
    }
}

fn join<T: ToString>(values: impl IntoIterator<Item = T>) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// One `name=key:a,b` parameter per map entry.
fn map_pairs<'a, K, V>(
    name: &'a str,
    maps: &'a BTreeMap<K, BTreeSet<V>>,
) -> impl Iterator<Item = (String, String)> + 'a
where
    K: fmt::Display,
    V: fmt::Display,
{
    maps.iter()
        .map(move |(k, vs)| (name.to_string(), format!("{k}:{}", join(vs))))
}

/// A GET request against the SolarNetwork API, independent of where it is sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiRequest {
    /// The API path, starting with `/`.
    pub path: &'static str,
    /// Query parameters, in no particular order.
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    /// List every node id the token has access to.
    pub fn list_all_node_ids() -> Self {
        Self {
            path: NODES_PATH,
            query: Vec::new(),
        }
    }

    /// List datum matching `filter`.
    pub fn list_datum(filter: &DatumFilter) -> Self {
        Self {
            path: DATUM_LIST_PATH,
            query: filter.to_query_pairs(),
        }
    }

    /// Compute readings of `reading_type` for datum matching `filter`.
    pub fn datum_reading(reading_type: DatumReadingType, filter: &DatumFilter) -> Self {
        let mut query = vec![("readingType".to_string(), reading_type.name().to_string())];
        query.extend(filter.to_query_pairs());
        Self {
            path: DATUM_READING_PATH,
            query,
        }
    }

    /// The canonical query string: parameters sorted by name then value,
    /// each side URI-encoded.
    ///
    /// The same string is used in the request URL and in the signature, so
    /// the two can never disagree.
    pub fn query_string(&self) -> String {
        let mut pairs: Vec<_> = self
            .query
            .iter()
            .map(|(k, v)| (uri_encode(k), uri_encode(v)))
            .collect();
        pairs.sort();
        pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Everything except RFC 3986 unreserved characters.
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub(crate) fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, URI_ENCODE_SET).to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn pairs(request: &ApiRequest) -> Vec<(&str, &str)> {
        request
            .query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    #[test]
    fn list_filter_encoding() {
        let filter = DatumFilter {
            node_ids: vec![1, 2],
            source_ids: vec!["A".to_string(), "B/*".to_string()],
            start_date: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            end_date: Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 1, 30).unwrap()),
            aggregation: Some(Aggregation::Hour),
            ..Default::default()
        };
        let request = ApiRequest::list_datum(&filter);
        assert_eq!(request.path, "/solarquery/api/v1/sec/datum/list");
        assert_eq!(
            pairs(&request),
            vec![
                ("nodeIds", "1,2"),
                ("sourceIds", "A,B/*"),
                ("startDate", "2024-01-01T00:00"),
                ("endDate", "2024-01-02T00:01"),
                ("aggregation", "Hour"),
            ]
        );
        assert_eq!(
            request.query_string(),
            "aggregation=Hour&endDate=2024-01-02T00%3A01&nodeIds=1%2C2\
             &sourceIds=A%2CB%2F%2A&startDate=2024-01-01T00%3A00"
        );
    }

    #[test]
    fn combining_maps_encoding() {
        let filter = DatumFilter {
            combining_type: Some(CombiningType::Sum),
            node_id_maps: BTreeMap::from([(-1, BTreeSet::from([2, 1]))]),
            source_id_maps: BTreeMap::from([(
                "Sum".to_string(),
                BTreeSet::from(["B".to_string(), "A".to_string()]),
            )]),
            ..Default::default()
        };
        assert_eq!(
            pairs(&ApiRequest::list_datum(&filter)),
            vec![
                ("combiningType", "Sum"),
                ("nodeIdMaps", "-1:1,2"),
                ("sourceIdMaps", "Sum:A,B"),
            ]
        );
    }

    #[test]
    fn reading_request_leads_with_reading_type() {
        let filter = DatumFilter {
            node_ids: vec![7],
            ..Default::default()
        }
        .page(1000, 2000);
        let request = ApiRequest::datum_reading(DatumReadingType::Difference, &filter);
        assert_eq!(request.path, "/solarquery/api/v1/sec/datum/reading");
        assert_eq!(
            pairs(&request),
            vec![
                ("readingType", "Difference"),
                ("nodeIds", "7"),
                ("max", "1000"),
                ("offset", "2000"),
            ]
        );
    }

    #[test]
    fn uri_encoding_keeps_unreserved() {
        assert_eq!(uri_encode("a-Z_0.~ /:"), "a-Z_0.~%20%2F%3A");
        assert_eq!(uri_encode("/power/**,é+"), "%2Fpower%2F%2A%2A%2C%C3%A9%2B");
    }
}
