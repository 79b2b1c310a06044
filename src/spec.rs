//! The query specification model and the closed set of query kinds.
//!
//! A [`QuerySpec`] is a `query_kind` discriminator plus named parameters.
//! Parameters are JSON-shaped values; an object parameter carrying a
//! `query_kind` member is a nested spec. Each kind supplies its validator,
//! its dependency computation and its SQL builder through one `match` table,
//! so adding a kind means extending three arms and nothing else.
//!
//! Build logic works entirely on fingerprints: the SQL a kind produces reads
//! its prerequisites as `cache.x<id>` relations and never holds a live
//! reference to another query object.

use chrono::{Duration, NaiveDate};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::error::{Error, Result};
use crate::fingerprint::{fingerprint, QueryId};

/// Spatial granularity at which results are returned. Resolved against the
/// `geography` schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationUnit {
    Admin1,
    Admin2,
    Admin3,
    VersionedSite,
}

impl AggregationUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin1" => Some(AggregationUnit::Admin1),
            "admin2" => Some(AggregationUnit::Admin2),
            "admin3" => Some(AggregationUnit::Admin3),
            "versioned-site" => Some(AggregationUnit::VersionedSite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationUnit::Admin1 => "admin1",
            AggregationUnit::Admin2 => "admin2",
            AggregationUnit::Admin3 => "admin3",
            AggregationUnit::VersionedSite => "versioned-site",
        }
    }

    /// The geography relation holding this unit's polygons.
    fn geography_table(&self) -> &'static str {
        match self {
            AggregationUnit::Admin1 => "geography.admin1",
            AggregationUnit::Admin2 => "geography.admin2",
            AggregationUnit::Admin3 => "geography.admin3",
            AggregationUnit::VersionedSite => "geography.versioned_site",
        }
    }
}

/// The closed union of analytical query kinds the server executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryKind {
    DummyQuery,
    SubscriberSightings,
    CallDays,
    HartiganClusters,
    LabelScores,
    MeaningfulLocations,
    MeaningfulLocationsAggregate,
    DailyLocation,
    ModalLocation,
    SubscriberDegree,
    EventCount,
    TopupAmount,
}

impl QueryKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "dummy_query" => QueryKind::DummyQuery,
            "subscriber_sightings" => QueryKind::SubscriberSightings,
            "call_days" => QueryKind::CallDays,
            "hartigan_clusters" => QueryKind::HartiganClusters,
            "label_scores" => QueryKind::LabelScores,
            "meaningful_locations" => QueryKind::MeaningfulLocations,
            "meaningful_locations_aggregate" => QueryKind::MeaningfulLocationsAggregate,
            "daily_location" => QueryKind::DailyLocation,
            "modal_location" => QueryKind::ModalLocation,
            "subscriber_degree" => QueryKind::SubscriberDegree,
            "event_count" => QueryKind::EventCount,
            "topup_amount" => QueryKind::TopupAmount,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueryKind::DummyQuery => "dummy_query",
            QueryKind::SubscriberSightings => "subscriber_sightings",
            QueryKind::CallDays => "call_days",
            QueryKind::HartiganClusters => "hartigan_clusters",
            QueryKind::LabelScores => "label_scores",
            QueryKind::MeaningfulLocations => "meaningful_locations",
            QueryKind::MeaningfulLocationsAggregate => "meaningful_locations_aggregate",
            QueryKind::DailyLocation => "daily_location",
            QueryKind::ModalLocation => "modal_location",
            QueryKind::SubscriberDegree => "subscriber_degree",
            QueryKind::EventCount => "event_count",
            QueryKind::TopupAmount => "topup_amount",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One query specification: a kind plus its named parameters. The spec has
/// no identity of its own; its identity is its fingerprint.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySpec {
    kind: QueryKind,
    // BTreeMap-backed, so iteration order is already the canonical order.
    params: Map<String, Value>,
}

impl QuerySpec {
    /// Project an inbound JSON value into a spec. Fails if the value is not
    /// an object, lacks a string `query_kind`, or names an unknown kind.
    /// Parameter-level validation is a separate step ([`QuerySpec::validate`]).
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Validation("query spec must be a JSON object".into()))?;
        let kind_name = object
            .get("query_kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("missing required field 'query_kind'".into()))?;
        let kind = QueryKind::from_name(kind_name)
            .ok_or_else(|| Error::UnknownQueryKind(kind_name.to_owned()))?;
        let mut params = object.clone();
        params.remove("query_kind");
        Ok(QuerySpec { kind, params })
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// The spec as a JSON value, `query_kind` included.
    pub fn to_value(&self) -> Value {
        let mut map = self.params.clone();
        map.insert(
            "query_kind".to_owned(),
            Value::String(self.kind.name().to_owned()),
        );
        Value::Object(map)
    }

    pub fn fingerprint(&self) -> QueryId {
        fingerprint(self)
    }

    /// The aggregation unit this spec is scoped to, if its kind carries one.
    pub fn aggregation_unit(&self) -> Option<&str> {
        self.params.get("aggregation_unit").and_then(Value::as_str)
    }

    /// Check every parameter against the kind's schema. Unknown parameters
    /// are rejected so a typo'd optional never silently changes identity.
    pub fn validate(&self) -> Result<()> {
        let p = Params(&self.params);
        match self.kind {
            QueryKind::DummyQuery => {
                p.require("dummy_param")?;
                p.reject_unknown(&["dummy_param"])
            }
            QueryKind::SubscriberSightings => {
                p.date("start")?;
                p.date("stop")?;
                p.reject_unknown(&["start", "stop"])
            }
            QueryKind::CallDays => {
                p.date("start")?;
                p.date("stop")?;
                p.reject_unknown(&["start", "stop"])
            }
            QueryKind::HartiganClusters => {
                p.date("start")?;
                p.date("stop")?;
                p.float("radius")?;
                p.reject_unknown(&["start", "stop", "radius"])
            }
            QueryKind::LabelScores => {
                p.date("start")?;
                p.date("stop")?;
                p.mapping("labels")?;
                p.reject_unknown(&["start", "stop", "labels"])
            }
            QueryKind::MeaningfulLocations => {
                p.date("start")?;
                p.date("stop")?;
                p.string("label")?;
                p.mapping("labels")?;
                p.float("radius")?;
                p.reject_unknown(&["start", "stop", "label", "labels", "radius"])
            }
            QueryKind::MeaningfulLocationsAggregate => {
                p.date("start")?;
                p.date("stop")?;
                p.string("label")?;
                p.mapping("labels")?;
                p.float("radius")?;
                p.aggregation_unit()?;
                p.reject_unknown(&[
                    "start",
                    "stop",
                    "label",
                    "labels",
                    "radius",
                    "aggregation_unit",
                ])
            }
            QueryKind::DailyLocation => {
                p.date("date")?;
                p.one_of("method", &["last", "most-common"])?;
                p.aggregation_unit()?;
                p.nullable("subscriber_subset")?;
                p.reject_unknown(&["date", "method", "aggregation_unit", "subscriber_subset"])
            }
            QueryKind::ModalLocation => {
                let locations = p.sequence("locations")?;
                if locations.is_empty() {
                    return Err(Error::Validation(
                        "'locations' must contain at least one daily_location spec".into(),
                    ));
                }
                for entry in locations {
                    let nested = QuerySpec::from_value(entry)?;
                    if nested.kind != QueryKind::DailyLocation {
                        return Err(Error::Validation(format!(
                            "'locations' entries must be daily_location specs, got '{}'",
                            nested.kind
                        )));
                    }
                    nested.validate()?;
                }
                p.reject_unknown(&["locations"])
            }
            QueryKind::SubscriberDegree => {
                p.date("start")?;
                p.date("stop")?;
                p.one_of("direction", &["in", "out", "both"])?;
                p.reject_unknown(&["start", "stop", "direction"])
            }
            QueryKind::EventCount => {
                p.date("start")?;
                p.date("stop")?;
                if p.0.contains_key("event_types") {
                    p.sequence("event_types")?;
                }
                p.reject_unknown(&["start", "stop", "event_types"])
            }
            QueryKind::TopupAmount => {
                p.date("start")?;
                p.date("stop")?;
                p.one_of("statistic", &["avg", "sum", "max", "min"])?;
                p.reject_unknown(&["start", "stop", "statistic"])
            }
        }
    }

    /// Direct prerequisites declared by this spec's kind, as fully-formed
    /// specs. The authoritative representation of a dependency edge is the
    /// fingerprint pair these give rise to.
    pub fn dependencies(&self) -> Result<Vec<QuerySpec>> {
        let p = Params(&self.params);
        Ok(match self.kind {
            QueryKind::DummyQuery => {
                // Nested specs anywhere inside dummy_param are honoured, so
                // the dummy can stand in for arbitrary graph shapes in tests.
                let mut nested = Vec::new();
                if let Some(param) = self.params.get("dummy_param") {
                    collect_nested_specs(param, &mut nested)?;
                }
                nested
            }
            QueryKind::SubscriberSightings
            | QueryKind::SubscriberDegree
            | QueryKind::EventCount
            | QueryKind::TopupAmount => Vec::new(),
            QueryKind::CallDays => vec![make_spec(
                QueryKind::SubscriberSightings,
                json!({"start": p.date("start")?.to_string(), "stop": p.date("stop")?.to_string()}),
            )?],
            QueryKind::HartiganClusters | QueryKind::LabelScores => vec![make_spec(
                QueryKind::CallDays,
                json!({"start": p.date("start")?.to_string(), "stop": p.date("stop")?.to_string()}),
            )?],
            QueryKind::MeaningfulLocations => {
                let start = p.date("start")?.to_string();
                let stop = p.date("stop")?.to_string();
                vec![
                    make_spec(
                        QueryKind::HartiganClusters,
                        json!({"start": &start, "stop": &stop, "radius": p.float("radius")?}),
                    )?,
                    make_spec(
                        QueryKind::LabelScores,
                        json!({"start": &start, "stop": &stop, "labels": p.require("labels")?}),
                    )?,
                ]
            }
            QueryKind::MeaningfulLocationsAggregate => vec![make_spec(
                QueryKind::MeaningfulLocations,
                json!({
                    "start": p.date("start")?.to_string(),
                    "stop": p.date("stop")?.to_string(),
                    "label": p.string("label")?,
                    "labels": p.require("labels")?,
                    "radius": p.float("radius")?,
                }),
            )?],
            QueryKind::DailyLocation => {
                let date = p.date("date")?;
                let next = date + Duration::days(1);
                vec![make_spec(
                    QueryKind::SubscriberSightings,
                    json!({"start": date.to_string(), "stop": next.to_string()}),
                )?]
            }
            QueryKind::ModalLocation => {
                let mut deps = Vec::new();
                for entry in p.sequence("locations")? {
                    deps.push(QuerySpec::from_value(entry)?);
                }
                deps
            }
        })
    }

    /// The SELECT this kind materialises, referring to prerequisites only
    /// through their `cache.x<id>` relations.
    pub fn build_sql(&self) -> Result<String> {
        let p = Params(&self.params);
        let deps = self.dependencies()?;
        let dep_table = |index: usize| format!("cache.{}", deps[index].fingerprint().table_name());
        Ok(match self.kind {
            QueryKind::DummyQuery => "SELECT 1 AS dummy".to_owned(),

            QueryKind::SubscriberSightings => {
                let start = p.date("start")?;
                let stop = p.date("stop")?;
                format!(
                    "SELECT subscriber, datetime, location_id FROM events.calls \
                     WHERE datetime >= '{start}' AND datetime < '{stop}' \
                     UNION ALL \
                     SELECT subscriber, datetime, location_id FROM events.sms \
                     WHERE datetime >= '{start}' AND datetime < '{stop}'"
                )
            }

            QueryKind::CallDays => format!(
                "SELECT subscriber, location_id, datetime::date AS day, count(*) AS value \
                 FROM {} GROUP BY subscriber, location_id, datetime::date",
                dep_table(0)
            ),

            QueryKind::HartiganClusters => format!(
                "SELECT subscriber, location_id, \
                        sum(value) OVER (PARTITION BY subscriber) AS weight, \
                        {radius} AS radius \
                 FROM (SELECT subscriber, location_id, sum(value) AS value \
                       FROM {table} GROUP BY subscriber, location_id) _",
                radius = p.float("radius")?,
                table = dep_table(0)
            ),

            QueryKind::LabelScores => format!(
                "SELECT subscriber, location_id, day, \
                        CASE WHEN extract(dow FROM day) IN (0, 6) THEN 'weekend' \
                             ELSE 'weekday' END AS label, \
                        sum(value) AS score \
                 FROM {} GROUP BY subscriber, location_id, day",
                dep_table(0)
            ),

            QueryKind::MeaningfulLocations => format!(
                "SELECT clusters.subscriber, clusters.location_id, \
                        scores.label, clusters.weight \
                 FROM {clusters} AS clusters \
                 JOIN {scores} AS scores \
                   ON scores.subscriber = clusters.subscriber \
                  AND scores.location_id = clusters.location_id \
                 WHERE scores.label = '{label}'",
                clusters = dep_table(0),
                scores = dep_table(1),
                label = p.string("label")?
            ),

            QueryKind::MeaningfulLocationsAggregate => {
                let unit = p.aggregation_unit()?;
                format!(
                    "SELECT geo.pcod, count(*) AS value \
                     FROM {locations} AS locations \
                     JOIN {geography} AS geo \
                       ON ST_Contains(geo.geom, locations.location_id::point) \
                     GROUP BY geo.pcod",
                    locations = dep_table(0),
                    geography = unit.geography_table()
                )
            }

            QueryKind::DailyLocation => {
                let unit = p.aggregation_unit()?;
                let sightings = dep_table(0);
                let ranked = match p.one_of("method", &["last", "most-common"])? {
                    "last" => format!(
                        "SELECT DISTINCT ON (subscriber) subscriber, location_id \
                         FROM {sightings} ORDER BY subscriber, datetime DESC"
                    ),
                    _ => format!(
                        "SELECT subscriber, location_id FROM ( \
                             SELECT subscriber, location_id, \
                                    row_number() OVER (PARTITION BY subscriber \
                                                       ORDER BY count(*) DESC, location_id) AS rank \
                             FROM {sightings} GROUP BY subscriber, location_id) _ \
                         WHERE rank = 1"
                    ),
                };
                format!(
                    "SELECT ranked.subscriber, geo.pcod AS location_id \
                     FROM ({ranked}) AS ranked \
                     JOIN {geography} AS geo \
                       ON ST_Contains(geo.geom, ranked.location_id::point)",
                    geography = unit.geography_table()
                )
            }

            QueryKind::ModalLocation => {
                let selects = deps
                    .iter()
                    .map(|dep| {
                        format!(
                            "SELECT subscriber, location_id FROM cache.{}",
                            dep.fingerprint().table_name()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" UNION ALL ");
                format!(
                    "SELECT subscriber, location_id FROM ( \
                         SELECT subscriber, location_id, \
                                row_number() OVER (PARTITION BY subscriber \
                                                   ORDER BY count(*) DESC, location_id) AS rank \
                         FROM ({selects}) _ GROUP BY subscriber, location_id) ranked \
                     WHERE rank = 1"
                )
            }

            QueryKind::SubscriberDegree => {
                let start = p.date("start")?;
                let stop = p.date("stop")?;
                let filter = match p.one_of("direction", &["in", "out", "both"])? {
                    "in" => " AND outgoing = false",
                    "out" => " AND outgoing = true",
                    _ => "",
                };
                format!(
                    "SELECT subscriber, count(DISTINCT msisdn_counterpart) AS value \
                     FROM events.calls \
                     WHERE datetime >= '{start}' AND datetime < '{stop}'{filter} \
                     GROUP BY subscriber"
                )
            }

            QueryKind::EventCount => {
                let start = p.date("start")?;
                let stop = p.date("stop")?;
                let tables: Vec<&str> = match self.params.get("event_types") {
                    Some(Value::Array(types)) => types
                        .iter()
                        .filter_map(Value::as_str)
                        .map(event_table)
                        .collect::<Result<_>>()?,
                    _ => vec!["events.calls", "events.sms", "events.mds", "events.topups"],
                };
                let selects = tables
                    .iter()
                    .map(|t| {
                        format!(
                            "SELECT subscriber FROM {t} \
                             WHERE datetime >= '{start}' AND datetime < '{stop}'"
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" UNION ALL ");
                format!("SELECT subscriber, count(*) AS value FROM ({selects}) _ GROUP BY subscriber")
            }

            QueryKind::TopupAmount => {
                let start = p.date("start")?;
                let stop = p.date("stop")?;
                let statistic = p.one_of("statistic", &["avg", "sum", "max", "min"])?;
                format!(
                    "SELECT subscriber, {statistic}(recharge_amount) AS value \
                     FROM events.topups \
                     WHERE datetime >= '{start}' AND datetime < '{stop}' \
                     GROUP BY subscriber"
                )
            }
        })
    }
}

fn make_spec(kind: QueryKind, params: Value) -> Result<QuerySpec> {
    let mut value = params;
    value
        .as_object_mut()
        .expect("constructed params are an object")
        .insert(
            "query_kind".to_owned(),
            Value::String(kind.name().to_owned()),
        );
    QuerySpec::from_value(&value)
}

/// Recursively find nested specs inside a free-form parameter value.
fn collect_nested_specs(value: &Value, out: &mut Vec<QuerySpec>) -> Result<()> {
    match value {
        Value::Object(map) => {
            if map.get("query_kind").map_or(false, Value::is_string) {
                out.push(QuerySpec::from_value(value)?);
            } else {
                for nested in map.values() {
                    collect_nested_specs(nested, out)?;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_nested_specs(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn event_table(event_type: &str) -> Result<&'static str> {
    match event_type {
        "calls" => Ok("events.calls"),
        "sms" => Ok("events.sms"),
        "mds" => Ok("events.mds"),
        "topups" => Ok("events.topups"),
        other => Err(Error::Validation(format!(
            "unknown event type '{other}'; expected one of calls, sms, mds, topups"
        ))),
    }
}

/// Typed accessors over a spec's parameter map. Every accessor produces a
/// validation error naming the offending parameter.
struct Params<'a>(&'a Map<String, Value>);

impl<'a> Params<'a> {
    fn require(&self, key: &str) -> Result<&'a Value> {
        self.0
            .get(key)
            .ok_or_else(|| Error::Validation(format!("missing required parameter '{key}'")))
    }

    fn date(&self, key: &str) -> Result<NaiveDate> {
        let raw = self
            .require(key)?
            .as_str()
            .ok_or_else(|| Error::Validation(format!("parameter '{key}' must be a date string")))?;
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            Error::Validation(format!(
                "parameter '{key}' must be an ISO date (YYYY-MM-DD), got '{raw}'"
            ))
        })
    }

    fn string(&self, key: &str) -> Result<&'a str> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| Error::Validation(format!("parameter '{key}' must be a string")))
    }

    fn float(&self, key: &str) -> Result<f64> {
        self.require(key)?
            .as_f64()
            .ok_or_else(|| Error::Validation(format!("parameter '{key}' must be a number")))
    }

    fn mapping(&self, key: &str) -> Result<&'a Map<String, Value>> {
        self.require(key)?
            .as_object()
            .ok_or_else(|| Error::Validation(format!("parameter '{key}' must be a mapping")))
    }

    fn sequence(&self, key: &str) -> Result<&'a Vec<Value>> {
        self.require(key)?
            .as_array()
            .ok_or_else(|| Error::Validation(format!("parameter '{key}' must be a sequence")))
    }

    fn one_of(&self, key: &str, allowed: &[&'static str]) -> Result<&'static str> {
        let raw = self.string(key)?;
        allowed
            .iter()
            .find(|candidate| **candidate == raw)
            .copied()
            .ok_or_else(|| {
                Error::Validation(format!(
                    "parameter '{key}' must be one of {allowed:?}, got '{raw}'"
                ))
            })
    }

    fn aggregation_unit(&self) -> Result<AggregationUnit> {
        let raw = self.string("aggregation_unit")?;
        AggregationUnit::parse(raw).ok_or_else(|| {
            Error::Validation(format!("unknown aggregation unit '{raw}'"))
        })
    }

    /// Nullable parameters are accepted as absent or JSON null; anything
    /// else is rejected until the feature lands.
    fn nullable(&self, key: &str) -> Result<()> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(()),
            Some(_) => Err(Error::Validation(format!(
                "parameter '{key}' only supports null"
            ))),
        }
    }

    fn reject_unknown(&self, allowed: &[&str]) -> Result<()> {
        for key in self.0.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(Error::Validation(format!("unknown parameter '{key}'")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daily_location(date: &str) -> QuerySpec {
        QuerySpec::from_value(&json!({
            "query_kind": "daily_location",
            "date": date,
            "method": "last",
            "aggregation_unit": "admin3",
            "subscriber_subset": null,
        }))
        .unwrap()
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = QuerySpec::from_value(&json!({"query_kind": "flux_capacitor"})).unwrap_err();
        assert!(matches!(err, Error::UnknownQueryKind(k) if k == "flux_capacitor"));
    }

    #[test]
    fn missing_required_parameter_is_a_validation_error() {
        let spec = QuerySpec::from_value(&json!({
            "query_kind": "daily_location",
            "method": "last",
            "aggregation_unit": "admin3",
        }))
        .unwrap();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("'date'"));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let spec = QuerySpec::from_value(&json!({
            "query_kind": "subscriber_degree",
            "start": "2016-01-01",
            "stop": "2016-01-07",
            "direction": "both",
            "frobnicate": true,
        }))
        .unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn bad_enum_value_is_rejected() {
        let spec = QuerySpec::from_value(&json!({
            "query_kind": "daily_location",
            "date": "2016-01-01",
            "method": "first",
            "aggregation_unit": "admin3",
        }))
        .unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn daily_location_depends_on_one_day_of_sightings() {
        let deps = daily_location("2016-01-01").dependencies().unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].kind(), QueryKind::SubscriberSightings);
        assert_eq!(deps[0].params()["start"], json!("2016-01-01"));
        assert_eq!(deps[0].params()["stop"], json!("2016-01-02"));
    }

    #[test]
    fn modal_location_depends_on_each_nested_spec() {
        let spec = QuerySpec::from_value(&json!({
            "query_kind": "modal_location",
            "locations": [
                daily_location("2016-01-01").to_value(),
                daily_location("2016-01-02").to_value(),
            ],
        }))
        .unwrap();
        spec.validate().unwrap();
        let deps = spec.dependencies().unwrap();
        assert_eq!(deps.len(), 2);
        assert!(deps.iter().all(|d| d.kind() == QueryKind::DailyLocation));
    }

    #[test]
    fn sql_references_dependencies_by_fingerprint() {
        let spec = daily_location("2016-01-01");
        let dep_id = spec.dependencies().unwrap()[0].fingerprint();
        let sql = spec.build_sql().unwrap();
        assert!(sql.contains(&format!("cache.x{dep_id}")));
    }

    #[test]
    fn meaningful_locations_aggregate_walks_the_full_chain() {
        let spec = QuerySpec::from_value(&json!({
            "query_kind": "meaningful_locations_aggregate",
            "start": "2016-01-01",
            "stop": "2016-01-08",
            "label": "weekend",
            "labels": {"weekend": {}, "weekday": {}},
            "radius": 1.5,
            "aggregation_unit": "admin3",
        }))
        .unwrap();
        spec.validate().unwrap();
        let deps = spec.dependencies().unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].kind(), QueryKind::MeaningfulLocations);
        let grand = deps[0].dependencies().unwrap();
        assert_eq!(grand.len(), 2);
        assert_eq!(grand[0].kind(), QueryKind::HartiganClusters);
        assert_eq!(grand[1].kind(), QueryKind::LabelScores);
    }

    #[test]
    fn dummy_query_collects_nested_specs_from_anywhere() {
        let spec = QuerySpec::from_value(&json!({
            "query_kind": "dummy_query",
            "dummy_param": ["leaf", {"inner": daily_location("2016-01-01").to_value()}],
        }))
        .unwrap();
        let deps = spec.dependencies().unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].kind(), QueryKind::DailyLocation);
    }
}
