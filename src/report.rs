//! Translation of the simplified report query into a GA4 `runReport` request.

use anyhow::{Context, Result};
use serde::{
    de::{self, IntoDeserializer},
    Deserialize, Deserializer, Serialize,
};
use serde_json::Value;

const PROPERTY_PREFIX: &str = "properties/";

/// The query accepted by `POST /report`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReportQuery {
    pub(crate) start_date: String,
    pub(crate) end_date: String,
    pub(crate) dimensions: Vec<String>,
    pub(crate) metrics: Vec<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub(crate) filters: Vec<FilterSpec>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub(crate) not_filters: Vec<FilterSpec>,
    #[serde(default)]
    pub(crate) limit: Option<u64>,
    #[serde(default)]
    pub(crate) offset: Option<u64>,
}

impl ReportQuery {
    pub(crate) fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).context("invalid argument: malformed report query")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FilterSpec {
    pub(crate) field: String,
    pub(crate) value: String,
    #[serde(default, deserialize_with = "falsy_match_type")]
    pub(crate) match_type: Option<MatchType>,
    #[serde(default)]
    pub(crate) case_sensitive: Option<bool>,
}

impl FilterSpec {
    fn to_expression(&self) -> FilterExpression {
        FilterExpression::Filter(self.to_filter())
    }

    fn to_negated_expression(&self) -> FilterExpression {
        FilterExpression::NotExpression(Box::new(self.to_expression()))
    }

    fn to_filter(&self) -> Filter {
        Filter {
            field_name: self.field.clone(),
            string_filter: StringFilter {
                value: self.value.clone(),
                match_type: self.match_type.unwrap_or_default(),
                case_sensitive: self.case_sensitive.unwrap_or(false),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum MatchType {
    MatchTypeUnspecified,
    #[default]
    Exact,
    BeginsWith,
    EndsWith,
    Contains,
    FullRegexp,
    PartialRegexp,
}

/// Request body of `properties/{id}:runReport`.
///
/// The property is part of the URL, so it is kept out of the JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunReportRequest {
    #[serde(skip)]
    pub(crate) property: String,
    pub(crate) date_ranges: Vec<DateRange>,
    pub(crate) dimensions: Vec<Dimension>,
    pub(crate) metrics: Vec<Metric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) dimension_filter: Option<FilterExpression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DateRange {
    pub(crate) start_date: String,
    pub(crate) end_date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Dimension {
    pub(crate) name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Metric {
    pub(crate) name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum FilterExpression {
    AndGroup(FilterExpressionList),
    NotExpression(Box<FilterExpression>),
    Filter(Filter),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct FilterExpressionList {
    pub(crate) expressions: Vec<FilterExpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Filter {
    pub(crate) field_name: String,
    pub(crate) string_filter: StringFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StringFilter {
    pub(crate) value: String,
    pub(crate) match_type: MatchType,
    pub(crate) case_sensitive: bool,
}

/// Returns the `properties/{id}` resource name for a configured property.
pub(crate) fn property_name(property_id: &str) -> String {
    if property_id.starts_with(PROPERTY_PREFIX) {
        property_id.to_string()
    } else {
        format!("{PROPERTY_PREFIX}{property_id}")
    }
}

pub(crate) fn build_request(query: &ReportQuery, property: &str) -> RunReportRequest {
    RunReportRequest {
        property: property.to_string(),
        date_ranges: vec![DateRange {
            start_date: query.start_date.clone(),
            end_date: query.end_date.clone(),
        }],
        dimensions: query
            .dimensions
            .iter()
            .map(|name| Dimension { name: name.clone() })
            .collect(),
        metrics: query
            .metrics
            .iter()
            .map(|name| Metric { name: name.clone() })
            .collect(),
        dimension_filter: dimension_filter(&query.filters, &query.not_filters),
        limit: query.limit,
        offset: query.offset,
    }
}

fn dimension_filter(
    filters: &[FilterSpec],
    not_filters: &[FilterSpec],
) -> Option<FilterExpression> {
    if filters.is_empty() && not_filters.is_empty() {
        return None;
    }
    let positive = filters.iter().map(FilterSpec::to_expression);
    let negated = not_filters.iter().map(FilterSpec::to_negated_expression);
    Some(FilterExpression::AndGroup(FilterExpressionList {
        expressions: positive.chain(negated).collect(),
    }))
}

/// Anything other than an array (including `null`) is an empty list.
fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<FilterSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        value @ Value::Array(_) => serde_json::from_value(value).map_err(de::Error::custom),
        _ => Ok(Vec::new()),
    }
}

/// Falsy values (`null`, `false`, `0`, `""`) fall back to the default match type.
fn falsy_match_type<'de, D>(deserializer: D) -> Result<Option<MatchType>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => {
            let de: de::value::StrDeserializer<'_, D::Error> = s.as_str().into_deserializer();
            MatchType::deserialize(de).map(Some)
        }
        value if is_falsy(&value) => Ok(None),
        value => Err(de::Error::custom(format!("invalid match type {value}"))),
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}
