use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    Ilike,
    IsNull,
    IsNotNull,
}

impl FilterOp {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "=" => Some(FilterOp::Eq),
            "!=" | "<>" => Some(FilterOp::Ne),
            ">" => Some(FilterOp::Gt),
            ">=" => Some(FilterOp::Ge),
            "<" => Some(FilterOp::Lt),
            "<=" => Some(FilterOp::Le),
            "LIKE" => Some(FilterOp::Like),
            "ILIKE" => Some(FilterOp::Ilike),
            "IS NULL" => Some(FilterOp::IsNull),
            "IS NOT NULL" => Some(FilterOp::IsNotNull),
            _ => None,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "<>",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Like => "LIKE",
            FilterOp::Ilike => "ILIKE",
            FilterOp::IsNull => "IS NULL",
            FilterOp::IsNotNull => "IS NOT NULL",
        }
    }

    pub fn takes_value(self) -> bool {
        !matches!(self, FilterOp::IsNull | FilterOp::IsNotNull)
    }

    pub fn is_pattern(self) -> bool {
        matches!(self, FilterOp::Like | FilterOp::Ilike)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn sql(self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

/// Filter entries as they arrive on the wire: the operator key stays an
/// uninterpreted string until the filter compiler resolves it.
pub type FilterSpec = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryRequest {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub order_direction: OrderDirection,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub filters: FilterSpec,
}

fn default_limit() -> i64 {
    DEFAULT_LIMIT
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
            order_by: None,
            order_direction: OrderDirection::Asc,
            search: None,
            filters: FilterSpec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    #[serde(rename = "data")]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub total_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutationRequest {
    pub updates: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationResult {
    pub data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub declared_type: String,
    pub is_searchable: bool,
}

/// `information_schema.data_type` spellings treated as free text and
/// therefore eligible for the search compiler.
const TEXTUAL_TYPES: &[&str] = &["text", "character varying", "character", "citext", "name"];

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        let name = name.into();
        let declared_type = declared_type.into().to_ascii_lowercase();
        let is_searchable = TEXTUAL_TYPES.contains(&declared_type.as_str());
        Self {
            name,
            declared_type,
            is_searchable,
        }
    }
}

/// Typed representation of one user-supplied cell value, chosen from the
/// target column's declared type before it is bound as a parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(String),
    Json(serde_json::Value),
}

impl SqlValue {
    /// Converts a wire-format JSON value into the variant matching
    /// `declared_type`. The reason string names what the caller must fix.
    pub fn from_wire(declared_type: &str, raw: &serde_json::Value) -> Result<Self, &'static str> {
        if raw.is_null() {
            return Ok(SqlValue::Null);
        }

        let ty = declared_type.trim().to_ascii_lowercase();
        match ty.as_str() {
            "boolean" | "bool" => match raw {
                serde_json::Value::Bool(b) => Ok(SqlValue::Bool(*b)),
                serde_json::Value::String(s) => match s.trim() {
                    "true" | "t" | "TRUE" => Ok(SqlValue::Bool(true)),
                    "false" | "f" | "FALSE" => Ok(SqlValue::Bool(false)),
                    _ => Err("value must be a boolean"),
                },
                _ => Err("value must be a boolean"),
            },
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" => match raw {
                serde_json::Value::Number(n) => n
                    .as_i64()
                    .map(SqlValue::Int)
                    .ok_or("value must be an integer"),
                serde_json::Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(SqlValue::Int)
                    .map_err(|_| "value must be an integer"),
                _ => Err("value must be an integer"),
            },
            "real" | "double precision" | "float4" | "float8" => match raw {
                serde_json::Value::Number(n) => n
                    .as_f64()
                    .map(SqlValue::Float)
                    .ok_or("value must be a number"),
                serde_json::Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(SqlValue::Float)
                    .map_err(|_| "value must be a number"),
                _ => Err("value must be a number"),
            },
            // Exact decimals stay textual and are cast server-side so no
            // precision is lost through an f64 round-trip.
            "numeric" | "decimal" | "money" => match raw {
                serde_json::Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
                serde_json::Value::String(s) => {
                    let s = s.trim();
                    if s.parse::<f64>().is_ok() {
                        Ok(SqlValue::Text(s.to_string()))
                    } else {
                        Err("value must be numeric")
                    }
                }
                _ => Err("value must be numeric"),
            },
            "json" | "jsonb" => Ok(SqlValue::Json(raw.clone())),
            "date"
            | "time without time zone"
            | "time with time zone"
            | "timestamp without time zone"
            | "timestamp with time zone"
            | "timestamptz"
            | "interval" => match raw {
                serde_json::Value::String(s) => {
                    let s = s.trim();
                    if s.is_empty() {
                        Err("value must be a non-empty timestamp string")
                    } else {
                        Ok(SqlValue::Timestamp(s.to_string()))
                    }
                }
                _ => Err("value must be a timestamp string"),
            },
            _ => match raw {
                serde_json::Value::String(s) => Ok(SqlValue::Text(s.clone())),
                _ => Err("value must be a string"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_op_parses_every_wire_spelling() {
        let cases = [
            ("=", FilterOp::Eq),
            ("!=", FilterOp::Ne),
            ("<>", FilterOp::Ne),
            (">", FilterOp::Gt),
            (">=", FilterOp::Ge),
            ("<", FilterOp::Lt),
            ("<=", FilterOp::Le),
            ("LIKE", FilterOp::Like),
            ("ilike", FilterOp::Ilike),
            ("IS NULL", FilterOp::IsNull),
            ("is not null", FilterOp::IsNotNull),
        ];
        for (raw, expected) in cases {
            assert_eq!(FilterOp::parse(raw), Some(expected), "case `{}`", raw);
        }

        assert_eq!(FilterOp::parse("BETWEEN"), None);
        assert_eq!(FilterOp::parse(";--"), None);
    }

    #[test]
    fn null_operators_take_no_value() {
        assert!(!FilterOp::IsNull.takes_value());
        assert!(!FilterOp::IsNotNull.takes_value());
        assert!(FilterOp::Eq.takes_value());
        assert!(FilterOp::Ilike.takes_value());
    }

    #[test]
    fn column_metadata_marks_text_types_searchable() {
        assert!(ColumnMetadata::new("name", "text").is_searchable);
        assert!(ColumnMetadata::new("label", "character varying").is_searchable);
        assert!(!ColumnMetadata::new("id", "uuid").is_searchable);
        assert!(!ColumnMetadata::new("price", "numeric").is_searchable);
        assert!(!ColumnMetadata::new("created_at", "timestamp with time zone").is_searchable);
    }

    #[test]
    fn query_request_wire_defaults() {
        let req: QueryRequest = serde_json::from_str("{}").expect("empty body should parse");
        assert_eq!(req.limit, DEFAULT_LIMIT);
        assert_eq!(req.offset, 0);
        assert_eq!(req.order_direction, OrderDirection::Asc);
        assert!(req.order_by.is_none());
        assert!(req.search.is_none());
        assert!(req.filters.is_empty());
    }

    #[test]
    fn query_request_rejects_unknown_fields() {
        let err = serde_json::from_str::<QueryRequest>(r#"{"join": "users"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn sql_value_conversion_follows_declared_type() {
        let v = SqlValue::from_wire("bigint", &serde_json::json!("42")).unwrap();
        assert_eq!(v, SqlValue::Int(42));

        let v = SqlValue::from_wire("boolean", &serde_json::json!(true)).unwrap();
        assert_eq!(v, SqlValue::Bool(true));

        let v = SqlValue::from_wire("numeric", &serde_json::json!("19.99")).unwrap();
        assert_eq!(v, SqlValue::Text("19.99".to_string()));

        let v = SqlValue::from_wire(
            "timestamp with time zone",
            &serde_json::json!("2026-01-01T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(v, SqlValue::Timestamp("2026-01-01T00:00:00Z".to_string()));

        let v = SqlValue::from_wire("text", &serde_json::Value::Null).unwrap();
        assert_eq!(v, SqlValue::Null);
    }

    #[test]
    fn sql_value_conversion_rejects_unparseable_input() {
        assert!(SqlValue::from_wire("integer", &serde_json::json!("not-a-number")).is_err());
        assert!(SqlValue::from_wire("numeric", &serde_json::json!("abc")).is_err());
        assert!(SqlValue::from_wire("boolean", &serde_json::json!(7)).is_err());
        assert!(SqlValue::from_wire("timestamp with time zone", &serde_json::json!(12)).is_err());
        assert!(SqlValue::from_wire("uuid", &serde_json::json!({"not": "a string"})).is_err());
    }
}
