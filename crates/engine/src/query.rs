use std::time::Duration;

use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tablegate_contracts::{ColumnMetadata, QueryRequest, QueryResult};

use crate::ident::{quote_ident, validate_identifier};
use crate::predicate::{Bind, compile_filters, compile_search, render_where};
use crate::{EngineConfig, EngineError, IdentifierKind};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueryPlan {
    pub count_sql: String,
    pub data_sql: String,
    pub binds: Vec<Bind>,
}

/// Compiles one query request into the paired count/data statements.
/// Everything user-controlled is either a validated identifier or a bind.
pub(crate) fn plan_query(
    config: &EngineConfig,
    schema: &str,
    table: &str,
    columns: &[ColumnMetadata],
    req: &QueryRequest,
) -> Result<QueryPlan, EngineError> {
    if req.limit < 1 || req.limit > config.max_limit || req.offset < 0 {
        return Err(EngineError::InvalidPagination {
            limit: req.limit,
            offset: req.offset,
        });
    }

    let order_sql = match req.order_by.as_deref() {
        None => String::new(),
        Some(order_by) => {
            validate_identifier(order_by, IdentifierKind::Column)?;
            if !columns.iter().any(|c| c.name == order_by) {
                return Err(EngineError::UnknownColumn {
                    table: table.to_string(),
                    column: order_by.to_string(),
                });
            }
            format!(
                " ORDER BY {} {}",
                quote_ident(order_by),
                req.order_direction.sql()
            )
        }
    };

    let mut clauses = compile_filters(table, &req.filters, columns, config.lenient_filters)?;
    clauses.extend(compile_search(req.search.as_deref(), columns));
    let rendered = render_where(&clauses, 1);

    let from = qualified_table(schema, table);
    let count_sql = format!("SELECT COUNT(*) AS total FROM {}{}", from, rendered.sql);
    let data_sql = format!(
        "SELECT {} FROM {}{}{} LIMIT {} OFFSET {}",
        text_projection(columns),
        from,
        rendered.sql,
        order_sql,
        req.limit,
        req.offset
    );

    Ok(QueryPlan {
        count_sql,
        data_sql,
        binds: rendered.binds,
    })
}

/// Runs the plan inside one repeatable-read read-only transaction so the
/// count and the page observe the same snapshot.
pub(crate) async fn run_query(
    pool: &PgPool,
    config: &EngineConfig,
    columns: &[ColumnMetadata],
    plan: &QueryPlan,
) -> Result<QueryResult, EngineError> {
    let timeout_str = format!("{}ms", config.statement_timeout.as_millis());

    let work = async {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(&timeout_str)
            .execute(&mut *tx)
            .await?;

        let count_row = bind_all(sqlx::query(&plan.count_sql), &plan.binds)
            .fetch_one(&mut *tx)
            .await?;
        let total_count: i64 = count_row.try_get("total")?;

        let rows = bind_all(sqlx::query(&plan.data_sql), &plan.binds)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok::<_, sqlx::Error>((total_count, rows))
    };

    // Client-side guard a beat behind the server-side statement timeout,
    // covering network stalls the server timer cannot see.
    let deadline = config.statement_timeout * 2 + Duration::from_secs(1);
    let (total_count, rows) = tokio::time::timeout(deadline, work)
        .await
        .map_err(|_| EngineError::Timeout)?
        .map_err(EngineError::store)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(row_to_record(row, columns).map_err(EngineError::store)?);
    }

    Ok(QueryResult {
        rows: out,
        total_count,
    })
}

pub(crate) fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Every cell is projected as text; responses are opaque string-or-null
/// records regardless of the underlying column types.
pub(crate) fn text_projection(columns: &[ColumnMetadata]) -> String {
    columns
        .iter()
        .map(|c| {
            let quoted = quote_ident(&c.name);
            format!("{}::text AS {}", quoted, quoted)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: &[Bind],
) -> Query<'q, Postgres, PgArguments> {
    for bind in binds {
        query = match bind {
            Bind::Null => query.bind(Option::<String>::None),
            Bind::Bool(v) => query.bind(*v),
            Bind::Int(v) => query.bind(*v),
            Bind::Float(v) => query.bind(*v),
            Bind::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

pub(crate) fn row_to_record(
    row: &PgRow,
    columns: &[ColumnMetadata],
) -> Result<serde_json::Map<String, serde_json::Value>, sqlx::Error> {
    let mut record = serde_json::Map::with_capacity(columns.len());
    for column in columns {
        let value: Option<String> = row.try_get(column.name.as_str())?;
        record.insert(
            column.name.clone(),
            value
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        );
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tablegate_contracts::OrderDirection;

    fn widgets() -> Vec<ColumnMetadata> {
        vec![
            ColumnMetadata::new("id", "uuid"),
            ColumnMetadata::new("name", "text"),
            ColumnMetadata::new("price", "numeric"),
            ColumnMetadata::new("created_at", "timestamp with time zone"),
        ]
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn plan_matches_filtered_ordered_page() {
        let mut filters = tablegate_contracts::FilterSpec::new();
        filters.insert(
            "name".to_string(),
            BTreeMap::from([("ILIKE".to_string(), serde_json::json!("wid"))]),
        );
        let req = QueryRequest {
            limit: 10,
            offset: 0,
            order_by: Some("created_at".to_string()),
            order_direction: OrderDirection::Desc,
            search: None,
            filters,
        };

        let plan = plan_query(&config(), "public", "widgets", &widgets(), &req).unwrap();
        assert_eq!(
            plan.count_sql,
            "SELECT COUNT(*) AS total FROM \"public\".\"widgets\" WHERE \"name\" ILIKE $1"
        );
        assert_eq!(
            plan.data_sql,
            "SELECT \"id\"::text AS \"id\", \"name\"::text AS \"name\", \
             \"price\"::text AS \"price\", \"created_at\"::text AS \"created_at\" \
             FROM \"public\".\"widgets\" WHERE \"name\" ILIKE $1 \
             ORDER BY \"created_at\" DESC LIMIT 10 OFFSET 0"
        );
        assert_eq!(plan.binds, vec![Bind::Text("%wid%".to_string())]);
    }

    #[test]
    fn count_statement_never_carries_order_or_pagination() {
        let req = QueryRequest {
            limit: 5,
            offset: 20,
            order_by: Some("name".to_string()),
            ..QueryRequest::default()
        };
        let plan = plan_query(&config(), "public", "widgets", &widgets(), &req).unwrap();
        assert!(!plan.count_sql.contains("ORDER BY"));
        assert!(!plan.count_sql.contains("LIMIT"));
        assert!(plan.data_sql.ends_with("LIMIT 5 OFFSET 20"));
    }

    #[test]
    fn pagination_is_fail_fast_not_clamped() {
        for (limit, offset) in [(0, 0), (-3, 0), (1001, 0), (10, -1)] {
            let req = QueryRequest {
                limit,
                offset,
                ..QueryRequest::default()
            };
            let err = plan_query(&config(), "public", "widgets", &widgets(), &req).unwrap_err();
            match err {
                EngineError::InvalidPagination {
                    limit: l,
                    offset: o,
                } => {
                    assert_eq!((l, o), (limit, offset));
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }

        let at_cap = QueryRequest {
            limit: config().max_limit,
            ..QueryRequest::default()
        };
        assert!(plan_query(&config(), "public", "widgets", &widgets(), &at_cap).is_ok());
    }

    #[test]
    fn unknown_order_column_is_rejected() {
        let req = QueryRequest {
            order_by: Some("secret_rank".to_string()),
            ..QueryRequest::default()
        };
        let err = plan_query(&config(), "public", "widgets", &widgets(), &req).unwrap_err();
        assert!(matches!(err, EngineError::UnknownColumn { .. }));
    }

    #[test]
    fn malicious_order_column_fails_validation_first() {
        let req = QueryRequest {
            order_by: Some("name; DROP TABLE widgets".to_string()),
            ..QueryRequest::default()
        };
        let err = plan_query(&config(), "public", "widgets", &widgets(), &req).unwrap_err();
        assert!(matches!(err, EngineError::InvalidIdentifier { .. }));
    }

    #[test]
    fn omitted_order_leaves_row_order_unspecified() {
        let req = QueryRequest::default();
        let plan = plan_query(&config(), "public", "widgets", &widgets(), &req).unwrap();
        assert!(!plan.data_sql.contains("ORDER BY"));
    }

    #[test]
    fn search_term_joins_plan_binds() {
        let req = QueryRequest {
            search: Some("50%".to_string()),
            ..QueryRequest::default()
        };
        let plan = plan_query(&config(), "public", "widgets", &widgets(), &req).unwrap();
        assert!(plan.count_sql.contains("\"name\" ILIKE $1"));
        assert_eq!(plan.binds, vec![Bind::Text("%50\\%%".to_string())]);
    }
}
