use std::collections::BTreeMap;
use std::time::Duration;

use sqlx::PgPool;
use tablegate_contracts::{ColumnMetadata, MutationResult, SqlValue};

use crate::ident::{quote_ident, validate_identifier};
use crate::predicate::{Bind, cast_for};
use crate::query::{bind_all, qualified_table, row_to_record, text_projection};
use crate::{EngineConfig, EngineError, IdentifierKind};

/// Column the row selector binds against.
const ID_COLUMN: &str = "id";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MutationPlan {
    pub sql: String,
    pub binds: Vec<Bind>,
}

/// Compiles a sparse field map into a single UPDATE. Mutation is
/// higher-risk than read: unknown columns always hard-fail, there is no
/// lenient mode.
pub(crate) fn plan_mutation(
    config: &EngineConfig,
    schema: &str,
    table: &str,
    columns: &[ColumnMetadata],
    row_id: &str,
    updates: &BTreeMap<String, serde_json::Value>,
) -> Result<MutationPlan, EngineError> {
    if updates.is_empty() {
        return Err(EngineError::InvalidValue {
            column: "updates".to_string(),
            reason: "at least one column to update is required",
        });
    }

    let mut set_fragments = Vec::with_capacity(updates.len() + 1);
    let mut binds = Vec::with_capacity(updates.len() + 1);
    let mut next = 1usize;

    for (column, raw) in updates {
        validate_identifier(column, IdentifierKind::Column)?;
        let Some(meta) = columns.iter().find(|c| c.name == *column) else {
            return Err(EngineError::UnknownColumn {
                table: table.to_string(),
                column: column.clone(),
            });
        };

        let typed =
            SqlValue::from_wire(&meta.declared_type, raw).map_err(|reason| {
                EngineError::InvalidValue {
                    column: column.clone(),
                    reason,
                }
            })?;
        let cast = placeholder_cast(&typed, &meta.declared_type);

        let mut fragment = format!("{} = ${}", quote_ident(column), next);
        if let Some(cast) = cast {
            fragment.push_str("::");
            fragment.push_str(&cast);
        }
        set_fragments.push(fragment);
        binds.push(Bind::from_sql_value(typed));
        next += 1;
    }

    if let Some(audit) = config.audit_column.as_deref() {
        let audited = columns.iter().any(|c| c.name == audit);
        if audited && !updates.contains_key(audit) {
            set_fragments.push(format!("{} = now()", quote_ident(audit)));
        }
    }

    let Some(id_meta) = columns.iter().find(|c| c.name == ID_COLUMN) else {
        return Err(EngineError::UnknownColumn {
            table: table.to_string(),
            column: ID_COLUMN.to_string(),
        });
    };

    let id_raw = serde_json::Value::String(row_id.to_string());
    let id_typed = SqlValue::from_wire(&id_meta.declared_type, &id_raw).map_err(|reason| {
        EngineError::InvalidValue {
            column: ID_COLUMN.to_string(),
            reason,
        }
    })?;
    let id_cast = placeholder_cast(&id_typed, &id_meta.declared_type);

    let mut where_sql = format!("{} = ${}", quote_ident(ID_COLUMN), next);
    if let Some(cast) = id_cast {
        where_sql.push_str("::");
        where_sql.push_str(&cast);
    }
    binds.push(Bind::from_sql_value(id_typed));

    let sql = format!(
        "UPDATE {} SET {} WHERE {} RETURNING {}",
        qualified_table(schema, table),
        set_fragments.join(", "),
        where_sql,
        text_projection(columns)
    );

    Ok(MutationPlan { sql, binds })
}

fn placeholder_cast(value: &SqlValue, declared_type: &str) -> Option<String> {
    match value {
        SqlValue::Text(_) | SqlValue::Timestamp(_) | SqlValue::Json(_) | SqlValue::Null => {
            cast_for(declared_type)
        }
        _ => None,
    }
}

/// Executes the single UPDATE statement. A timed-out or failed statement
/// leaves no partial write; zero affected rows maps to `NotFound`.
pub(crate) async fn run_mutation(
    pool: &PgPool,
    config: &EngineConfig,
    columns: &[ColumnMetadata],
    plan: &MutationPlan,
) -> Result<MutationResult, EngineError> {
    let timeout_str = format!("{}ms", config.statement_timeout.as_millis());

    let work = async {
        let mut tx = pool.begin().await?;
        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(&timeout_str)
            .execute(&mut *tx)
            .await?;

        let row = bind_all(sqlx::query(&plan.sql), &plan.binds)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok::<_, sqlx::Error>(row)
    };

    let deadline = config.statement_timeout * 2 + Duration::from_secs(1);
    let row = tokio::time::timeout(deadline, work)
        .await
        .map_err(|_| EngineError::Timeout)?
        .map_err(EngineError::store)?;

    let Some(row) = row else {
        return Err(EngineError::NotFound);
    };

    let data = row_to_record(&row, columns).map_err(EngineError::store)?;
    Ok(MutationResult { data })
}
