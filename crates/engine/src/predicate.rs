use tablegate_contracts::{ColumnMetadata, FilterOp, FilterSpec, SqlValue};

use crate::ident::{quote_ident, validate_identifier};
use crate::{EngineError, IdentifierKind};

/// One boolean fragment of the eventual WHERE clause. Only the renderer
/// below turns these into SQL text, so the identifier/value split is
/// enforced in a single place.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Predicate {
    Compare {
        column: String,
        op: FilterOp,
        bind: Bind,
        cast: Option<String>,
    },
    NullCheck {
        column: String,
        op: FilterOp,
    },
    SearchAny {
        columns: Vec<String>,
        pattern: String,
    },
}

/// A value destined for a numbered placeholder, never for SQL text.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Bind {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Bind {
    pub(crate) fn from_sql_value(value: SqlValue) -> Self {
        match value {
            SqlValue::Null => Bind::Null,
            SqlValue::Bool(b) => Bind::Bool(b),
            SqlValue::Int(i) => Bind::Int(i),
            SqlValue::Float(f) => Bind::Float(f),
            SqlValue::Text(s) => Bind::Text(s),
            SqlValue::Timestamp(s) => Bind::Text(s),
            SqlValue::Json(v) => Bind::Text(v.to_string()),
        }
    }
}

/// Server-side cast applied to the placeholder when the client-side bind
/// is textual but the column is not. Derived from the catalog's declared
/// type, never from user input.
pub(crate) fn cast_for(declared_type: &str) -> Option<String> {
    let ty = declared_type.trim().to_ascii_lowercase();
    let known = match ty.as_str() {
        "numeric" | "decimal" => "numeric",
        "money" => "money",
        "uuid" => "uuid",
        "date" => "date",
        "time without time zone" => "time",
        "time with time zone" => "timetz",
        "timestamp without time zone" => "timestamp",
        "timestamp with time zone" | "timestamptz" => "timestamptz",
        "interval" => "interval",
        "json" => "json",
        "jsonb" => "jsonb",
        _ => {
            // ARRAY / USER-DEFINED carry no spellable cast; natively bound
            // types need none. Anything else keeps its catalog type name,
            // which already satisfies the identifier charset.
            if is_native_bind_type(&ty)
                || matches!(ty.as_str(), "array" | "user-defined")
                || !is_castable_type_name(&ty)
            {
                return None;
            }
            return Some(ty);
        }
    };
    Some(known.to_string())
}

fn is_native_bind_type(ty: &str) -> bool {
    matches!(
        ty,
        "boolean"
            | "bool"
            | "smallint"
            | "integer"
            | "bigint"
            | "int2"
            | "int4"
            | "int8"
            | "real"
            | "double precision"
            | "float4"
            | "float8"
            | "text"
            | "character varying"
            | "character"
            | "citext"
            | "name"
    )
}

fn is_castable_type_name(ty: &str) -> bool {
    !ty.is_empty()
        && ty
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b' '))
}

/// Escapes LIKE metacharacters so the user's text matches literally.
/// Postgres treats backslash as the default ESCAPE character.
pub(crate) fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn find_column<'a>(columns: &'a [ColumnMetadata], name: &str) -> Option<&'a ColumnMetadata> {
    columns.iter().find(|c| c.name == name)
}

/// Compiles the wire filter spec into predicates, in sorted column order.
/// Unknown columns hard-fail unless `lenient` restores the source
/// system's skip-and-continue behavior.
pub(crate) fn compile_filters(
    table: &str,
    filters: &FilterSpec,
    columns: &[ColumnMetadata],
    lenient: bool,
) -> Result<Vec<Predicate>, EngineError> {
    let mut out = Vec::new();

    for (column, ops) in filters {
        validate_identifier(column, IdentifierKind::Column)?;

        let Some(meta) = find_column(columns, column) else {
            if lenient {
                continue;
            }
            return Err(EngineError::UnknownColumn {
                table: table.to_string(),
                column: column.clone(),
            });
        };

        for (op_raw, value) in ops {
            let Some(op) = FilterOp::parse(op_raw) else {
                return Err(EngineError::UnsupportedOperator {
                    operator: op_raw.clone(),
                });
            };

            if !op.takes_value() {
                // IS NULL / IS NOT NULL ignore any supplied value.
                out.push(Predicate::NullCheck {
                    column: column.clone(),
                    op,
                });
                continue;
            }

            if op.is_pattern() {
                let Some(raw) = value.as_str() else {
                    return Err(EngineError::InvalidValue {
                        column: column.clone(),
                        reason: "pattern operators require a string value",
                    });
                };
                let pattern = format!("%{}%", escape_like(raw));
                out.push(Predicate::Compare {
                    column: column.clone(),
                    op,
                    bind: Bind::Text(pattern),
                    cast: None,
                });
                continue;
            }

            let typed = SqlValue::from_wire(&meta.declared_type, value).map_err(|reason| {
                EngineError::InvalidValue {
                    column: column.clone(),
                    reason,
                }
            })?;
            let cast = match typed {
                SqlValue::Text(_) | SqlValue::Timestamp(_) | SqlValue::Json(_) | SqlValue::Null => {
                    cast_for(&meta.declared_type)
                }
                _ => None,
            };
            out.push(Predicate::Compare {
                column: column.clone(),
                op,
                bind: Bind::from_sql_value(typed),
                cast,
            });
        }
    }

    Ok(out)
}

/// Compiles the free-text search term into one OR group across every
/// searchable column. Absent term or zero text columns is a no-op, not
/// an error. Non-text columns are never cast into the search.
pub(crate) fn compile_search(
    search: Option<&str>,
    columns: &[ColumnMetadata],
) -> Option<Predicate> {
    let term = search.map(str::trim).filter(|s| !s.is_empty())?;

    let searchable = columns
        .iter()
        .filter(|c| c.is_searchable)
        .map(|c| c.name.clone())
        .collect::<Vec<_>>();
    if searchable.is_empty() {
        return None;
    }

    Some(Predicate::SearchAny {
        columns: searchable,
        pattern: format!("%{}%", escape_like(term)),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RenderedWhere {
    pub sql: String,
    pub binds: Vec<Bind>,
}

/// The single renderer. Identifiers are quoted, values become numbered
/// placeholders in bind order, fragments are AND-combined.
pub(crate) fn render_where(clauses: &[Predicate], first_placeholder: usize) -> RenderedWhere {
    let mut sql = String::new();
    let mut binds = Vec::new();
    let mut next = first_placeholder;

    for clause in clauses {
        if sql.is_empty() {
            sql.push_str(" WHERE ");
        } else {
            sql.push_str(" AND ");
        }

        match clause {
            Predicate::Compare {
                column,
                op,
                bind,
                cast,
            } => {
                sql.push_str(&quote_ident(column));
                sql.push(' ');
                sql.push_str(op.sql());
                sql.push_str(" $");
                sql.push_str(&next.to_string());
                if let Some(cast) = cast {
                    sql.push_str("::");
                    sql.push_str(cast);
                }
                binds.push(bind.clone());
                next += 1;
            }
            Predicate::NullCheck { column, op } => {
                sql.push_str(&quote_ident(column));
                sql.push(' ');
                sql.push_str(op.sql());
            }
            Predicate::SearchAny { columns, pattern } => {
                sql.push('(');
                let placeholder = next;
                for (idx, column) in columns.iter().enumerate() {
                    if idx != 0 {
                        sql.push_str(" OR ");
                    }
                    sql.push_str(&quote_ident(column));
                    sql.push_str(" ILIKE $");
                    sql.push_str(&placeholder.to_string());
                }
                sql.push(')');
                binds.push(Bind::Text(pattern.clone()));
                next += 1;
            }
        }
    }

    RenderedWhere { sql, binds }
}
