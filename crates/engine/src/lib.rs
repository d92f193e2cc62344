use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tablegate_contracts::{ColumnMetadata, MutationResult, QueryRequest, QueryResult};
use tablegate_policy::SchemaPolicy;
use ulid::Ulid;

pub mod ident;
pub mod introspect;
mod mutate;
mod predicate;
mod query;

pub use introspect::SchemaCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Schema,
    Table,
    Column,
}

impl IdentifierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierKind::Schema => "schema",
            IdentifierKind::Table => "table",
            IdentifierKind::Column => "column",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    InvalidIdentifier {
        value: String,
        kind: IdentifierKind,
    },
    TableNotFound {
        schema: String,
        table: String,
    },
    UnknownColumn {
        table: String,
        column: String,
    },
    UnsupportedOperator {
        operator: String,
    },
    InvalidPagination {
        limit: i64,
        offset: i64,
    },
    InvalidValue {
        column: String,
        reason: &'static str,
    },
    PermissionDenied,
    NotFound,
    Timeout,
    StoreError {
        correlation_id: String,
    },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidIdentifier { value, kind } => {
                write!(f, "invalid {} identifier `{}`", kind.as_str(), value)
            }
            EngineError::TableNotFound { schema, table } => {
                write!(f, "table `{}.{}` not found", schema, table)
            }
            EngineError::UnknownColumn { table, column } => {
                write!(f, "unknown column `{}` on table `{}`", column, table)
            }
            EngineError::UnsupportedOperator { operator } => {
                write!(f, "unsupported filter operator `{}`", operator)
            }
            EngineError::InvalidPagination { limit, offset } => {
                write!(f, "invalid pagination (limit {}, offset {})", limit, offset)
            }
            EngineError::InvalidValue { column, reason } => {
                write!(f, "invalid value for `{}`: {}", column, reason)
            }
            EngineError::PermissionDenied => write!(f, "permission denied"),
            EngineError::NotFound => write!(f, "row not found"),
            EngineError::Timeout => write!(f, "statement timed out"),
            EngineError::StoreError { correlation_id } => {
                write!(f, "store error (correlation id {})", correlation_id)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Raw database errors never reach the caller; they are logged under
    /// a correlation id and surfaced opaquely. Server-side statement
    /// timeouts (SQLSTATE 57014) map to the `Timeout` arm.
    pub(crate) fn store(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some("57014") {
                return EngineError::Timeout;
            }
        }
        let correlation_id = Ulid::new().to_string();
        tracing::error!(correlation_id = %correlation_id, error = %err, "store error");
        EngineError::StoreError { correlation_id }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_limit: i64,
    pub statement_timeout: Duration,
    pub audit_column: Option<String>,
    pub lenient_filters: bool,
    pub cache_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_limit: 1000,
            statement_timeout: Duration::from_secs(15),
            audit_column: Some("updated_at".to_string()),
            lenient_filters: false,
            cache_enabled: false,
        }
    }
}

/// The engine facade. Every entry point authorizes first; identifier
/// validation, introspection, compilation, and execution only happen for
/// administrative callers. Requests are stateless; there are no retries.
#[derive(Clone)]
pub struct Engine {
    pool: PgPool,
    policy: SchemaPolicy,
    config: EngineConfig,
    cache: Option<Arc<SchemaCache>>,
}

impl Engine {
    pub fn new(pool: PgPool, policy: SchemaPolicy, config: EngineConfig) -> Self {
        let cache = config.cache_enabled.then(|| Arc::new(SchemaCache::new()));
        Self {
            pool,
            policy,
            config,
            cache,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Signals a schema change (DDL) to the optional metadata cache.
    pub fn invalidate_schema_cache(&self) {
        if let Some(cache) = self.cache.as_ref() {
            cache.invalidate();
        }
    }

    pub async fn introspect(
        &self,
        is_admin: bool,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnMetadata>, EngineError> {
        let columns = self.readable_columns(is_admin, schema, table).await?;
        Ok(columns.as_ref().clone())
    }

    pub async fn query(
        &self,
        is_admin: bool,
        schema: &str,
        table: &str,
        req: &QueryRequest,
    ) -> Result<QueryResult, EngineError> {
        let columns = self.readable_columns(is_admin, schema, table).await?;
        let plan = query::plan_query(&self.config, schema, table, &columns, req)?;
        query::run_query(&self.pool, &self.config, &columns, &plan).await
    }

    pub async fn mutate(
        &self,
        is_admin: bool,
        schema: &str,
        table: &str,
        row_id: &str,
        updates: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<MutationResult, EngineError> {
        self.authorize(is_admin)?;
        self.validate_table_ref(schema, table)?;

        // The mutable-schema allow-list is a policy decision, enforced
        // before any compilation work.
        if !self.policy.allows_mutation(schema) {
            return Err(EngineError::PermissionDenied);
        }

        let columns = self.columns_for(schema, table).await?;
        let plan = mutate::plan_mutation(&self.config, schema, table, &columns, row_id, updates)?;
        mutate::run_mutation(&self.pool, &self.config, &columns, &plan).await
    }

    fn authorize(&self, is_admin: bool) -> Result<(), EngineError> {
        if is_admin {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied)
        }
    }

    fn validate_table_ref(&self, schema: &str, table: &str) -> Result<(), EngineError> {
        ident::validate_identifier(schema, IdentifierKind::Schema)?;
        ident::validate_identifier(table, IdentifierKind::Table)?;
        Ok(())
    }

    async fn readable_columns(
        &self,
        is_admin: bool,
        schema: &str,
        table: &str,
    ) -> Result<Arc<Vec<ColumnMetadata>>, EngineError> {
        self.authorize(is_admin)?;
        self.validate_table_ref(schema, table)?;

        // Schemas outside the read allow-list are indistinguishable from
        // tables that do not exist.
        if !self.policy.allows_read(schema) {
            return Err(EngineError::TableNotFound {
                schema: schema.to_string(),
                table: table.to_string(),
            });
        }

        self.columns_for(schema, table).await
    }

    async fn columns_for(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Arc<Vec<ColumnMetadata>>, EngineError> {
        if let Some(cache) = self.cache.as_ref() {
            if let Some(columns) = cache.get(schema, table).await {
                return Ok(columns);
            }
        }

        let columns = Arc::new(introspect::fetch_columns(&self.pool, schema, table).await?);

        if let Some(cache) = self.cache.as_ref() {
            cache.put(schema, table, Arc::clone(&columns)).await;
        }

        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_kind_names() {
        assert_eq!(IdentifierKind::Schema.as_str(), "schema");
        assert_eq!(IdentifierKind::Table.as_str(), "table");
        assert_eq!(IdentifierKind::Column.as_str(), "column");
    }

    #[test]
    fn display_names_the_offending_input() {
        let err = EngineError::InvalidIdentifier {
            value: "bad name".to_string(),
            kind: IdentifierKind::Column,
        };
        assert_eq!(err.to_string(), "invalid column identifier `bad name`");

        let err = EngineError::UnknownColumn {
            table: "widgets".to_string(),
            column: "bogus".to_string(),
        };
        assert_eq!(err.to_string(), "unknown column `bogus` on table `widgets`");

        let err = EngineError::UnsupportedOperator {
            operator: "BETWEEN".to_string(),
        };
        assert_eq!(err.to_string(), "unsupported filter operator `BETWEEN`");
    }

    fn lazy_engine(read: &[&str], mutation: &[&str]) -> Engine {
        let pool = PgPool::connect_lazy("postgres://nobody@localhost:1/void")
            .expect("lazy pool should build without connecting");
        let policy = SchemaPolicy::new(
            read.iter().map(|s| s.to_string()).collect(),
            mutation.iter().map(|s| s.to_string()).collect(),
            Vec::new(),
        )
        .expect("policy should build");
        Engine::new(pool, policy, EngineConfig::default())
    }

    // These paths must fail before the engine ever needs a connection;
    // the lazy pool points at nothing.
    #[tokio::test]
    async fn authorization_precedes_all_other_checks() {
        let engine = lazy_engine(&["public"], &[]);

        let err = engine
            .query(false, "no such schema!", "widgets", &QueryRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied));

        let err = engine
            .mutate(
                false,
                "public",
                "widgets",
                "x",
                &std::collections::BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied));
    }

    #[tokio::test]
    async fn identifier_and_policy_gates_need_no_connection() {
        let engine = lazy_engine(&["public"], &[]);

        let err = engine
            .query(true, "public", "widgets; --", &QueryRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidIdentifier { .. }));

        let err = engine
            .query(true, "stealth", "widgets", &QueryRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TableNotFound { .. }));

        let err = engine
            .mutate(
                true,
                "public",
                "widgets",
                "x",
                &std::collections::BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied));
    }

    #[test]
    fn default_config_matches_documented_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.max_limit, 1000);
        assert_eq!(config.statement_timeout, Duration::from_secs(15));
        assert_eq!(config.audit_column.as_deref(), Some("updated_at"));
        assert!(!config.lenient_filters);
        assert!(!config.cache_enabled);
    }
}
