use serde::Deserialize;

/// Host-supplied schema policy. Read access and mutation access carry
/// separate allow-lists; the deny-list wins over both.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchemaPolicy {
    read_schemas: Vec<String>,
    mutation_schemas: Vec<String>,
    #[serde(default = "default_deny")]
    deny_schemas: Vec<String>,
}

fn default_deny() -> Vec<String> {
    vec!["pg_catalog".to_string(), "information_schema".to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyError {
    message: String,
}

impl PolicyError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PolicyError {}

impl SchemaPolicy {
    pub fn new(
        read_schemas: Vec<String>,
        mutation_schemas: Vec<String>,
        deny_schemas: Vec<String>,
    ) -> Result<Self, PolicyError> {
        let read_schemas = normalize(read_schemas);
        let mutation_schemas = normalize(mutation_schemas);
        let deny_schemas = normalize(deny_schemas);

        if read_schemas.is_empty() {
            return Err(PolicyError::new("read allow-list must not be empty"));
        }

        for schema in &mutation_schemas {
            if read_schemas.binary_search(schema).is_err() {
                return Err(PolicyError::new(format!(
                    "mutation schema `{}` is not in the read allow-list",
                    schema
                )));
            }
        }

        for schema in &deny_schemas {
            if read_schemas.binary_search(schema).is_ok() {
                return Err(PolicyError::new(format!(
                    "schema `{}` appears in both the allow-list and the deny-list",
                    schema
                )));
            }
        }

        Ok(Self {
            read_schemas,
            mutation_schemas,
            deny_schemas,
        })
    }

    pub fn allows_read(&self, schema: &str) -> bool {
        !self.is_denied(schema) && self.read_schemas.binary_search_by(|s| s.as_str().cmp(schema)).is_ok()
    }

    pub fn allows_mutation(&self, schema: &str) -> bool {
        !self.is_denied(schema)
            && self
                .mutation_schemas
                .binary_search_by(|s| s.as_str().cmp(schema))
                .is_ok()
    }

    fn is_denied(&self, schema: &str) -> bool {
        self.deny_schemas
            .binary_search_by(|s| s.as_str().cmp(schema))
            .is_ok()
    }
}

fn normalize(mut schemas: Vec<String>) -> Vec<String> {
    schemas = schemas
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    schemas.sort();
    schemas.dedup();
    schemas
}
