use serde::{Deserialize, Serialize};

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at);

CREATE TABLE IF NOT EXISTS search_indexes (
    name TEXT PRIMARY KEY,
    prefix TEXT NOT NULL,
    definition TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Tag,
    Text,
    Numeric,
    /// Cosine-distance vector field.
    Vector { dimensions: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexField {
    /// JSON path into the stored document, e.g. `$.userId`.
    pub path: String,
    /// Name used by queries.
    pub alias: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub prefix: String,
    pub fields: Vec<IndexField>,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self { name: name.into(), prefix: prefix.into(), fields: Vec::new() }
    }

    fn field(mut self, alias: &str, kind: FieldKind) -> Self {
        self.fields.push(IndexField {
            path: format!("$.{}", alias),
            alias: alias.to_string(),
            kind,
        });
        self
    }

    pub fn tag(self, alias: &str) -> Self {
        self.field(alias, FieldKind::Tag)
    }

    pub fn text(self, alias: &str) -> Self {
        self.field(alias, FieldKind::Text)
    }

    pub fn numeric(self, alias: &str) -> Self {
        self.field(alias, FieldKind::Numeric)
    }

    pub fn vector(self, alias: &str, dimensions: usize) -> Self {
        self.field(alias, FieldKind::Vector { dimensions })
    }

    pub fn lookup(&self, alias: &str) -> Option<&IndexField> {
        self.fields.iter().find(|f| f.alias == alias)
    }
}
