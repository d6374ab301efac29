//! Runtime row descriptor for the task table.
//!
//! The task table has a fixed canonical column set plus an open set of
//! user-defined columns (e.g. `project_id`). Because user columns are only
//! known at runtime, the DDL is generated from the descriptor rather than
//! shipped as static migration files.

use std::fmt;

use thiserror::Error;

/// Default name of the task table.
pub const DEFAULT_TABLE: &str = "apflow_tasks";

/// Canonical columns present on every task row.
pub const CANONICAL_COLUMNS: &[&str] = &[
    "id",
    "parent_id",
    "user_id",
    "name",
    "status",
    "priority",
    "dependencies",
    "inputs",
    "params",
    "schemas",
    "result",
    "error",
    "progress",
    "has_children",
    "created_at",
    "updated_at",
    "started_at",
    "completed_at",
];

/// SQL type of a user-defined column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Json,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            Self::Text | Self::Json => "TEXT",
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// A user-defined column declaration.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

/// Errors raised while declaring a table schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid column name {0:?}: must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidColumnName(String),

    #[error("column {0:?} is a canonical task column and cannot be redeclared")]
    ReservedColumn(String),

    #[error("column {0:?} is already declared")]
    DuplicateColumn(String),

    #[error("invalid table name {0:?}: must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidTableName(String),
}

fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Describes the task table: its name plus the user-defined columns that
/// extend the canonical set.
#[derive(Debug, Clone)]
pub struct TaskTableSchema {
    table: String,
    extra_columns: Vec<ColumnDef>,
}

impl Default for TaskTableSchema {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_owned(),
            extra_columns: Vec::new(),
        }
    }
}

impl TaskTableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: impl Into<String>) -> Result<Self, SchemaError> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(SchemaError::InvalidTableName(table));
        }
        Ok(Self {
            table,
            extra_columns: Vec::new(),
        })
    }

    /// Declare a user-defined column. Column names are validated as plain
    /// identifiers since they are interpolated into DDL and queries.
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        ty: ColumnType,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        if !is_valid_identifier(&name) {
            return Err(SchemaError::InvalidColumnName(name));
        }
        if CANONICAL_COLUMNS.contains(&name.as_str()) {
            return Err(SchemaError::ReservedColumn(name));
        }
        if self.extra_columns.iter().any(|c| c.name == name) {
            return Err(SchemaError::DuplicateColumn(name));
        }
        self.extra_columns.push(ColumnDef { name, ty });
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn extra_columns(&self) -> &[ColumnDef] {
        &self.extra_columns
    }

    pub fn extra_column(&self, name: &str) -> Option<&ColumnDef> {
        self.extra_columns.iter().find(|c| c.name == name)
    }

    /// True when `name` is a canonical column or a declared user column.
    pub fn has_column(&self, name: &str) -> bool {
        CANONICAL_COLUMNS.contains(&name) || self.extra_column(name).is_some()
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this schema.
    pub fn create_table_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n\
             \tid TEXT PRIMARY KEY,\n\
             \tparent_id TEXT,\n\
             \tuser_id TEXT,\n\
             \tname TEXT NOT NULL,\n\
             \tstatus TEXT NOT NULL DEFAULT 'pending',\n\
             \tpriority INTEGER NOT NULL DEFAULT 1,\n\
             \tdependencies TEXT NOT NULL DEFAULT '[]',\n\
             \tinputs TEXT NOT NULL DEFAULT '{{}}',\n\
             \tparams TEXT NOT NULL DEFAULT '{{}}',\n\
             \tschemas TEXT NOT NULL DEFAULT '{{}}',\n\
             \tresult TEXT,\n\
             \terror TEXT,\n\
             \tprogress REAL NOT NULL DEFAULT 0.0,\n\
             \thas_children INTEGER NOT NULL DEFAULT 0,\n\
             \tcreated_at TEXT NOT NULL,\n\
             \tupdated_at TEXT NOT NULL,\n\
             \tstarted_at TEXT,\n\
             \tcompleted_at TEXT",
            self.table
        );
        for col in &self.extra_columns {
            sql.push_str(&format!(",\n\t{} {}", col.name, col.ty));
        }
        sql.push_str("\n)");
        sql
    }

    /// `CREATE INDEX IF NOT EXISTS` statements for the indexed columns.
    pub fn create_index_sql(&self) -> Vec<String> {
        ["parent_id", "user_id", "name", "status"]
            .iter()
            .map(|col| {
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table}({col})",
                    table = self.table,
                    col = col
                )
            })
            .collect()
    }
}
