use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Quoted form suitable for SQL statements.
    pub fn quoted(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.table)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl FromStr for TableName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(TableName::new(schema, table))
            }
            None if !s.is_empty() => Ok(TableName::new("public", s)),
            _ => Err(Error::Configuration(format!("invalid table name '{}'", s))),
        }
    }
}

fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// A table that passed verification against the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedTable {
    pub name: TableName,

    /// Whether the source and target share a primary key, which is what
    /// makes row-level comparison and migration possible.
    #[serde(default = "default_row_verifiable")]
    pub row_verifiable: bool,
}

fn default_row_verifiable() -> bool {
    true
}

impl VerifiedTable {
    pub fn new(name: TableName) -> Self {
        Self {
            name,
            row_verifiable: true,
        }
    }
}
