//! Query modules, one per table family.

pub mod changes;
pub mod cursors;
pub mod lease;
pub mod metrics;
pub mod reconciliations;
pub mod schema;
pub mod tasks;

use std::fmt;

use anyhow::Result;

use crate::ident::validate_ident;

/// A validated table name, safe to interpolate into statements.
///
/// Dynamic table names (source tables and their tasks tables) cannot be
/// bound as parameters, so every one is funneled through this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_ident(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_validation() {
        assert!(TableName::new("orders_tasks").is_ok());
        assert!(TableName::new("orders; --").is_err());
    }
}
