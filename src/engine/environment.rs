//! Environments
//!
//! An environment names one query-server target: which vendor it speaks,
//! how to build its connection string and which databases it exposes. The
//! host application owns environments; connections only reference them.

use std::fmt;
use std::sync::Arc;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::Vendor;
use crate::observability::Sensitive;
use sqlbridge_core::wire::substitute_database;

type ConnectionStringFn = dyn Fn() -> EngineResult<String> + Send + Sync;

/// Where an environment's connection string comes from
#[derive(Clone)]
pub enum ConnectionString {
    /// Fixed template, may contain `{DATABASE}`
    Template(Sensitive<String>),
    /// Produced on demand (e.g. fetched from a secret store)
    Computed(Arc<ConnectionStringFn>),
}

impl ConnectionString {
    pub fn template(value: impl Into<String>) -> Self {
        Self::Template(Sensitive::new(value.into()))
    }

    pub fn computed<F>(f: F) -> Self
    where
        F: Fn() -> EngineResult<String> + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    fn resolve(&self) -> EngineResult<String> {
        match self {
            Self::Template(template) => Ok(template.expose().clone()),
            Self::Computed(f) => f(),
        }
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template(template) => f.debug_tuple("Template").field(template).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// A named query-server target
#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    pub vendor: Vendor,
    connection_string: ConnectionString,
    databases: Vec<String>,
    batch_separator: Option<String>,
}

impl Environment {
    pub fn new(
        name: impl Into<String>,
        vendor: Vendor,
        connection_string: ConnectionString,
        databases: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            vendor,
            connection_string,
            databases,
            batch_separator: None,
        }
    }

    /// Overrides the vendor's default batch separator token.
    pub fn with_batch_separator(mut self, separator: impl Into<String>) -> Self {
        self.batch_separator = Some(separator.into());
        self
    }

    pub fn databases(&self) -> &[String] {
        &self.databases
    }

    /// First listed database
    pub fn default_database(&self) -> Option<&str> {
        self.databases.first().map(String::as_str)
    }

    /// Separator token used to split scripts into batches
    pub fn batch_separator(&self) -> Option<&str> {
        self.batch_separator
            .as_deref()
            .or_else(|| self.vendor.default_batch_separator())
    }

    /// Registry key for a connection to `database`
    pub fn connection_key(&self, database: &str) -> String {
        format!("{}:{}", self.name, database)
    }

    /// Resolves the connection string and substitutes the target database.
    pub fn connection_string_for(&self, database: &str) -> EngineResult<Sensitive<String>> {
        let template = self.connection_string.resolve().map_err(|e| {
            EngineError::configuration(format!(
                "Failed to resolve connection string for {}: {}",
                self.name, e
            ))
        })?;
        Ok(Sensitive::new(substitute_database(&template, database)))
    }
}
