// SPDX-License-Identifier: Apache-2.0

//! Shared data types for sqlbridge
//!
//! `QueryResult` and `Row` double as the protobuf schema the query server
//! emits for every statement it executes, so the prost field tags below are
//! part of the wire contract.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// One statement's result (or status) inside a batch response
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, prost::Message)]
pub struct QueryResult {
    /// Column names, in select-list order
    #[prost(string, repeated, tag = "1")]
    pub columns: Vec<String>,
    /// Result rows, already rendered to text by the server
    #[prost(message, repeated, tag = "2")]
    pub rows: Vec<Row>,
    /// Informational output (row counts, PRINT output, notices)
    #[prost(string, tag = "3")]
    pub message: String,
    /// Error reported by the database for this statement
    #[prost(string, tag = "4")]
    pub error: String,
}

/// A single row of data (indexed by column order)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, prost::Message)]
pub struct Row {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }

    /// True when the statement produced a tabular result
    pub fn is_tabular(&self) -> bool {
        !self.columns.is_empty()
    }

    /// True when the server reported an error, either in the dedicated
    /// field or as an error line inside `message`.
    pub fn is_failure(&self, vendor: Vendor) -> bool {
        !self.error.is_empty() || self.message.lines().any(|line| vendor.is_error_line(line))
    }
}

impl Row {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Database backend a connection targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    SqlServer,
    Postgres,
    MySql,
    Sqlite,
    Oracle,
}

impl Vendor {
    pub const ALL: [Vendor; 5] = [
        Vendor::SqlServer,
        Vendor::Postgres,
        Vendor::MySql,
        Vendor::Sqlite,
        Vendor::Oracle,
    ];

    /// Tag sent as `dbtype` in the handshake
    pub fn tag(self) -> &'static str {
        match self {
            Vendor::SqlServer => "sqlserver",
            Vendor::Postgres => "postgres",
            Vendor::MySql => "mysql",
            Vendor::Sqlite => "sqlite",
            Vendor::Oracle => "oracle",
        }
    }

    /// Line that separates batches in a script, if the vendor has one
    pub fn default_batch_separator(self) -> Option<&'static str> {
        match self {
            Vendor::SqlServer => Some("GO"),
            Vendor::Oracle => Some("/"),
            Vendor::Postgres | Vendor::MySql | Vendor::Sqlite => None,
        }
    }

    /// Whether a line of server output reports an error for this vendor
    pub fn is_error_line(self, line: &str) -> bool {
        let line = line.trim_start();
        match self {
            // Severity 10 and below are informational in SQL Server.
            Vendor::SqlServer => sqlserver_message()
                .captures(line)
                .and_then(|caps| caps.get(1))
                .and_then(|level| level.as_str().parse::<u8>().ok())
                .is_some_and(|level| level > 10),
            Vendor::Postgres => postgres_error().is_match(line),
            Vendor::MySql => mysql_error().is_match(line),
            Vendor::Sqlite => sqlite_error().is_match(line),
            Vendor::Oracle => oracle_error().is_match(line),
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Vendor {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "sqlserver" | "mssql" => Ok(Vendor::SqlServer),
            "postgres" | "postgresql" => Ok(Vendor::Postgres),
            "mysql" | "mariadb" => Ok(Vendor::MySql),
            "sqlite" => Ok(Vendor::Sqlite),
            "oracle" => Ok(Vendor::Oracle),
            _ => Err(EngineError::configuration(format!("Unknown database type: {s}"))),
        }
    }
}

fn sqlserver_message() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Msg \d+, Level (\d+)").expect("valid regex"))
}

fn postgres_error() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(ERROR|FATAL|PANIC):").expect("valid regex"))
}

fn mysql_error() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ERROR \d+").expect("valid regex"))
}

fn sqlite_error() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(Parse error|Runtime error|Error):").expect("valid regex"))
}

fn oracle_error() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(ORA|PLS|SP2)-\d{4,5}").expect("valid regex"))
}
