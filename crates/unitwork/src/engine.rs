//! Engines: where sessions get their connections.
//!
//! An [`Engine`] is built from a URL by [`create_engine`]. Only the
//! in-memory store exists at this layer:
//!
//! ```
//! use unitwork::create_engine;
//!
//! let engine = create_engine("memory://?echo=true").unwrap();
//! assert!(engine.config().echo);
//! assert!(create_engine("postgres://localhost/db").is_err());
//! ```

use serde::{Deserialize, Serialize};
use unitwork_core::{Connection, ConnectionSource, Error, MetaData, Result};
use unitwork_memory::{MemoryConnection, MemoryEngine};

/// Scheme of the in-memory store.
pub const MEMORY_SCHEME: &str = "memory://";

/// Engine settings parsed from a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The URL the engine was created from.
    pub url: String,
    /// Record every statement in the echo log (and log it at INFO).
    #[serde(default)]
    pub echo: bool,
}

impl EngineConfig {
    /// Parse an engine URL such as `memory://` or `memory://?echo=true`.
    pub fn parse(url: &str) -> Result<Self> {
        let Some(rest) = url.strip_prefix(MEMORY_SCHEME) else {
            return Err(Error::config(format!(
                "unsupported engine URL '{url}'; only {MEMORY_SCHEME} is available"
            )));
        };
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        if !path.is_empty() {
            return Err(Error::config(format!(
                "in-memory engine URL takes no path, got '{path}'"
            )));
        }

        let mut config = Self {
            url: url.to_string(),
            echo: false,
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "true"));
            match key {
                "echo" => config.echo = parse_flag(key, value)?,
                other => {
                    return Err(Error::config(format!(
                        "unknown engine option '{other}' in '{url}'"
                    )));
                }
            }
        }
        Ok(config)
    }

    /// Load from a JSON object with `url` and optional `echo`.
    ///
    /// The URL's own options are applied first; an explicit `echo` field
    /// overrides them.
    pub fn from_json(json: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Raw {
            url: String,
            echo: Option<bool>,
        }
        let raw: Raw = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid engine configuration: {e}")))?;
        let mut config = Self::parse(&raw.url)?;
        if let Some(echo) = raw.echo {
            config.echo = echo;
        }
        Ok(config)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!(
            "option '{key}' expects a boolean, got '{other}'"
        ))),
    }
}

/// Create an engine from a URL.
pub fn create_engine(url: &str) -> Result<Engine> {
    Ok(Engine::from_config(EngineConfig::parse(url)?))
}

/// A connection source for sessions, plus a few conveniences.
///
/// Clones share the same store.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    store: MemoryEngine,
}

impl Engine {
    pub fn from_config(config: EngineConfig) -> Self {
        let store = if config.echo {
            MemoryEngine::with_echo()
        } else {
            MemoryEngine::new()
        };
        tracing::info!(url = %config.url, echo = config.echo, "Engine created");
        Self { config, store }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying in-memory store.
    pub fn store(&self) -> &MemoryEngine {
        &self.store
    }

    /// A fresh connection in autocommit mode.
    pub fn connect(&self) -> Result<MemoryConnection> {
        self.store.connect()
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err` and
    /// passes the error through.
    ///
    /// ```
    /// use unitwork::{Column, Connection, MetaData, SqlType, Statement, Table, create_engine};
    ///
    /// let engine = create_engine("memory://").unwrap();
    /// let mut metadata = MetaData::new();
    /// metadata
    ///     .add_table(
    ///         Table::builder("user")
    ///             .column(Column::new("id", SqlType::Integer).primary_key())
    ///             .build()
    ///             .unwrap(),
    ///     )
    ///     .unwrap();
    /// engine.create_all(&metadata).unwrap();
    ///
    /// let inserted = engine
    ///     .begin(|conn| {
    ///         conn.execute(&Statement::Insert {
    ///             table: "user".into(),
    ///             columns: vec![],
    ///             values: vec![],
    ///         })
    ///     })
    ///     .unwrap();
    /// assert_eq!(inserted.rows_affected, 1);
    /// ```
    pub fn begin<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut MemoryConnection) -> Result<T>,
    {
        let mut conn = self.connect()?;
        conn.begin()?;
        match f(&mut conn) {
            Ok(value) => {
                conn.commit()?;
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Rolling back scoped transaction");
                conn.rollback()?;
                Err(e)
            }
        }
    }

    /// Create every table of `metadata` not yet present.
    pub fn create_all(&self, metadata: &MetaData) -> Result<usize> {
        let mut conn = self.connect()?;
        metadata.create_all(&mut conn)
    }

    /// Statements run so far, when echo is on.
    pub fn echo_log(&self) -> Vec<String> {
        self.store.echo_log()
    }

    pub fn clear_echo_log(&self) {
        self.store.clear_echo_log();
    }

    /// Rows currently stored in a table.
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.store.row_count(table)
    }
}

impl ConnectionSource for Engine {
    type Connection = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection> {
        self.store.connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_url() {
        let config = EngineConfig::parse("memory://").unwrap();
        assert_eq!(config.url, "memory://");
        assert!(!config.echo);

        assert!(EngineConfig::parse("memory://?echo=true").unwrap().echo);
        assert!(EngineConfig::parse("memory://?echo").unwrap().echo);
        assert!(!EngineConfig::parse("memory://?echo=0").unwrap().echo);
    }

    #[test]
    fn test_parse_rejects_other_urls() {
        for url in [
            "sqlite:///tmp/x.db",
            "memory://somewhere",
            "memory://?pool=5",
            "memory://?echo=maybe",
        ] {
            let err = EngineConfig::parse(url).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{url}");
        }
    }

    #[test]
    fn test_from_json() {
        let config = EngineConfig::from_json(r#"{"url": "memory://?echo=true"}"#).unwrap();
        assert!(config.echo);
        let config =
            EngineConfig::from_json(r#"{"url": "memory://?echo=true", "echo": false}"#).unwrap();
        assert!(!config.echo);
        assert!(EngineConfig::from_json(r#"{"echo": true}"#).is_err());
    }

    #[test]
    fn test_echo_follows_config() {
        assert!(create_engine("memory://?echo=1").unwrap().store().echo_enabled());
        assert!(!create_engine("memory://").unwrap().store().echo_enabled());
    }
}
