//! Sessions bound to an [`Engine`].
//!
//! ```
//! use std::sync::Arc;
//! use unitwork::prelude::*;
//!
//! let engine = create_engine("memory://").unwrap();
//! let session = SessionBuilder::new()
//!     .expire_on_commit(false)
//!     .build_with(engine, Arc::new(MetaData::new()));
//! assert!(!session.config().expire_on_commit);
//! ```

use crate::engine::Engine;
use std::sync::Arc;
use unitwork_core::{MetaData, Result};
use unitwork_session::SessionConfig;

/// A session drawing connections from an [`Engine`].
pub type Session = unitwork_session::Session<Engine>;

/// Builder for [`Session`]s.
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    /// A builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a complete configuration.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from a JSON configuration, see [`SessionConfig::from_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self {
            config: SessionConfig::from_json(json)?,
        })
    }

    #[must_use]
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.config = self.config.auto_begin(value);
        self
    }

    #[must_use]
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.config = self.config.auto_flush(value);
        self
    }

    #[must_use]
    pub fn expire_on_commit(mut self, value: bool) -> Self {
        self.config = self.config.expire_on_commit(value);
        self
    }

    /// Build the session against `engine`.
    pub fn build_with(self, engine: Engine, metadata: Arc<MetaData>) -> Session {
        tracing::debug!(url = %engine.config().url, config = ?self.config, "Building session");
        Session::with_config(engine, metadata, self.config)
    }
}

impl Engine {
    /// A session against this engine with the default configuration.
    pub fn session(&self, metadata: Arc<MetaData>) -> Session {
        SessionBuilder::new().build_with(self.clone(), metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_engine;

    #[test]
    fn test_builder_applies_config() {
        let engine = create_engine("memory://").unwrap();
        let session = SessionBuilder::new()
            .auto_begin(false)
            .auto_flush(false)
            .build_with(engine.clone(), Arc::new(MetaData::new()));
        let config = session.config();
        assert!(!config.auto_begin);
        assert!(!config.auto_flush);
        assert!(config.expire_on_commit);

        let defaults = engine.session(Arc::new(MetaData::new()));
        assert_eq!(defaults.config(), &SessionConfig::default());
    }

    #[test]
    fn test_builder_from_json() {
        let builder = SessionBuilder::from_json(r#"{"auto_flush": false}"#).unwrap();
        let session = builder.build_with(
            create_engine("memory://").unwrap(),
            Arc::new(MetaData::new()),
        );
        assert!(!session.config().auto_flush);
        assert!(session.config().auto_begin);
        assert!(SessionBuilder::from_json("[1, 2]").is_err());
    }
}
