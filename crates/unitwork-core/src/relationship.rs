//! Relationship metadata.
//!
//! Relationships are edges between two tables backed by a single foreign-key
//! column. The session uses them for lazy loading, flush ordering and
//! cascades; stores never see them.

use crate::error::{Error, Result, SchemaErrorKind};
use std::fmt;

/// The cardinality of a relationship, seen from the table that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many-to-one: many `address` rows reference one `user`.
    /// The foreign key lives on the declaring table.
    ManyToOne,
    /// One-to-many: one `user` has many `address` rows.
    /// The foreign key lives on the target table.
    OneToMany,
}

/// Which session operations propagate along a relationship.
///
/// Parsed from the usual comma-separated option string:
///
/// ```
/// use unitwork_core::Cascade;
///
/// let c = Cascade::parse("all, delete-orphan").unwrap();
/// assert!(c.save_update && c.delete && c.delete_orphan);
///
/// let d = Cascade::default();
/// assert!(d.save_update && !d.delete);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cascade {
    /// `add` of the parent adds every related instance.
    pub save_update: bool,
    /// `delete` of the parent deletes the related instances.
    pub delete: bool,
    /// A child removed from the collection is deleted.
    pub delete_orphan: bool,
    /// `expunge` of the parent expunges the related instances.
    pub expunge: bool,
}

impl Default for Cascade {
    fn default() -> Self {
        Self {
            save_update: true,
            delete: false,
            delete_orphan: false,
            expunge: false,
        }
    }
}

impl Cascade {
    /// No cascades at all.
    pub const NONE: Cascade = Cascade {
        save_update: false,
        delete: false,
        delete_orphan: false,
        expunge: false,
    };

    /// The `all` shorthand: save-update, delete and expunge.
    pub const ALL: Cascade = Cascade {
        save_update: true,
        delete: true,
        delete_orphan: false,
        expunge: true,
    };

    /// Parse a cascade option string such as `"save-update, delete"`.
    ///
    /// `merge` and `refresh-expire` are accepted for compatibility and have
    /// no effect at this layer. An empty string means [`Cascade::NONE`].
    pub fn parse(options: &str) -> Result<Self> {
        let mut cascade = Cascade::NONE;
        for token in options.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "all" => {
                    cascade.save_update = true;
                    cascade.delete = true;
                    cascade.expunge = true;
                }
                "save-update" => cascade.save_update = true,
                "delete" => cascade.delete = true,
                "delete-orphan" => cascade.delete_orphan = true,
                "expunge" => cascade.expunge = true,
                "merge" | "refresh-expire" => {}
                other => {
                    return Err(Error::schema(
                        SchemaErrorKind::Invalid,
                        format!("unknown cascade option '{}'", other),
                    ));
                }
            }
        }
        Ok(cascade)
    }
}

impl fmt::Display for Cascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.save_update {
            parts.push("save-update");
        }
        if self.delete {
            parts.push("delete");
        }
        if self.delete_orphan {
            parts.push("delete-orphan");
        }
        if self.expunge {
            parts.push("expunge");
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// A named relationship declared on a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    name: String,
    kind: RelationshipKind,
    target: String,
    foreign_key: String,
    cascade: Cascade,
    back_populates: Option<String>,
}

impl Relationship {
    /// A reference from the declaring table to one `target` row.
    ///
    /// `foreign_key` names the column on the declaring table.
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationshipKind::ManyToOne,
            target: target.into(),
            foreign_key: foreign_key.into(),
            cascade: Cascade::default(),
            back_populates: None,
        }
    }

    /// A collection of `target` rows referencing the declaring table.
    ///
    /// `foreign_key` names the column on the target table.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: RelationshipKind::OneToMany,
            target: target.into(),
            foreign_key: foreign_key.into(),
            cascade: Cascade::default(),
            back_populates: None,
        }
    }

    /// Set the cascade policy.
    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    /// Name the relationship on the target table that mirrors this one.
    pub fn back_populates(mut self, name: impl Into<String>) -> Self {
        self.back_populates = Some(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RelationshipKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn cascade_policy(&self) -> Cascade {
        self.cascade
    }

    pub fn back_populates_name(&self) -> Option<&str> {
        self.back_populates.as_deref()
    }

    pub fn is_collection(&self) -> bool {
        self.kind == RelationshipKind::OneToMany
    }
}
