//! Typed models.
//!
//! Sessions track dynamic instances, but application code usually has a
//! struct per table. Implementing [`Model`] lets such a struct be converted
//! into a row for a new instance and read back out of a loaded one.

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// A struct that maps to one table.
pub trait Model: Sized {
    /// The name of the table this model maps to.
    const TABLE_NAME: &'static str;

    /// Column/value pairs for this instance. Columns left out are NULL
    /// (or generated by the store).
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Build the model from a row.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;
}
