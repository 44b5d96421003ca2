//! Flag configuration documents: data model and parsing.
mod models;
mod parser;

pub use models::{Flag, FlagSet, FlagState, Metadata, MetadataValue, ValueType};
pub use parser::{parse, DocumentFormat, ParseMode};
