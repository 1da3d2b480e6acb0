//! Core data types shared by every ingestion component.

mod cell;
mod schema;
mod table;
mod value;

pub use cell::*;
pub use schema::*;
pub use table::*;
pub use value::*;
