mod base;
mod ingest;
mod settings;
mod warehouse;

pub use base::*;
pub use ingest::*;
pub use settings::*;
pub use warehouse::*;
