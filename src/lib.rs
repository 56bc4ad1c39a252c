pub mod ast;
pub mod config;
pub mod db;
pub mod error;
pub mod queryset;

pub use error::{QuerySetError, Result};
pub use queryset::{IndexKey, QuerySet, Shaped};
