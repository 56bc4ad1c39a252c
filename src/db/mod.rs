mod connection;
mod driver;
mod registry;
mod schema;
mod value;

#[cfg(test)]
pub(crate) mod stub;

pub use connection::*;
pub use driver::*;
pub use registry::*;
pub use schema::*;
pub use value::*;
