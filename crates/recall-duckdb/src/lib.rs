pub mod backend;
pub mod entries;
pub mod schema;
pub mod store_impl;

pub use backend::DuckDbBackend;
