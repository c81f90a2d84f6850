pub mod connector;
pub mod parser;
pub mod store;
pub mod types;
