pub mod condition;
pub mod handler;
pub mod types;
