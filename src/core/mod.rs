pub mod configuration;
pub mod logger;
pub mod support;
