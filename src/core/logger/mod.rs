pub mod shadow_logger;
