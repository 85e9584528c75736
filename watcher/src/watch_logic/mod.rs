pub mod config;
pub mod presenter;
