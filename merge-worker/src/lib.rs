pub mod config;
pub mod error;
pub mod merger;
pub mod worker;
