pub mod book;
pub mod config;
pub mod exchange;
pub mod logging;
pub mod stream;
