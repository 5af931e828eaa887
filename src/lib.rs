pub mod config;
pub mod error;
pub mod fs;
pub mod logging;
pub mod mount;
pub mod state;
pub mod store;
pub mod tree;
