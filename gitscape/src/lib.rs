pub mod cli;
pub mod load_config;
pub mod server;
pub mod stream;

pub use cli::{run, Cli, Commands};
