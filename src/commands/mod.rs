pub mod check;
pub mod config;
pub mod xino;

pub use check::run_check;
pub use config::handle_config_command;
pub use xino::handle_xino_command;
