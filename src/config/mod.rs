#[cfg(feature = "cli")]
pub mod cli;
pub mod sweep_config;
pub mod toml_config;

#[cfg(feature = "cli")]
pub use cli::CliConfig;
pub use sweep_config::SweepConfig;
pub use toml_config::DesignConfig;
