mod model;
mod order;
mod raw;

pub use model::{Project, Service};

/// File names looked up, in order, when no configuration file is given.
pub const DEFAULT_FILENAMES: [&str; 2] = ["gringo.toml", ".gringo.toml"];

/// Error type for configuration parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[cfg(feature = "toml")]
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error(s): {0}")]
    Validation(String),

    #[error("unknown service `{0}`")]
    UnknownService(String),

    #[error("circular dependency between {0:?}")]
    CircularDependency(Vec<String>),
}

/// Load a project configuration from a file path.
///
/// # Errors
///
/// Returns a `ConfigError` if the configuration file cannot be read or parsed.
pub fn load_from_path(path: &std::path::Path) -> Result<Project, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    parse_auto(&text, path)
}

/// Parse a project configuration, picking the format from the file extension.
///
/// # Errors
///
/// Returns a `ConfigError` if the configuration string cannot be parsed.
pub fn parse_auto(text: &str, path: &std::path::Path) -> Result<Project, ConfigError> {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    match ext {
        #[cfg(feature = "toml")]
        "toml" => parse_toml(text, path),
        _ => Err(ConfigError::Validation(format!(
            "unknown config extension `{ext}`"
        ))),
    }
}

/// Parse a TOML project configuration. Relative working directories are
/// resolved against the directory of `path`.
///
/// # Errors
///
/// Returns a `ConfigError` if the configuration string cannot be parsed.
#[cfg(feature = "toml")]
pub fn parse_toml(config: &str, path: &std::path::Path) -> Result<Project, ConfigError> {
    let raw_project = toml::from_str::<raw::RawProject>(config)?;
    raw_project.into_project(path)
}
