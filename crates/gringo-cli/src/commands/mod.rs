use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gringo_config::{load_from_path, Project, DEFAULT_FILENAMES};

pub mod port;
pub mod status;
pub mod up;

/// The given file, or the first default file found in the current directory.
fn config_path(file: Option<String>) -> PathBuf {
    file.map_or_else(
        || {
            let found = DEFAULT_FILENAMES
                .iter()
                .find(|filename| Path::new(filename).exists());
            PathBuf::from(found.unwrap_or(&DEFAULT_FILENAMES[0]))
        },
        PathBuf::from,
    )
}

fn load_project(file: Option<String>) -> Result<Project> {
    let path = config_path(file);
    tracing::debug!("Loading {}", path.display());
    load_from_path(&path).with_context(|| format!("cannot load {}", path.display()))
}
