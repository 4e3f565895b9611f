use std::path::PathBuf;

use super::StorageError;

/// Resolves `~`, `~/...`, `$HOME` and `$HOME/...` against the HOME variable.
pub(crate) fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let suffix = match raw_path {
        "~" | "$HOME" => Some(""),
        _ => raw_path
            .strip_prefix("~/")
            .or_else(|| raw_path.strip_prefix("$HOME/")),
    };

    let Some(suffix) = suffix else {
        return Ok(PathBuf::from(raw_path));
    };

    let home = std::env::var_os("HOME").ok_or(StorageError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(suffix))
}
