//! State directory resolution

use std::path::{Path, PathBuf};

/// Expand a leading `~` to the user's home directory.
pub fn expand_path(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Default directory for the durable state file.
///
/// - Linux: `$XDG_STATE_HOME/tunnelkeeper`, falling back to `~/.local/state/tunnelkeeper`
/// - macOS: `~/Library/Application Support/tunnelkeeper`
pub fn default_state_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        home_dir()
            .map(|h| h.join("Library/Application Support/tunnelkeeper"))
            .unwrap_or_else(|| PathBuf::from(".tunnelkeeper"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var_os("XDG_STATE_HOME")
            .map(PathBuf::from)
            .or_else(|| home_dir().map(|h| h.join(".local/state")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tunnelkeeper")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/var/lib/tunnelkeeper");
        assert_eq!(expand_path(&path), path);
    }

    #[test]
    fn test_default_state_dir_is_named() {
        assert!(default_state_dir().ends_with("tunnelkeeper"));
    }
}
