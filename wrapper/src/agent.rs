//! Locating the agent executable and preparing its command line.

use common::config::WrapperConfig;
use portable_pty::CommandBuilder;
use std::path::{Path, PathBuf};

/// Install prefixes tried after PATH, covering the usual npm/homebrew
/// locations agents end up in when PATH is not set up for non-login shells.
fn fallback_prefixes() -> Vec<PathBuf> {
    let mut prefixes = Vec::new();
    if let Some(home) = dirs::home_dir() {
        prefixes.push(home.join(".local").join("bin"));
        prefixes.push(home.join(".npm-global").join("bin"));
    }
    prefixes.push(PathBuf::from("/usr/local/bin"));
    prefixes.push(PathBuf::from("/opt/homebrew/bin"));
    prefixes
}

/// Resolve the agent CLI: explicit paths are checked directly, bare names go
/// through PATH and then the fallback prefixes.
pub fn locate_executable(name: &str) -> Option<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let path_dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default();
    locate_in(path_dirs.into_iter().chain(fallback_prefixes()), name)
}

/// First directory in `dirs` holding an executable file named `name`.
pub fn locate_in(dirs: impl IntoIterator<Item = PathBuf>, name: &str) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Build the child command with the environment the agent expects: a modern
/// terminal type plus the Omnara identity of this session.
pub fn build_agent_command(
    program: &Path,
    args: &[String],
    config: &WrapperConfig,
    session_id: &str,
) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.env("TERM", "xterm-256color");
    if let Some(api_key) = &config.api_key {
        cmd.env("OMNARA_API_KEY", api_key);
    }
    cmd.env("OMNARA_SESSION_ID", session_id);
    cmd.env("OMNARA_API_URL", &config.api_url);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[cfg(unix)]
    fn make_executable(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_in_finds_executable() {
        let dir = tempfile::tempdir().unwrap();
        let expected = make_executable(dir.path(), "fake-agent");
        let found = locate_in([dir.path().to_path_buf()], "fake-agent");
        assert_eq!(found, Some(expected));
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_in_skips_non_executable_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fake-agent"), "data").unwrap();
        assert_eq!(locate_in([dir.path().to_path_buf()], "fake-agent"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_in_prefers_earlier_directories() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let expected = make_executable(first.path(), "fake-agent");
        make_executable(second.path(), "fake-agent");
        let found = locate_in(
            [first.path().to_path_buf(), second.path().to_path_buf()],
            "fake-agent",
        );
        assert_eq!(found, Some(expected));
    }

    #[test]
    fn test_locate_in_empty_dirs_is_none() {
        assert_eq!(locate_in([], "fake-agent"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_executable_accepts_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_executable(dir.path(), "fake-agent");
        let found = locate_executable(path.to_str().unwrap());
        assert_eq!(found, Some(path));
    }
}
