//! Driver library location.
//!
//! The launcher dlopens the CUDA driver at runtime. Directory discovery
//! follows the usual order: an explicit `KORE_LIBCUDA_PATH` override, then
//! the dynamic linker cache (`ldconfig -p`), then `LD_LIBRARY_PATH`.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::ffi::LIBCUDA_NAME;

/// Environment variable naming the directory that holds the driver library.
pub const LIBCUDA_PATH_ENV: &str = "KORE_LIBCUDA_PATH";

const LDCONFIG: &str = "/sbin/ldconfig";

/// Where and under what name to look for the driver library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// File name of the driver library (e.g. `libcuda.so`).
    pub library_name: String,

    /// Directories to search, in order. Empty means "let the dynamic loader
    /// search its default paths".
    #[serde(default)]
    pub library_dirs: Vec<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            library_name: LIBCUDA_NAME.to_string(),
            library_dirs: Vec::new(),
        }
    }
}

impl DriverConfig {
    /// Discover driver directories from the process environment.
    pub fn from_env() -> Self {
        let ldconfig = || {
            Command::new(LDCONFIG)
                .arg("-p")
                .output()
                .ok()
                .filter(|out| out.status.success())
                .map(|out| String::from_utf8_lossy(&out.stdout).into_owned())
        };
        let library_dirs = discover_library_dirs(
            LIBCUDA_NAME,
            std::env::var(LIBCUDA_PATH_ENV).ok().as_deref(),
            ldconfig,
            std::env::var("LD_LIBRARY_PATH").ok().as_deref(),
            |p| p.exists(),
        );
        tracing::debug!("driver library dirs: {:?}", library_dirs);
        Self {
            library_name: LIBCUDA_NAME.to_string(),
            library_dirs,
        }
    }

    /// Full paths to try when opening the library, in order.
    pub fn library_candidates(&self) -> Vec<PathBuf> {
        if self.library_dirs.is_empty() {
            return vec![PathBuf::from(&self.library_name)];
        }
        self.library_dirs
            .iter()
            .map(|dir| dir.join(&self.library_name))
            .collect()
    }

    /// Human-readable advice appended to load failures.
    pub fn load_hint(&self) -> String {
        if self.library_dirs.is_empty() {
            format!(
                "{} cannot be found! Please make sure a GPU driver is installed and then run \
                 \"{}\" (requires sudo) to refresh the linker cache, or set {}.",
                self.library_name, LDCONFIG, LIBCUDA_PATH_ENV
            )
        } else {
            let dirs: Vec<String> = self
                .library_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect();
            format!(
                "Searched {}. Please create a symlink named {} in one of these directories \
                 or set {}.",
                dirs.join(", "),
                self.library_name,
                LIBCUDA_PATH_ENV
            )
        }
    }
}

/// Parse `ldconfig -p` output into the paths of entries whose name contains `library`.
///
/// Lines look like `libcuda.so.1 (libc6,x86-64) => /lib/x86_64-linux-gnu/libcuda.so.1`.
pub fn parse_ldconfig(output: &str, library: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter(|line| line.contains(library))
        .filter_map(|line| line.split_whitespace().last())
        .filter(|loc| loc.starts_with('/'))
        .map(PathBuf::from)
        .collect()
}

/// Resolve the directories holding `library`.
///
/// Inputs are passed in so the policy can be exercised without touching the
/// real environment. `ldconfig` is only invoked when no override is set.
pub fn discover_library_dirs(
    library: &str,
    env_override: Option<&str>,
    ldconfig: impl FnOnce() -> Option<String>,
    ld_library_path: Option<&str>,
    exists: impl Fn(&Path) -> bool,
) -> Vec<PathBuf> {
    if let Some(dir) = env_override.filter(|d| !d.is_empty()) {
        return vec![PathBuf::from(dir)];
    }

    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Some(output) = ldconfig() {
        for loc in parse_ldconfig(&output, library) {
            if let Some(parent) = loc.parent() {
                let parent = parent.to_path_buf();
                if !dirs.contains(&parent) {
                    dirs.push(parent);
                }
            }
        }
    }

    if dirs.is_empty() {
        if let Some(paths) = ld_library_path {
            dirs = std::env::split_paths(paths)
                .filter(|dir| !dir.as_os_str().is_empty())
                .filter(|dir| exists(&dir.join(library)))
                .collect();
        }
    }

    // Only keep directories that actually hold the unversioned name; a bare
    // `libcuda.so.1` entry still resolves through the loader default search.
    dirs.retain(|dir| exists(&dir.join(library)));
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    const LDCONFIG_OUTPUT: &str = "\
1234 libs found in cache `/etc/ld.so.cache'
\tlibcudart.so.12 (libc6,x86-64) => /usr/local/cuda/lib64/libcudart.so.12
\tlibcuda.so.1 (libc6,x86-64) => /lib/x86_64-linux-gnu/libcuda.so.1
\tlibcuda.so (libc6,x86-64) => /lib/x86_64-linux-gnu/libcuda.so
\tlibc.so.6 (libc6,x86-64) => /lib/x86_64-linux-gnu/libc.so.6
";

    #[test]
    fn test_parse_ldconfig() {
        let locs = parse_ldconfig(LDCONFIG_OUTPUT, "libcuda.so");
        assert_eq!(
            locs,
            vec![
                PathBuf::from("/lib/x86_64-linux-gnu/libcuda.so.1"),
                PathBuf::from("/lib/x86_64-linux-gnu/libcuda.so"),
            ]
        );
    }

    #[test]
    fn test_env_override_wins() {
        let dirs = discover_library_dirs(
            "libcuda.so",
            Some("/opt/driver"),
            || panic!("ldconfig must not run when overridden"),
            Some("/usr/lib"),
            |_| false,
        );
        assert_eq!(dirs, vec![PathBuf::from("/opt/driver")]);
    }

    #[test]
    fn test_ldconfig_dirs_deduplicated() {
        let dirs = discover_library_dirs(
            "libcuda.so",
            None,
            || Some(LDCONFIG_OUTPUT.to_string()),
            None,
            |_| true,
        );
        assert_eq!(dirs, vec![PathBuf::from("/lib/x86_64-linux-gnu")]);
    }

    #[test]
    fn test_ld_library_path_fallback() {
        let dirs = discover_library_dirs(
            "libcuda.so",
            None,
            || None,
            Some("/a:/b::/c"),
            |p| p == Path::new("/b/libcuda.so"),
        );
        assert_eq!(dirs, vec![PathBuf::from("/b")]);
    }

    #[test]
    fn test_candidates_fall_back_to_bare_name() {
        let config = DriverConfig::default();
        assert_eq!(config.library_candidates(), vec![PathBuf::from("libcuda.so")]);

        let config = DriverConfig {
            library_dirs: vec![PathBuf::from("/x"), PathBuf::from("/y")],
            ..DriverConfig::default()
        };
        assert_eq!(
            config.library_candidates(),
            vec![PathBuf::from("/x/libcuda.so"), PathBuf::from("/y/libcuda.so")]
        );
        assert!(config.load_hint().contains("/x, /y"));
    }
}
