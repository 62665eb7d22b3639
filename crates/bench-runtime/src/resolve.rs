//! Locating the server and proxy executables and the model file

use bench_core::{Error, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Server executables looked for inside a llama.cpp checkout, in order
pub const SERVER_BINARY_CANDIDATES: [&str; 4] = [
    "llama-server",
    "server",
    "build/bin/llama-server",
    "build/bin/server",
];

/// Default proxy executable name
pub const PROXY_BINARY: &str = "nginx";

/// Regular file with at least one execute bit set
pub fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolve `name` the way a shell would: paths are checked directly, bare
/// names are searched on `PATH`
pub fn find_executable(name: &Path) -> Option<PathBuf> {
    if name.components().count() > 1 || name.is_absolute() {
        return is_executable(name).then(|| name.to_path_buf());
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn has_server_binary(dir: &Path) -> bool {
    SERVER_BINARY_CANDIDATES
        .iter()
        .any(|candidate| dir.join(candidate).is_file())
}

/// Walk up from `start` looking for a llama.cpp checkout that contains a
/// server build: either an ancestor named `llama.cpp` or a `llama.cpp`
/// directory next to one
pub fn detect_llama_cpp_dir(start: &Path) -> Option<PathBuf> {
    for base in start.ancestors() {
        if base.file_name().map(|n| n == "llama.cpp").unwrap_or(false) && has_server_binary(base) {
            return Some(base.to_path_buf());
        }

        let candidate = base.join("llama.cpp");
        if candidate.is_dir() && has_server_binary(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Pick the inference server executable.
///
/// An explicit path wins. Otherwise the candidates are tried inside
/// `llama_cpp_dir`, or inside a checkout detected from `search_root`.
pub fn resolve_server_binary(
    explicit: Option<&Path>,
    llama_cpp_dir: Option<&Path>,
    search_root: &Path,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return find_executable(path).ok_or_else(|| {
            Error::launch(format!(
                "server binary {} is missing or not executable",
                path.display()
            ))
        });
    }

    let dir = match llama_cpp_dir {
        Some(dir) => dir.to_path_buf(),
        None => detect_llama_cpp_dir(search_root).unwrap_or_else(|| PathBuf::from("llama.cpp")),
    };

    let found = SERVER_BINARY_CANDIDATES
        .iter()
        .map(|candidate| dir.join(candidate))
        .find(|candidate| is_executable(candidate));

    match found {
        Some(path) => {
            debug!(binary = %path.display(), "Resolved server binary");
            Ok(path)
        }
        None => Err(Error::launch(format!(
            "no llama-server binary found under {}; set the server binary or build llama.cpp",
            dir.display()
        ))),
    }
}

/// A configured model file must exist; no model means the server picks
/// its own default
pub fn ensure_model(model: Option<&Path>) -> Result<Option<PathBuf>> {
    match model {
        None => Ok(None),
        Some(path) if path.is_file() => Ok(Some(path.to_path_buf())),
        Some(path) => Err(Error::launch(format!(
            "model not found at {}",
            path.display()
        ))),
    }
}

/// Locate the proxy executable, `nginx` on `PATH` unless given
pub fn resolve_proxy_binary(explicit: Option<&Path>) -> Result<PathBuf> {
    let name = explicit.unwrap_or_else(|| Path::new(PROXY_BINARY));
    find_executable(name).ok_or_else(|| {
        Error::BinaryNotFound(format!(
            "{} not found; install nginx or set the proxy binary",
            name.display()
        ))
    })
}
