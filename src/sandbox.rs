//! Per-session sandbox directories on the real filesystem.
//!
//! A sandbox is a plain directory under the deployment's sandbox base. It is
//! seeded with a few starter files the first time a session initializes and is
//! never removed by the server, so it can be inspected after disconnect.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directories created under every sandbox root.
const SEED_DIRS: &[&str] = &[
    ".npm-global/bin",
    ".npm-global/lib",
    ".npm-cache",
    "sample-project",
];

/// A starter file written into a fresh sandbox.
struct SeedFile {
    path: &'static str,
    content: &'static str,
    mode: u32,
}

const SEED_FILES: &[SeedFile] = &[
    SeedFile {
        path: "welcome.txt",
        content: include_str!("../seed/welcome.txt"),
        mode: 0o644,
    },
    SeedFile {
        path: "app.py",
        content: include_str!("../seed/app.py"),
        mode: 0o755,
    },
    SeedFile {
        path: "hello.js",
        content: include_str!("../seed/hello.js"),
        mode: 0o644,
    },
    SeedFile {
        path: "package.json.template",
        content: include_str!("../seed/package.json.template"),
        mode: 0o644,
    },
    SeedFile {
        path: "claude-setup.md",
        content: include_str!("../seed/claude-setup.md"),
        mode: 0o644,
    },
    SeedFile {
        path: ".npmrc",
        content: include_str!("../seed/.npmrc"),
        mode: 0o644,
    },
    SeedFile {
        path: "sample-project/package.json",
        content: include_str!("../seed/sample-project/package.json"),
        mode: 0o644,
    },
    SeedFile {
        path: "sample-project/index.js",
        content: include_str!("../seed/sample-project/index.js"),
        mode: 0o644,
    },
    SeedFile {
        path: "sample-project/README.md",
        content: include_str!("../seed/sample-project/README.md"),
        mode: 0o644,
    },
];

/// Sandbox root for a session: `<base>/<session_id>`.
///
/// Callers must have validated `session_id` as a single path component.
pub fn sandbox_path(base: &Path, session_id: &str) -> PathBuf {
    base.join(session_id)
}

/// Create the sandbox tree and seed files. Existing files are left untouched,
/// so calling this repeatedly for the same root is safe.
pub fn provision(sandbox_root: &Path) -> io::Result<()> {
    fs::create_dir_all(sandbox_root)?;

    for dir in SEED_DIRS {
        fs::create_dir_all(sandbox_root.join(dir))?;
    }

    for seed in SEED_FILES {
        let written = write_if_absent(sandbox_root, seed.path, seed.content.as_bytes())?;
        if written {
            set_mode(&sandbox_root.join(seed.path), seed.mode)?;
        }
    }

    debug!(sandbox_root = %sandbox_root.display(), "Sandbox provisioned");
    Ok(())
}

/// Write `content` at `path` relative to the sandbox root unless a file is
/// already there. Returns whether the file was created.
fn write_if_absent(sandbox_root: &Path, path: &str, content: &[u8]) -> io::Result<bool> {
    let full_path = sandbox_root.join(path.trim_start_matches('/'));

    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().write(true).create_new(true).open(&full_path) {
        Ok(mut file) => {
            file.write_all(content)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
