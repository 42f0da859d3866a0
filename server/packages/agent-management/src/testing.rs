//! Test support: executable stub agents emitting the line-delimited protocol.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Writes an executable stub agent into `bin_dir` and returns its path.
///
/// The stub answers `--version` on its own; any other invocation runs
/// `chat_script` with the original arguments still in `$@` (so `$2` is the
/// prompt when the caller passed `-p <prompt> ...`).
pub fn write_stub_agent(bin_dir: &Path, name: &str, chat_script: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(bin_dir)?;
    let path = bin_dir.join(name);
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then\n  echo \"{name} 0.1.0 (stub)\"\n  exit 0\nfi\n{chat_script}\n"
    );
    fs::write(&path, script)?;
    set_executable(&path)?;
    Ok(path)
}

fn set_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
