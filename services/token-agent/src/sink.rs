//! File sinks
//!
//! Each sink is a bound connection that mirrors the current token into a
//! file for other processes to read. Writes go to a temp file in the same
//! directory and are renamed over the target, so readers never observe a
//! partial token.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use token_lifecycle::{BoxError, Connection};

use crate::error::{Error, Result};

/// Token file sink.
pub struct FileSink {
    path: PathBuf,
    name: String,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("file:{}", path.display());
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file contents with `value`, mode 0600 on unix.
    pub fn write(&self, value: &str) -> Result<()> {
        write_atomic(&self.path, value.as_bytes())
    }
}

impl Connection for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply_credential(&self, value: &str) -> std::result::Result<(), BoxError> {
        self.write(value).map_err(Into::into)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let sink_err = |source: std::io::Error| Error::Sink {
        path: path.display().to_string(),
        source,
    };

    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("sink path has no file name: {}", path.display())))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp_path).map_err(sink_err)?;
    file.write_all(data).map_err(sink_err)?;
    file.sync_all().map_err(sink_err)?;
    drop(file);

    // A stale temp file keeps its old mode; tighten it before publishing.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
            .map_err(sink_err)?;
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(sink_err(e));
    }

    debug!(path = %path.display(), "token file written");
    Ok(())
}
