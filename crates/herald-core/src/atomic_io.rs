use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use serde::Serialize;

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Writes text through a sibling temp file, syncs it, then renames it into
/// place so readers never observe partial data.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let temp_path = temp_sibling(parent_dir, path);
    let mut temp_file = File::create(&temp_path)
        .with_context(|| format!("failed to create temporary file {}", temp_path.display()))?;
    temp_file
        .write_all(content.as_bytes())
        .and_then(|()| temp_file.sync_all())
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    drop(temp_file);

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })
}

/// Serializes `document` as pretty JSON with a trailing newline and writes it
/// through `write_text_atomic`.
pub fn write_json_atomic<T: Serialize>(path: &Path, document: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(document)
        .with_context(|| format!("failed to encode document for {}", path.display()))?;
    payload.push('\n');
    write_text_atomic(path, &payload)
}

fn temp_sibling(parent_dir: &Path, path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state");
    let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    parent_dir.join(format!(
        ".{file_name}.{}-{sequence}.tmp",
        std::process::id()
    ))
}
