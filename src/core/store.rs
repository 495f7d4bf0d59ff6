// src/core/store.rs

//! Config Store (spec §4.A): reads/writes the on-disk config file and its
//! `prepare`/`backup` siblings, and resolves `__file` inlining at load time.

use crate::core::document::{Doc, inline_files};
use crate::core::errors::AppError;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const ACTIVE_FILE: &str = "config.yml";
pub const PREPARE_FILE: &str = "config.prepare.yml";
pub const BACKUP_FILE: &str = "config.backup.yml";

pub fn active_path(workdir: &Path) -> PathBuf {
    workdir.join(ACTIVE_FILE)
}

pub fn prepare_path(workdir: &Path) -> PathBuf {
    workdir.join(PREPARE_FILE)
}

pub fn backup_path(workdir: &Path) -> PathBuf {
    workdir.join(BACKUP_FILE)
}

/// `load(path)`: reads, parses, and inlines `__file` references.
pub fn load(path: &Path) -> Result<Doc, AppError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::ConfigLoad(format!("reading '{}': {e}", path.display())))?;
    if raw.trim().is_empty() {
        return Err(AppError::ConfigLoad(format!("'{}' is empty", path.display())));
    }
    let doc: Doc = serde_yaml::from_str(&raw)
        .map_err(|e| AppError::ConfigLoad(format!("parsing '{}': {e}", path.display())))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    inline_files(doc, base_dir)
}

fn write_yaml(path: &Path, doc: &Doc) -> Result<(), AppError> {
    let yaml = serde_yaml::to_string(doc)
        .map_err(|e| AppError::ConfigApply(format!("serializing document: {e}")))?;
    std::fs::write(path, yaml)
        .map_err(|e| AppError::ConfigApply(format!("writing '{}': {e}", path.display())))
}

/// `write_exclusive(path, doc)`: atomic create-new-or-fail write, used for
/// the `prepare` file during 2PC. Fails if the file already exists.
pub fn write_exclusive(path: &Path, doc: &Doc) -> Result<(), AppError> {
    let yaml = serde_yaml::to_string(doc)
        .map_err(|e| AppError::ConfigApply(format!("serializing document: {e}")))?;
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| AppError::ConfigApply(format!("creating '{}': {e}", path.display())))?;
    file.write_all(yaml.as_bytes())
        .map_err(|e| AppError::ConfigApply(format!("writing '{}': {e}", path.display())))
}

/// `promote(prepare_path, active_path, backup_path)`: best-effort backup via
/// hardlink, then atomic rename of `prepare` onto `active`.
pub fn promote(prepare_path: &Path, active_path: &Path, backup_path: &Path) -> Result<(), AppError> {
    let _ = std::fs::remove_file(backup_path);
    if active_path.exists() {
        if let Err(e) = std::fs::hard_link(active_path, backup_path) {
            warn!("failed to hard-link backup config: {e}");
        }
    }
    std::fs::rename(prepare_path, active_path)
        .map_err(|e| AppError::ConfigApply(format!("promoting prepared config: {e}")))
}

/// `unlink(prepare_path)`: idempotent removal.
pub fn unlink(path: &Path) -> Result<(), AppError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AppError::ConfigApply(format!(
            "unlinking '{}': {e}",
            path.display()
        ))),
    }
}

/// Persists a document as the active config (used after a round finishes on
/// this instance, e.g. for bootstrap via peer fetch, outside the 2PC path).
pub fn save_active(workdir: &Path, doc: &Doc) -> Result<(), AppError> {
    write_yaml(&active_path(workdir), doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn load_round_trips_without_file_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        let doc: Doc = serde_yaml::from_str("topology:\n  servers: {}\n  replicasets: {}\n  failover: false\nvshard:\n  bucket_count: 10\n  bootstrapped: false\n").unwrap();
        write_yaml(&path, &doc).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn load_fails_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("missing.yml")).unwrap_err();
        assert!(matches!(err, AppError::ConfigLoad(_)));
    }

    #[test]
    fn load_fails_on_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(err, AppError::ConfigLoad(_)));
    }

    #[test]
    fn write_exclusive_fails_if_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepare_path(dir.path());
        let doc: Doc = serde_yaml::from_str("a: 1\n").unwrap();
        write_exclusive(&path, &doc).unwrap();
        assert!(write_exclusive(&path, &doc).is_err());
    }

    #[test]
    fn promote_moves_prepare_over_active_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let active = active_path(dir.path());
        let prepare = prepare_path(dir.path());
        let backup = backup_path(dir.path());

        let old_doc: Doc = serde_yaml::from_str("a: 1\n").unwrap();
        write_yaml(&active, &old_doc).unwrap();
        let new_doc: Doc = serde_yaml::from_str("a: 2\n").unwrap();
        write_exclusive(&prepare, &new_doc).unwrap();

        promote(&prepare, &active, &backup).unwrap();

        assert!(!prepare.exists());
        assert_eq!(load(&active).unwrap(), new_doc);
        assert_eq!(load(&backup).unwrap(), old_doc);
    }

    #[test]
    fn unlink_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.yml");
        unlink(&path).unwrap();
        unlink(&path).unwrap();
    }
}
