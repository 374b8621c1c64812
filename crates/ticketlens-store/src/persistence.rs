//! File snapshots of the working copy
//!
//! Uses temp→rename so a crash mid-save never leaves a partial database file.

use crate::db::copy_database;
use crate::errors::StoreError;
use chrono::{DateTime, Local};
use rusqlite::Connection;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Atomically write the contents of `conn` to `target`
pub fn write_snapshot(conn: &Connection, target: &Path) -> Result<(), StoreError> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = with_suffix(target, "tmp");
    if temp_path.exists() {
        fs::remove_file(&temp_path)?;
    }

    let written = write_to(conn, &temp_path);
    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    fs::rename(&temp_path, target)?;
    Ok(())
}

fn write_to(conn: &Connection, path: &Path) -> Result<(), StoreError> {
    let mut dst = Connection::open(path)?;
    copy_database(conn, &mut dst)?;
    dst.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
    Ok(())
}

/// Copy a database file byte for byte
pub fn copy_file(src: &Path, dst: &Path) -> Result<(), StoreError> {
    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::copy(src, dst)?;
    Ok(())
}

/// `<file>.<YYYYmmddHHMMSS>.bak` next to the database file
pub fn default_backup_path(path: &Path) -> PathBuf {
    backup_path_at(path, Local::now())
}

pub fn backup_path_at(path: &Path, at: DateTime<Local>) -> PathBuf {
    let stamp = at.format("%Y%m%d%H%M%S").to_string();
    with_suffix(&with_suffix(path, &stamp), "bak")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
