//! Checksum validation for migrations
//!
//! Computes SHA256 checksums of migration logic to detect edits to
//! migrations that were already applied

use crate::migrations::model::MigrationStep;
use sha2::{Digest, Sha256};

/// Checksum over the fingerprints of both directions of a migration
pub fn migration_checksum(up: &MigrationStep, down: Option<&MigrationStep>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"up\0");
    hasher.update(up.fingerprint().as_bytes());
    if let Some(down) = down {
        hasher.update(b"\0down\0");
        hasher.update(down.fingerprint().as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_checksum_covers_down() {
        let up = MigrationStep::sql("CREATE TABLE t (id INTEGER)");
        let down_a = MigrationStep::sql("DROP TABLE t");
        let down_b = MigrationStep::sql("DROP TABLE IF EXISTS t");

        let without = migration_checksum(&up, None);
        let with_a = migration_checksum(&up, Some(&down_a));
        let with_b = migration_checksum(&up, Some(&down_b));

        assert_eq!(with_a.len(), 64); // SHA256 is 64 hex chars
        assert_ne!(without, with_a);
        assert_ne!(with_a, with_b);
        assert_eq!(with_a, migration_checksum(&up, Some(&down_a)));
    }

    #[test]
    fn test_migration_checksum_changes_with_up() {
        let a = MigrationStep::sql("CREATE TABLE t (id INTEGER)");
        let b = MigrationStep::sql("CREATE TABLE t (id INTEGER, name TEXT)");
        assert_ne!(migration_checksum(&a, None), migration_checksum(&b, None));
    }
}
