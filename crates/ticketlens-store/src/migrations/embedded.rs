//! Embedded SQL migrations
//!
//! Migrations are embedded at compile time using include_str!

use crate::migrations::model::{Migration, MigrationStep};

struct Embedded {
    version: &'static str,
    description: &'static str,
    dependencies: &'static [&'static str],
    up: &'static str,
    down: &'static str,
}

const EMBEDDED: &[Embedded] = &[
    Embedded {
        version: "001",
        description: "Create tickets table",
        dependencies: &[],
        up: include_str!("../../migrations/001_tickets.up.sql"),
        down: include_str!("../../migrations/001_tickets.down.sql"),
    },
    Embedded {
        version: "002",
        description: "Create import batches and link tickets to them",
        dependencies: &["001"],
        up: include_str!("../../migrations/002_import_batches.up.sql"),
        down: include_str!("../../migrations/002_import_batches.down.sql"),
    },
    Embedded {
        version: "003",
        description: "Create business unit rules",
        dependencies: &["001"],
        up: include_str!("../../migrations/003_business_unit_rules.up.sql"),
        down: include_str!("../../migrations/003_business_unit_rules.down.sql"),
    },
    Embedded {
        version: "004",
        description: "Create status mappings",
        dependencies: &["001"],
        up: include_str!("../../migrations/004_status_mappings.up.sql"),
        down: include_str!("../../migrations/004_status_mappings.down.sql"),
    },
    Embedded {
        version: "005",
        description: "Create settings and saved date ranges",
        dependencies: &[],
        up: include_str!("../../migrations/005_settings.up.sql"),
        down: include_str!("../../migrations/005_settings.down.sql"),
    },
    Embedded {
        version: "006",
        description: "Add reporting indices on tickets",
        dependencies: &["001", "002"],
        up: include_str!("../../migrations/006_reporting_indices.up.sql"),
        down: include_str!("../../migrations/006_reporting_indices.down.sql"),
    },
];

/// The built-in ticket schema, in registration order
pub fn default_migrations() -> Vec<Migration> {
    EMBEDDED
        .iter()
        .map(|e| {
            Migration::new(e.version, e.description, MigrationStep::sql(e.up))
                .depends_on(e.dependencies.iter().copied())
                .with_down(MigrationStep::sql(e.down))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_embedded_migration_is_reversible() {
        let migrations = default_migrations();
        assert_eq!(migrations.len(), 6);
        assert!(migrations.iter().all(|m| m.down.is_some()));
    }

    #[test]
    fn test_embedded_versions_are_ordered() {
        let versions: Vec<_> = default_migrations()
            .into_iter()
            .map(|m| m.version)
            .collect();
        let mut sorted = versions.clone();
        sorted.sort();
        assert_eq!(versions, sorted);
    }
}
