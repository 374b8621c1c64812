// Property tests for dependency ordering

use proptest::prelude::*;
use std::collections::HashMap;
use ticketlens_store::migrations::{sql_migration, MigrationRunner};

// Node i may only depend on nodes < i, so every generated graph is acyclic
fn dag_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..12).prop_flat_map(|n| {
        (0..n)
            .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(3)))
            .collect::<Vec<_>>()
            .prop_map(|deps| {
                deps.into_iter()
                    .enumerate()
                    .map(|(i, d)| d.into_iter().filter(|&j| j < i).collect())
                    .collect()
            })
    })
}

fn build_runner(deps: &[Vec<usize>], registration: &[usize]) -> MigrationRunner {
    let migrations = registration
        .iter()
        .map(|&i| {
            sql_migration(&format!("{:03}", i), "generated", "SELECT 1", "SELECT 1")
                .depends_on(deps[i].iter().map(|j| format!("{:03}", j)))
        })
        .collect();
    MigrationRunner::new(migrations)
}

proptest! {
    #[test]
    fn prop_dependencies_precede_dependents(
        (deps, registration) in dag_strategy().prop_flat_map(|deps| {
            let order: Vec<usize> = (0..deps.len()).collect();
            (Just(deps), Just(order).prop_shuffle())
        })
    ) {
        let runner = build_runner(&deps, &registration);
        let sorted = runner.sort_by_dependencies().unwrap();

        prop_assert_eq!(sorted.len(), deps.len());
        let position: HashMap<&str, usize> = sorted
            .iter()
            .enumerate()
            .map(|(pos, m)| (m.version.as_str(), pos))
            .collect();
        for migration in &sorted {
            for dep in &migration.dependencies {
                prop_assert!(position[dep.as_str()] < position[migration.version.as_str()]);
            }
        }
    }

    #[test]
    fn prop_independent_migrations_keep_registration_order(
        registration in Just((0usize..10).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let deps = vec![Vec::new(); registration.len()];
        let runner = build_runner(&deps, &registration);
        let sorted: Vec<String> = runner
            .sort_by_dependencies()
            .unwrap()
            .into_iter()
            .map(|m| m.version.clone())
            .collect();

        let expected: Vec<String> = registration.iter().map(|i| format!("{:03}", i)).collect();
        prop_assert_eq!(sorted, expected);
    }

    #[test]
    fn prop_sort_is_deterministic(deps in dag_strategy()) {
        let registration: Vec<usize> = (0..deps.len()).collect();
        let first = build_runner(&deps, &registration);
        let second = build_runner(&deps, &registration);

        let a: Vec<_> = first.sort_by_dependencies().unwrap().iter().map(|m| m.version.clone()).collect();
        let b: Vec<_> = second.sort_by_dependencies().unwrap().iter().map(|m| m.version.clone()).collect();
        prop_assert_eq!(a, b);
    }
}
