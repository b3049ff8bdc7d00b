//! Registrar lifecycle tests against in-memory collaborators.
//!
//! Verifies the registration and reconciliation behavior end to end:
//!
//! 1. Registration publishes the deduplicated union of local addresses
//! 2. Reconciliation is idempotent while the topology is unchanged
//! 3. Seed loading skips and purges entries older than the cutoff
//! 4. Seed loading purges this host's previous-run entries but keeps peers
//! 5. The configured initial members back up an empty registry
//! 6. Departed members are overwritten out of the canonical list
//! 7. Foreign addresses are overwritten out of the canonical list
//! 8. Two processes bootstrap off each other through a shared registry

mod common;

use std::sync::Arc;

use common::{addr, make_registrar, test_config, ScriptedRuntime};
use member_rendezvous::{
    registry::current_time_ms, FailureCleanup, MemberInfo, MemberRegistry, MemoryLock,
    MemoryRegistry, ReconcileOutcome, RegistrationId, RegistrationState, RegistryKey,
    RegistryValue, MEMBER_NAMESPACE,
};
use uuid::Uuid;

fn collaborators() -> (Arc<MemoryRegistry>, Arc<MemoryLock>) {
    (Arc::new(MemoryRegistry::new()), Arc::new(MemoryLock::new()))
}

async fn canonical_addresses(registry: &MemoryRegistry) -> Vec<String> {
    let key = RegistryKey::canonical(MEMBER_NAMESPACE, "main");
    let value = registry
        .get(&key)
        .await
        .expect("registry get")
        .expect("canonical list present");
    value.addresses().map(str::to_owned).collect()
}

#[tokio::test]
async fn test_register_publishes_deduplicated_union() {
    let (registry, lock) = collaborators();
    let runtime = ScriptedRuntime::new(vec![
        addr("10.0.0.1:47500"),
        addr("10.0.0.1:47500"),
        addr("192.168.0.9:47500"),
    ]);
    let registrar = make_registrar(test_config(), &registry, &lock, &runtime);

    let mut cleanup = FailureCleanup::new();
    let id = registrar
        .register_addresses(&mut cleanup)
        .await
        .expect("registration");

    assert_eq!(registrar.registration_state(), RegistrationState::Registered(id));
    assert_eq!(registry.len(), 1);

    let key = RegistryKey::entry(MEMBER_NAMESPACE, "main", id);
    let value = registry
        .get(&key)
        .await
        .expect("registry get")
        .expect("entry present");
    let published: Vec<&str> = value.addresses().collect();
    assert_eq!(published, vec!["10.0.0.1:47500", "192.168.0.9:47500"]);
}

#[tokio::test]
async fn test_reconcile_is_idempotent_without_topology_change() {
    let (registry, lock) = collaborators();
    let runtime = ScriptedRuntime::new(vec![addr("10.0.0.1:47500")]);
    runtime.set_members(vec![
        MemberInfo::new(1, vec![addr("10.0.0.1:47500")]),
        MemberInfo::new(2, vec![addr("10.0.0.2:47500")]),
    ]);
    let registrar = make_registrar(test_config(), &registry, &lock, &runtime);

    let first = registrar.reconcile().await.expect("first reconcile");
    assert_eq!(first, ReconcileOutcome::Written);
    let writes_after_first = registry.write_count();

    let second = registrar.reconcile().await.expect("second reconcile");
    assert_eq!(second, ReconcileOutcome::Unchanged);
    assert_eq!(registry.write_count(), writes_after_first);

    assert_eq!(
        canonical_addresses(&registry).await,
        vec!["10.0.0.1:47500", "10.0.0.2:47500"]
    );
}

#[tokio::test]
async fn test_seed_loading_skips_and_purges_expired_entries() {
    let (registry, lock) = collaborators();

    // Default cutoff is 30 days.
    const CUTOFF_MS: u64 = 30 * 24 * 60 * 60 * 1000;
    let now = current_time_ms();
    let expired = RegistrationId::from_parts(now.saturating_sub(CUTOFF_MS + 1), Uuid::new_v4());
    let fresh = RegistrationId::from_parts(now, Uuid::new_v4());
    registry
        .set(
            RegistryKey::entry(MEMBER_NAMESPACE, "main", expired),
            RegistryValue::Single("10.0.0.7:47500".to_string()),
        )
        .await
        .expect("seed expired entry");
    registry
        .set(
            RegistryKey::entry(MEMBER_NAMESPACE, "main", fresh),
            RegistryValue::Single("10.0.0.8:47500".to_string()),
        )
        .await
        .expect("seed fresh entry");

    let runtime = ScriptedRuntime::new(vec![addr("10.0.0.1:47500")]);
    let registrar = make_registrar(test_config(), &registry, &lock, &runtime);

    let seeds = registrar
        .initialize_seed_addresses()
        .await
        .expect("seed load");
    assert_eq!(seeds, vec![addr("10.0.0.8:47500")]);

    // The expired entry is gone from the registry, not just filtered out.
    assert_eq!(registry.len(), 1);
    let removed = registry
        .get(&RegistryKey::entry(MEMBER_NAMESPACE, "main", expired))
        .await
        .expect("registry get");
    assert!(removed.is_none());
}

#[tokio::test]
async fn test_seed_loading_purges_own_previous_run_but_keeps_peers() {
    let (registry, lock) = collaborators();

    let now = current_time_ms();
    let previous_run = RegistrationId::from_parts(now.saturating_sub(60_000), Uuid::new_v4());
    let peer = RegistrationId::from_parts(now, Uuid::new_v4());
    registry
        .set(
            RegistryKey::entry(MEMBER_NAMESPACE, "main", previous_run),
            RegistryValue::Single("10.0.0.2:47500".to_string()),
        )
        .await
        .expect("seed previous-run entry");
    registry
        .set(
            RegistryKey::entry(MEMBER_NAMESPACE, "main", peer),
            RegistryValue::Single("10.0.0.1:47500".to_string()),
        )
        .await
        .expect("seed peer entry");

    // This process advertises the same address the previous run registered.
    let runtime = ScriptedRuntime::new(vec![addr("10.0.0.2:47500")]);
    let registrar = make_registrar(test_config(), &registry, &lock, &runtime);

    let seeds = registrar
        .initialize_seed_addresses()
        .await
        .expect("seed load");
    assert_eq!(seeds, vec![addr("10.0.0.1:47500")]);

    // The peer's entry survives: a freshly crashed or running peer must stay
    // discoverable until the cutoff retires it.
    assert_eq!(registry.len(), 1);
    let kept = registry
        .get(&RegistryKey::entry(MEMBER_NAMESPACE, "main", peer))
        .await
        .expect("registry get");
    assert!(kept.is_some());
}

#[tokio::test]
async fn test_initial_members_back_up_an_empty_registry() {
    let (registry, lock) = collaborators();
    let runtime = ScriptedRuntime::new(vec![addr("10.0.0.1:47500")]);
    let config = test_config().with_initial_members("10.1.0.1:47500, 10.1.0.2:47500");
    let registrar = make_registrar(config, &registry, &lock, &runtime);

    let seeds = registrar
        .initialize_seed_addresses()
        .await
        .expect("seed load");
    assert_eq!(seeds, vec![addr("10.1.0.1:47500"), addr("10.1.0.2:47500")]);
}

#[tokio::test]
async fn test_departed_member_addresses_are_overwritten() {
    let (registry, lock) = collaborators();
    let runtime = ScriptedRuntime::new(vec![addr("10.0.0.1:47500")]);
    runtime.set_members(vec![
        MemberInfo::new(1, vec![addr("10.0.0.1:47500")]),
        MemberInfo::new(2, vec![addr("10.0.0.2:47500")]),
        MemberInfo::new(3, vec![addr("10.0.0.3:47500")]),
    ]);
    let registrar = make_registrar(test_config(), &registry, &lock, &runtime);

    assert_eq!(
        registrar.reconcile().await.expect("first reconcile"),
        ReconcileOutcome::Written
    );
    assert_eq!(
        canonical_addresses(&registry).await,
        vec!["10.0.0.1:47500", "10.0.0.2:47500", "10.0.0.3:47500"]
    );

    // Member 3 leaves: the runtime drops it and the listener path records
    // the departure so its addresses count as obsolete, not foreign.
    runtime.remove_member(3);
    registrar.record_member_departure(&3);

    assert_eq!(
        registrar.reconcile().await.expect("reconcile after leave"),
        ReconcileOutcome::Written
    );
    assert_eq!(
        canonical_addresses(&registry).await,
        vec!["10.0.0.1:47500", "10.0.0.2:47500"]
    );

    // The exclusion was consumed; nothing is left to write.
    assert_eq!(
        registrar.reconcile().await.expect("third reconcile"),
        ReconcileOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_foreign_addresses_are_overwritten() {
    let (registry, lock) = collaborators();

    // A canonical list left behind by some other grid.
    registry
        .set(
            RegistryKey::canonical(MEMBER_NAMESPACE, "main"),
            RegistryValue::List(vec![
                "10.0.0.1:47500".to_string(),
                "10.0.0.2:47500".to_string(),
                "172.16.0.99:47500".to_string(),
            ]),
        )
        .await
        .expect("seed canonical list");

    let runtime = ScriptedRuntime::new(vec![addr("10.0.0.1:47500")]);
    runtime.set_members(vec![
        MemberInfo::new(1, vec![addr("10.0.0.1:47500")]),
        MemberInfo::new(2, vec![addr("10.0.0.2:47500")]),
    ]);
    let registrar = make_registrar(test_config(), &registry, &lock, &runtime);

    assert_eq!(
        registrar.reconcile().await.expect("reconcile"),
        ReconcileOutcome::Written
    );
    assert_eq!(
        canonical_addresses(&registry).await,
        vec!["10.0.0.1:47500", "10.0.0.2:47500"]
    );
}

#[tokio::test]
async fn test_two_processes_bootstrap_off_each_other() {
    let (registry, lock) = collaborators();

    // Process A comes up on an empty registry and registers itself.
    let runtime_a = ScriptedRuntime::new(vec![addr("10.0.0.1:47500")]);
    let registrar_a = make_registrar(test_config(), &registry, &lock, &runtime_a);
    assert!(registrar_a
        .initialize_seed_addresses()
        .await
        .expect("A seed load")
        .is_empty());
    let mut cleanup = FailureCleanup::new();
    registrar_a
        .register_addresses(&mut cleanup)
        .await
        .expect("A registration");

    // Process B boots later and discovers A through the shared registry.
    let runtime_b = ScriptedRuntime::new(vec![addr("10.0.0.2:47500")]);
    let registrar_b = make_registrar(test_config(), &registry, &lock, &runtime_b);
    let seeds = registrar_b
        .initialize_seed_addresses()
        .await
        .expect("B seed load");
    assert_eq!(seeds, vec![addr("10.0.0.1:47500")]);
    registrar_b
        .register_addresses(&mut cleanup)
        .await
        .expect("B registration");

    // Once both are in the topology, either side's reconcile produces the
    // same canonical list.
    for runtime in [&runtime_a, &runtime_b] {
        runtime.set_members(vec![
            MemberInfo::new(1, vec![addr("10.0.0.1:47500")]),
            MemberInfo::new(2, vec![addr("10.0.0.2:47500")]),
        ]);
    }
    registrar_a.reconcile().await.expect("A reconcile");
    assert_eq!(
        registrar_b.reconcile().await.expect("B reconcile"),
        ReconcileOutcome::Unchanged
    );
    assert_eq!(
        canonical_addresses(&registry).await,
        vec!["10.0.0.1:47500", "10.0.0.2:47500"]
    );
}

#[tokio::test]
async fn test_refresh_and_shutdown_lifecycle() {
    let (registry, lock) = collaborators();
    let runtime = ScriptedRuntime::new(vec![addr("10.0.0.1:47500")]);
    let registrar = make_registrar(test_config(), &registry, &lock, &runtime);

    let mut cleanup = FailureCleanup::new();
    let original = registrar
        .register_addresses(&mut cleanup)
        .await
        .expect("registration");

    // Ids are millisecond-stamped; step past the original's millisecond so
    // the refreshed id is distinguishable.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    registrar
        .refresh_address_registration()
        .await
        .expect("refresh");

    // The refresh retired the original entry and left exactly one, newer.
    assert_eq!(registry.len(), 1);
    let old = registry
        .get(&RegistryKey::entry(MEMBER_NAMESPACE, "main", original))
        .await
        .expect("registry get");
    assert!(old.is_none());

    registrar
        .remove_address_registrations()
        .await
        .expect("deregistration");
    assert_eq!(registrar.registration_state(), RegistrationState::Deregistered);
    assert_eq!(registry.len(), 0);

    // A refresh timer firing during shutdown must not resurrect the entry.
    registrar
        .refresh_address_registration()
        .await
        .expect("post-shutdown refresh");
    assert_eq!(registry.len(), 0);
}
