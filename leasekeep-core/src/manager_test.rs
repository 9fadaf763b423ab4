#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::config::{KeySource, LeaseConfig};
    use crate::error::{LeaseError, StoreError};
    use crate::infrastructure::{Mutation, Precondition, ReclaimQueue, ResourceStore};
    use crate::infrastructure_in_memory::InMemoryStore;
    use crate::manager::LeaseManager;
    use crate::types::{Acquisition, ReclaimJob};

    const WAIT: Duration = Duration::from_secs(5);

    // =========================================================================
    // Helpers
    // =========================================================================

    fn config() -> LeaseConfig {
        LeaseConfig {
            contention_wait: WAIT,
            ..LeaseConfig::default()
        }
    }

    fn create_manager(config: LeaseConfig) -> (LeaseManager, ManualClock) {
        let store = Arc::new(InMemoryStore::with_resources(["R1", "R2", "R3"]));
        let clock = ManualClock::new(1_000_000);
        let manager = LeaseManager::new(store.clone(), store, Arc::new(clock.clone()), config);
        (manager, clock)
    }

    fn threaded_manager(wait: Duration) -> Arc<LeaseManager> {
        let store = Arc::new(InMemoryStore::with_resources(["R1"]));
        let config = LeaseConfig {
            contention_wait: wait,
            ..LeaseConfig::default()
        };
        Arc::new(LeaseManager::new(store.clone(), store, Arc::new(SystemClock), config))
    }

    fn assert_invariants(manager: &LeaseManager) {
        for r in manager.resources().unwrap() {
            assert!(r.is_consistent(), "inconsistent resource: {:?}", r);
        }
    }

    /// A queue that refuses every write.
    struct BrokenQueue;

    impl ReclaimQueue for BrokenQueue {
        fn enqueue(&self, _: &Acquisition, _: u64) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("queue down".to_string()))
        }
        fn due(&self, _: u64, _: usize) -> Result<Vec<ReclaimJob>, StoreError> {
            Ok(Vec::new())
        }
        fn complete(&self, _: u64) -> Result<(), StoreError> {
            Ok(())
        }
        fn retry(&self, _: u64, _: u64, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn bury(&self, _: u64, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn dead(&self) -> Result<Vec<ReclaimJob>, StoreError> {
            Ok(Vec::new())
        }
        fn pending_count(&self) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    // =========================================================================
    // Acquire
    // =========================================================================

    #[test]
    fn test_acquire_free_without_period() {
        let (manager, clock) = create_manager(config());

        let grant = manager.acquire("R1", None, Some("1111111111")).unwrap();
        assert_eq!(grant.key, "1111111111");
        assert_eq!(grant.acquired_at, clock.now_ms());
        assert_eq!(grant.expires_at, None);

        let r = manager.resource("R1").unwrap();
        assert!(r.is_held());
        assert_eq!(r.period_ms, None);
        assert_eq!(manager.pending_reclaims().unwrap(), 0);
        assert_invariants(&manager);
    }

    #[test]
    fn test_acquire_unknown_resource() {
        let (manager, _) = create_manager(config());
        assert!(matches!(
            manager.acquire("R9", Some(5000), Some("1111111111")),
            Err(LeaseError::NotFound(_))
        ));
    }

    #[test]
    fn test_reclaim_never_before_period() {
        let (manager, clock) = create_manager(config());
        manager.acquire("R1", Some(5000), Some("1111111111")).unwrap();
        assert_eq!(manager.pending_reclaims().unwrap(), 1);

        clock.advance(Duration::from_millis(4999));
        assert_eq!(manager.reclaim_due().unwrap().reclaimed, 0);
        assert!(manager.resource("R1").unwrap().is_held());

        clock.advance(Duration::from_millis(1));
        assert_eq!(manager.reclaim_due().unwrap().reclaimed, 1);
        assert!(!manager.resource("R1").unwrap().is_held());
        assert_eq!(manager.pending_reclaims().unwrap(), 0);
        assert_invariants(&manager);
    }

    #[test]
    fn test_held_resource_is_contended_after_single_wait() {
        let (manager, clock) = create_manager(config());
        manager.acquire("R1", Some(5000), Some("1111111111")).unwrap();

        let before = clock.now_ms();
        let result = manager.acquire("R1", Some(5000), Some("2222222222"));
        assert!(matches!(result, Err(LeaseError::Contended(_))));
        // Exactly one wait, no retry loop
        assert_eq!(clock.now_ms() - before, WAIT.as_millis() as u64);
        assert_eq!(
            manager.resource("R1").unwrap().key.as_deref(),
            Some("1111111111")
        );

        // After the period the reclaim frees it and a third caller wins
        manager.reclaim_due().unwrap();
        let grant = manager.acquire("R1", Some(5000), Some("3333333333")).unwrap();
        assert_eq!(grant.key, "3333333333");
        assert_invariants(&manager);
    }

    #[test]
    fn test_acquire_after_expiry_needs_no_wait() {
        let (manager, clock) = create_manager(config());
        manager.acquire("R1", Some(1000), Some("1111111111")).unwrap();

        clock.advance(Duration::from_millis(1000));
        manager.reclaim_due().unwrap();

        let before = clock.now_ms();
        manager.acquire("R1", None, Some("2222222222")).unwrap();
        assert_eq!(clock.now_ms(), before);
    }

    #[test]
    fn test_duplicate_key_rejected_without_waiting() {
        let (manager, clock) = create_manager(config());
        manager.acquire("R2", Some(5000), Some("1111111111")).unwrap();

        let before = clock.now_ms();
        let result = manager.acquire("R1", Some(5000), Some("1111111111"));
        match result {
            Err(LeaseError::DuplicateKey { holder }) => assert_eq!(holder, "R2"),
            other => panic!("Expected DuplicateKey, got {:?}", other),
        }
        assert_eq!(clock.now_ms(), before);
        assert!(!manager.resource("R1").unwrap().is_held());
    }

    #[test]
    fn test_reacquire_with_own_key_is_contention() {
        let (manager, _) = create_manager(config());
        manager.acquire("R1", None, Some("1111111111")).unwrap();
        assert!(matches!(
            manager.acquire("R1", None, Some("1111111111")),
            Err(LeaseError::Contended(_))
        ));
    }

    #[test]
    fn test_key_reusable_after_release() {
        let (manager, _) = create_manager(config());
        manager.acquire("R1", None, Some("1111111111")).unwrap();
        manager.release("R1", "1111111111").unwrap();
        manager.acquire("R2", None, Some("1111111111")).unwrap();
    }

    #[test]
    fn test_invalid_requests() {
        let (manager, _) = create_manager(config());
        for result in [
            manager.acquire("R1", Some(0), Some("1111111111")),
            manager.acquire("R1", None, None),
            manager.acquire("R1", None, Some("short")),
            manager.acquire("R1", None, Some("much-too-long-key")),
        ] {
            assert!(matches!(result, Err(LeaseError::InvalidRequest(_))));
        }
        assert!(!manager.resource("R1").unwrap().is_held());
    }

    #[test]
    fn test_server_generated_keys() {
        let (manager, _) = create_manager(LeaseConfig {
            key_source: KeySource::ServerGenerated,
            ..config()
        });

        let a = manager.acquire("R1", None, None).unwrap();
        let b = manager.acquire("R2", None, None).unwrap();
        assert_eq!(a.key.len(), 10);
        assert!(a.key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a.key, b.key);

        assert!(matches!(
            manager.acquire("R3", None, Some("1111111111")),
            Err(LeaseError::InvalidRequest(_))
        ));

        manager.release("R1", &a.key).unwrap();
        assert_invariants(&manager);
    }

    #[test]
    fn test_failed_scheduling_reverts_the_grant() {
        let store = Arc::new(InMemoryStore::with_resources(["R1"]));
        let manager = LeaseManager::new(
            store,
            Arc::new(BrokenQueue),
            Arc::new(ManualClock::new(0)),
            config(),
        );

        let result = manager.acquire("R1", Some(1000), Some("1111111111"));
        assert!(matches!(result, Err(LeaseError::Internal(_))));
        assert!(!manager.resource("R1").unwrap().is_held());
        assert!(manager.holder_of("1111111111").unwrap().is_none());

        // Unbounded leases never touch the queue
        manager.acquire("R1", None, Some("1111111111")).unwrap();
    }

    // =========================================================================
    // Release
    // =========================================================================

    #[test]
    fn test_release_outcomes() {
        let (manager, _) = create_manager(config());
        manager.acquire("R1", Some(5000), Some("1111111111")).unwrap();
        let held = manager.resource("R1").unwrap();

        assert!(matches!(
            manager.release("R1", "2222222222"),
            Err(LeaseError::Unauthorized(_))
        ));
        assert_eq!(manager.resource("R1").unwrap(), held);

        assert!(matches!(
            manager.release("R9", "1111111111"),
            Err(LeaseError::NotFound(_))
        ));

        manager.release("R1", "1111111111").unwrap();
        assert!(!manager.resource("R1").unwrap().is_held());

        assert!(matches!(
            manager.release("R1", "1111111111"),
            Err(LeaseError::AlreadyFree(_))
        ));
        assert!(!manager.resource("R1").unwrap().is_held());
        assert_invariants(&manager);
    }

    #[test]
    fn test_stale_reclaim_does_not_touch_new_holder() {
        let (manager, clock) = create_manager(config());
        manager.acquire("R1", Some(1000), Some("1111111111")).unwrap();
        manager.release("R1", "1111111111").unwrap();

        clock.advance(Duration::from_millis(10));
        manager.acquire("R1", None, Some("2222222222")).unwrap();

        clock.advance(Duration::from_millis(2000));
        let report = manager.reclaim_due().unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.reclaimed, 0);

        let r = manager.resource("R1").unwrap();
        assert_eq!(r.key.as_deref(), Some("2222222222"));
        assert_invariants(&manager);
    }

    #[test]
    fn test_stale_reclaim_ignores_reacquire_with_same_key() {
        let (manager, clock) = create_manager(config());
        manager.acquire("R1", Some(1000), Some("1111111111")).unwrap();
        manager.release("R1", "1111111111").unwrap();

        clock.advance(Duration::from_millis(10));
        manager.acquire("R1", None, Some("1111111111")).unwrap();

        clock.advance(Duration::from_millis(2000));
        assert_eq!(manager.reclaim_due().unwrap().stale, 1);
        assert!(manager.resource("R1").unwrap().is_held());
    }

    #[test]
    fn test_reacquire_in_same_instant_keeps_its_own_period() {
        let (manager, clock) = create_manager(config());
        manager.acquire("R1", Some(1000), Some("1111111111")).unwrap();
        manager.release("R1", "1111111111").unwrap();
        // Same key, same millisecond, longer period
        manager.acquire("R1", Some(60_000), Some("1111111111")).unwrap();
        assert_eq!(manager.pending_reclaims().unwrap(), 2);

        clock.advance(Duration::from_millis(1000));
        let report = manager.reclaim_due().unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.reclaimed, 0);
        assert!(manager.resource("R1").unwrap().is_held());

        clock.advance(Duration::from_millis(59_000));
        assert_eq!(manager.reclaim_due().unwrap().reclaimed, 1);
        assert!(!manager.resource("R1").unwrap().is_held());
        assert_invariants(&manager);
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    #[test]
    fn test_recover_schedules_is_idempotent() {
        let store = Arc::new(InMemoryStore::with_resources(["R1", "R2"]));
        // A lease granted by an earlier process that never stored its reclaim
        store
            .transactional_update(
                "R1",
                &Precondition::Free { unique_key: None },
                &Mutation::Acquire {
                    acquired_at: 100,
                    period_ms: Some(500),
                    key: "1111111111",
                },
            )
            .unwrap();

        let clock = ManualClock::new(1000);
        let manager =
            LeaseManager::new(store.clone(), store, Arc::new(clock.clone()), config());

        assert_eq!(manager.recover_schedules().unwrap(), 1);
        assert_eq!(manager.recover_schedules().unwrap(), 1);
        assert_eq!(manager.pending_reclaims().unwrap(), 1);

        assert_eq!(manager.reclaim_due().unwrap().reclaimed, 1);
        assert!(!manager.resource("R1").unwrap().is_held());
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    #[test]
    fn test_concurrent_acquire_has_single_winner() {
        let manager = threaded_manager(Duration::from_millis(10));
        let callers = 8;
        let barrier = Arc::new(Barrier::new(callers));

        let handles: Vec<_> = (0..callers)
            .map(|i| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let key = format!("{:0>10}", i);
                    barrier.wait();
                    manager.acquire("R1", None, Some(&key))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LeaseError::Contended(_))));
        assert_invariants(&manager);
    }

    #[test]
    fn test_concurrent_acquire_same_key_has_single_winner() {
        let store = Arc::new(InMemoryStore::with_resources(["R1", "R2"]));
        let config = LeaseConfig {
            contention_wait: Duration::from_millis(10),
            ..LeaseConfig::default()
        };
        let manager = Arc::new(LeaseManager::new(
            store.clone(),
            store,
            Arc::new(SystemClock),
            config,
        ));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["R1", "R2"]
            .into_iter()
            .map(|name| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    manager.acquire(name, None, Some("1111111111"))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LeaseError::DuplicateKey { .. })));
    }

    #[test]
    fn test_release_during_wait_lets_waiter_in() {
        let manager = threaded_manager(Duration::from_millis(500));
        manager.acquire("R1", None, Some("1111111111")).unwrap();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.acquire("R1", None, Some("2222222222")))
        };

        thread::sleep(Duration::from_millis(50));
        manager.release("R1", "1111111111").unwrap();

        let grant = waiter.join().unwrap().unwrap();
        assert_eq!(grant.key, "2222222222");
    }

    // =========================================================================
    // Durability
    // =========================================================================

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_reclaim_survives_restart() {
        use crate::infrastructure_sqlite::SqliteStore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.db");
        let path = path.to_str().unwrap();
        let clock = ManualClock::new(1_000_000);

        let open = |clock: &ManualClock| {
            let store = Arc::new(SqliteStore::open(path).unwrap());
            store.provision("R1").unwrap();
            LeaseManager::new(store.clone(), store, Arc::new(clock.clone()), config())
        };

        {
            let manager = open(&clock);
            manager.acquire("R1", Some(5000), Some("1111111111")).unwrap();
        }

        let manager = open(&clock);
        assert!(manager.resource("R1").unwrap().is_held());
        assert_eq!(manager.pending_reclaims().unwrap(), 1);

        clock.advance(Duration::from_millis(5000));
        assert_eq!(manager.reclaim_due().unwrap().reclaimed, 1);
        assert!(!manager.resource("R1").unwrap().is_held());
        assert_invariants(&manager);
    }
}
