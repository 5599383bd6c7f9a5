//! Integration tests for token tables
//!
//! These exercise the public registry API end to end against the in-memory
//! store, plus a wrapper store that fails selected calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use token_tables::storage::async_trait;
use token_tables::{
    MemoryStore, OwnershipKey, RegistryError, SessionToken, Store, StoreError, TablesConfig,
    TokenTables, TokenValue, TransitionToken,
};

fn setup() -> (Arc<MemoryStore>, TokenTables) {
    let store = Arc::new(MemoryStore::new());
    let tables = TokenTables::new(store.clone());
    (store, tables)
}

/// Delegates to a `MemoryStore` but can fail value writes and deletes or
/// stall reads
struct FlakyStore {
    inner: Arc<MemoryStore>,
    fail_value_writes: AtomicBool,
    fail_value_deletes: AtomicBool,
    stall_reads: AtomicBool,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_value_writes: AtomicBool::new(false),
            fail_value_deletes: AtomicBool::new(false),
            stall_reads: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn set_session_key_value(
        &self,
        session_token: &SessionToken,
        ownership_key: &OwnershipKey,
    ) -> Result<String, StoreError> {
        self.inner.set_session_key_value(session_token, ownership_key).await
    }

    async fn del_session_key_value(&self, session_token: &SessionToken) -> Result<bool, StoreError> {
        self.inner.del_session_key_value(session_token).await
    }

    async fn set_key_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.fail_value_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write rejected".to_string()));
        }
        self.inner.set_key_value(key, value).await
    }

    async fn get_key_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.stall_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.get_key_value(key).await
    }

    async fn del_key_value(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_value_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("delete rejected".to_string()));
        }
        self.inner.del_key_value(key).await
    }

    async fn check_hash(&self, hash: &str, ownership_key: &OwnershipKey) -> Result<bool, StoreError> {
        self.inner.check_hash(hash, ownership_key).await
    }
}

#[tokio::test]
async fn test_transfer_scenario() {
    let (_store, tables) = setup();
    let s1 = SessionToken::new("user+S1");
    let s2 = SessionToken::new("user+S2");
    let o1 = OwnershipKey::new("O1");
    let o2 = OwnershipKey::new("O2");
    let t1 = TransitionToken::new("T1");

    tables.add_session(&s1, &o1, None).await.unwrap();
    tables.add_transferable_token(&t1, "payload", &o1).await.unwrap();
    assert_eq!(tables.carried_tokens(&s1).await, vec![t1.clone()]);

    tables.add_session(&s2, &o2, None).await.unwrap();
    tables.transfer_token(&t1, &o1, &o2).await.unwrap();

    assert!(tables.carried_tokens(&s1).await.is_empty());
    assert_eq!(tables.carried_tokens(&s2).await, vec![t1.clone()]);
    assert_eq!(tables.from_token(&t1).await, Some(o2));
    assert_eq!(
        tables.transition_token_is_active(&t1).await.unwrap().as_deref(),
        Some("payload")
    );
}

#[tokio::test]
async fn test_active_session_only_for_owner() {
    let (_store, tables) = setup();
    let s = SessionToken::new("user+s1");
    let alice = OwnershipKey::new("alice");

    tables.add_session(&s, &alice, None).await.unwrap();

    assert_eq!(tables.active_session(&s, &alice).await.unwrap(), Some(true));
    assert_eq!(
        tables.active_session(&s, &OwnershipKey::new("mallory")).await.unwrap(),
        Some(false)
    );
    assert_eq!(
        tables
            .active_session(&SessionToken::new("user+unknown"), &alice)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_destroy_session_drops_bounded_tokens() {
    let (store, tables) = setup();
    let s = SessionToken::new("user+s1");
    let alice = OwnershipKey::new("alice");
    let bound = TransitionToken::new("bound");

    tables.add_session(&s, &alice, Some(&bound)).await.unwrap();
    assert_eq!(tables.from_token(&bound).await, Some(alice.clone()));

    tables.destroy_session(&s).await.unwrap();

    assert_eq!(tables.active_session(&s, &alice).await.unwrap(), None);
    assert_eq!(tables.from_token(&bound).await, None);
    assert_eq!(tables.transition_token_is_active(&bound).await.unwrap(), None);
    assert!(!store.contains_session(&s));
    assert!(!store.contains_value("bound"));
}

#[tokio::test]
async fn test_transfer_bounded_token_refused() {
    let (store, tables) = setup();
    let s1 = SessionToken::new("user+s1");
    let s2 = SessionToken::new("user+s2");
    let alice = OwnershipKey::new("alice");
    let bob = OwnershipKey::new("bob");
    let bound = TransitionToken::new("bound");

    tables.add_session(&s1, &alice, Some(&bound)).await.unwrap();
    tables.add_session(&s2, &bob, None).await.unwrap();

    let err = tables.transfer_token(&bound, &alice, &bob).await.unwrap_err();
    assert!(matches!(err, RegistryError::TokenNotCarried { .. }));
    assert!(err.is_precondition());

    assert_eq!(tables.bounded_tokens(&s1).await, vec![bound.clone()]);
    assert!(tables.carried_tokens(&s2).await.is_empty());
    assert_eq!(tables.from_token(&bound).await, Some(alice));
    assert_eq!(store.get_key_value("bound").await.unwrap().as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_transfer_precondition_order() {
    let (_store, tables) = setup();
    let alice = OwnershipKey::new("alice");
    let bob = OwnershipKey::new("bob");
    let ghost = OwnershipKey::new("ghost");
    let t = TransitionToken::new("t1");

    let err = tables.transfer_token(&t, &ghost, &bob).await.unwrap_err();
    assert!(matches!(err, RegistryError::UnknownYielderSession(_)));

    tables
        .add_session(&SessionToken::new("user+s1"), &alice, None)
        .await
        .unwrap();
    let err = tables.transfer_token(&t, &alice, &bob).await.unwrap_err();
    assert!(matches!(err, RegistryError::TokenNotCarried { .. }));

    tables.add_transferable_token(&t, "v", &alice).await.unwrap();
    let err = tables.transfer_token(&t, &alice, &bob).await.unwrap_err();
    assert!(matches!(err, RegistryError::UnknownReceiverSession(_)));
    assert_eq!(tables.from_token(&t).await, Some(alice));
}

#[tokio::test]
async fn test_value_survives_cache_eviction() {
    let (_store, tables) = setup();
    let t = TransitionToken::new("t1");

    tables
        .add_token(&t, TokenValue::Raw("persisted".to_string()))
        .await
        .unwrap();
    assert!(tables.evict_cached_values().await >= 1);
    assert_eq!(tables.stats().await.cached_values, 0);

    assert_eq!(
        tables.transition_token_is_active(&t).await.unwrap().as_deref(),
        Some("persisted")
    );
}

#[tokio::test]
async fn test_value_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let t = TransitionToken::new("t1");

    {
        let tables = TokenTables::new(store.clone());
        tables.add_token(&t, "persisted").await.unwrap();
    }

    let tables = TokenTables::new(store.clone());
    assert_eq!(
        tables.transition_token_is_active(&t).await.unwrap().as_deref(),
        Some("persisted")
    );
}

#[tokio::test]
async fn test_destroy_token_twice() {
    let (store, tables) = setup();
    let s = SessionToken::new("user+s1");
    let alice = OwnershipKey::new("alice");
    let t = TransitionToken::new("t1");

    tables.add_session(&s, &alice, None).await.unwrap();
    tables.add_transferable_token(&t, "v", &alice).await.unwrap();

    tables.destroy_token(&t).await.unwrap();
    let after_once = (
        tables.carried_tokens(&s).await,
        tables.from_token(&t).await,
        tables.token_is_transferable(&t).await,
        store.value_count(),
    );

    tables.destroy_token(&t).await.unwrap();
    let after_twice = (
        tables.carried_tokens(&s).await,
        tables.from_token(&t).await,
        tables.token_is_transferable(&t).await,
        store.value_count(),
    );

    assert_eq!(after_once, after_twice);
    assert!(after_once.0.is_empty());
    assert_eq!(after_once.1, None);
}

#[tokio::test]
async fn test_orphaned_token_adopted() {
    let (_store, tables) = setup();
    let s1 = SessionToken::new("user+s1");
    let s2 = SessionToken::new("user+s2");
    let alice = OwnershipKey::new("alice");
    let bob = OwnershipKey::new("bob");
    let t = TransitionToken::new("t1");

    tables.add_session(&s1, &alice, None).await.unwrap();
    tables.add_session(&s2, &bob, None).await.unwrap();
    tables.add_transferable_token(&t, "ticket", &alice).await.unwrap();

    let err = tables.adopt_token(&t, &bob).await.unwrap_err();
    assert!(matches!(err, RegistryError::TokenNotOrphaned(_)));

    tables.destroy_session(&s1).await.unwrap();
    assert_eq!(tables.list_unassigned_tokens().await, vec![t.clone()]);
    assert_eq!(tables.from_token(&t).await, None);
    assert_eq!(tables.transferable_info(&t).await.unwrap().owner, None);

    let err = tables
        .adopt_token(&t, &OwnershipKey::new("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnknownReceiverSession(_)));

    tables.adopt_token(&t, &bob).await.unwrap();
    assert!(tables.list_unassigned_tokens().await.is_empty());
    assert_eq!(tables.carried_tokens(&s2).await, vec![t.clone()]);
    assert_eq!(tables.from_token(&t).await, Some(bob));
    assert_eq!(
        tables.transition_token_is_active(&t).await.unwrap().as_deref(),
        Some("ticket")
    );
}

#[tokio::test]
async fn test_shared_session_reload() {
    let store = Arc::new(MemoryStore::new());
    let first = TokenTables::new(store.clone());
    let second = TokenTables::new(store.clone());
    let s = SessionToken::new("user+shared");
    let alice = OwnershipKey::new("alice");

    let hash = first.add_shared_session(&s, &alice, None).await.unwrap();

    assert!(!second
        .reload_session(&s, &OwnershipKey::new("mallory"), &hash)
        .await
        .unwrap());
    assert_eq!(second.owner_of_session(&s).await, None);

    assert!(second.reload_session(&s, &alice, &hash).await.unwrap());
    assert_eq!(second.session_for_owner(&alice).await, Some(s.clone()));
    assert_eq!(second.active_session(&s, &alice).await.unwrap(), Some(true));
    let left = second.session_time_left(&s).await.unwrap();
    assert!(left <= Duration::from_secs(3600));
    assert!(left > Duration::from_secs(3500));
}

#[tokio::test]
async fn test_unshared_session_not_reloadable() {
    let store = Arc::new(MemoryStore::new());
    let first = TokenTables::new(store.clone());
    let second = TokenTables::new(store.clone());
    let s = SessionToken::new("user+private");
    let alice = OwnershipKey::new("alice");

    first.add_session(&s, &alice, None).await.unwrap();
    let hash = store.set_session_key_value(&s, &alice).await.unwrap();

    assert!(!second.reload_session(&s, &alice, &hash).await.unwrap());
}

#[tokio::test]
async fn test_store_failure_leaves_tables_untouched() {
    let (store, tables) = setup();
    let s1 = SessionToken::new("user+s1");
    let s2 = SessionToken::new("user+s2");
    let alice = OwnershipKey::new("alice");
    let bob = OwnershipKey::new("bob");
    let t = TransitionToken::new("t1");

    tables.add_session(&s1, &alice, None).await.unwrap();
    tables.add_session(&s2, &bob, None).await.unwrap();
    tables.add_transferable_token(&t, "v", &alice).await.unwrap();

    store.set_offline(true);

    let err = tables
        .add_transferable_token(&TransitionToken::new("t2"), "w", &alice)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Store(_)));

    let err = tables.transfer_token(&t, &alice, &bob).await.unwrap_err();
    assert!(err.is_store_failure());

    store.set_offline(false);

    assert_eq!(tables.carried_tokens(&s1).await, vec![t.clone()]);
    assert!(tables.carried_tokens(&s2).await.is_empty());
    assert_eq!(tables.from_token(&t).await, Some(alice));
    assert_eq!(
        tables
            .transition_token_is_active(&TransitionToken::new("t2"))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_failed_bounded_seed_rolls_back_session_record() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    let tables = TokenTables::new(flaky.clone());
    let s = SessionToken::new("user+s1");
    let alice = OwnershipKey::new("alice");

    flaky.fail_value_writes.store(true, Ordering::SeqCst);
    let err = tables
        .add_session(&s, &alice, Some(&TransitionToken::new("seed")))
        .await
        .unwrap_err();
    assert!(err.is_store_failure());

    // the session record written before the seed was compensated
    assert!(!memory.contains_session(&s));
    assert_eq!(tables.owner_of_session(&s).await, None);
    assert_eq!(tables.session_for_owner(&alice).await, None);
}

#[tokio::test]
async fn test_failed_token_delete_is_not_resurrected() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    let tables = TokenTables::new(flaky.clone());
    let alice = OwnershipKey::new("alice");
    let t = TransitionToken::new("t1");

    tables
        .add_session(&SessionToken::new("user+s1"), &alice, None)
        .await
        .unwrap();
    tables.add_transferable_token(&t, "secret", &alice).await.unwrap();

    flaky.fail_value_deletes.store(true, Ordering::SeqCst);
    let err = tables.destroy_token(&t).await.unwrap_err();
    assert!(err.is_store_failure());

    // gone from the tables and never read back from the store
    assert_eq!(tables.from_token(&t).await, None);
    assert_eq!(tables.transition_token_is_active(&t).await.unwrap(), None);
    assert!(!tables.acquire_token(&t, &alice).await.unwrap());
    assert!(memory.contains_value("t1"));

    flaky.fail_value_deletes.store(false, Ordering::SeqCst);
    tables.destroy_token(&t).await.unwrap();

    assert!(!memory.contains_value("t1"));
    assert_eq!(tables.transition_token_is_active(&t).await.unwrap(), None);
    assert_eq!(tables.stats().await.pending_deletes, 0);
}

#[tokio::test]
async fn test_failed_bounded_delete_retried_by_sweep() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    let tables = TokenTables::new(flaky.clone());
    let s = SessionToken::new("user+s1");
    let alice = OwnershipKey::new("alice");
    let bound = TransitionToken::new("bound");

    tables.add_session(&s, &alice, Some(&bound)).await.unwrap();

    flaky.fail_value_deletes.store(true, Ordering::SeqCst);
    assert!(tables.destroy_session(&s).await.unwrap_err().is_store_failure());

    assert_eq!(tables.owner_of_session(&s).await, None);
    assert!(!memory.contains_session(&s));
    assert!(memory.contains_value("bound"));
    assert_eq!(tables.transition_token_is_active(&bound).await.unwrap(), None);

    flaky.fail_value_deletes.store(false, Ordering::SeqCst);
    let report = tables.sweep_expired().await.unwrap();
    assert_eq!(report.retried_deletes, 1);
    assert!(!memory.contains_value("bound"));
}

#[tokio::test]
async fn test_new_value_revives_pending_delete() {
    let (store, tables) = setup();
    let t = TransitionToken::new("t1");
    tables.add_token(&t, "old").await.unwrap();

    store.set_offline(true);
    assert!(tables.destroy_token(&t).await.is_err());
    store.set_offline(false);

    tables.add_token(&t, "new").await.unwrap();
    assert_eq!(tables.stats().await.pending_deletes, 0);
    assert_eq!(
        tables.transition_token_is_active(&t).await.unwrap().as_deref(),
        Some("new")
    );
}

#[tokio::test(start_paused = true)]
async fn test_stalled_store_times_out() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(memory.clone()));
    let config = TablesConfig::new().store_timeout(Duration::from_millis(200));
    let tables = TokenTables::with_config(flaky.clone(), config);

    memory.set_key_value("remote", "v").await.unwrap();
    flaky.stall_reads.store(true, Ordering::SeqCst);

    let err = tables
        .transition_token_is_active(&TransitionToken::new("remote"))
        .await
        .unwrap_err();
    match err {
        RegistryError::StoreTimeout { op, after } => {
            assert_eq!(op, "get_key_value");
            assert_eq!(after, Duration::from_millis(200));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_injected_token_creator() {
    let (_store, tables) = setup();
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let c = counter.clone();

    tables.set_token_creator(move |prefix| {
        let n = c.fetch_add(1, Ordering::SeqCst);
        format!("{}{}", prefix.unwrap_or(""), n)
    });

    let session = tables.create_session_token();
    assert_eq!(session.as_str(), "user+0");

    let token = tables.create_token(Some("ticket-"));
    assert!(!token.is_session());
    assert_eq!(token.as_str(), "ticket-1");
}
