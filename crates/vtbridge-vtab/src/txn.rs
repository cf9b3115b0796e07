//! Two-phase commit across the tables touched by one transaction.
//!
//! Phase one syncs every participant; only if all syncs succeed does phase
//! two commit them. A failed sync rolls everyone back and no commit runs.
//! Tables registered without the transactions capability take no part.

use std::sync::Arc;

use tracing::{debug, warn};
use vtbridge_error::{BridgeError, Result};
use vtbridge_types::Cx;

use crate::dispatch::{SharedVtab, TxnState, VtabHandle};
use crate::module::Capabilities;

fn participates(handle: &VtabHandle) -> bool {
    handle.is_connected() && handle.capabilities().contains(Capabilities::TRANSACTIONS)
}

/// Drives begin / sync / commit / rollback and savepoints over a set of
/// tables.
#[derive(Debug, Default)]
pub struct TransactionCoordinator {
    participants: Vec<SharedVtab>,
    active: bool,
}

impl TransactionCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn is_active(&self) -> bool {
        self.active
    }

    pub fn participants(&self) -> &[SharedVtab] {
        &self.participants
    }

    /// Add a table. Joining an active transaction begins it immediately.
    pub fn join(&mut self, cx: &Cx, table: SharedVtab) -> Result<()> {
        if self.participants.iter().any(|p| Arc::ptr_eq(p, &table)) {
            return Ok(());
        }
        if self.active {
            let mut handle = table.lock();
            if participates(&handle) {
                handle.begin(cx)?;
            }
        }
        self.participants.push(table);
        Ok(())
    }

    fn require_active(&self, op: &str) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(BridgeError::misuse(format!("{op} without an open transaction")))
        }
    }

    pub fn begin_all(&mut self, cx: &Cx) -> Result<()> {
        if self.active {
            return Err(BridgeError::misuse("transaction already open"));
        }
        for (i, table) in self.participants.iter().enumerate() {
            let mut handle = table.lock();
            if !participates(&handle) {
                continue;
            }
            if let Err(err) = handle.begin(cx) {
                drop(handle);
                warn!(participant = i, error = %err, "begin failed; rolling back earlier participants");
                if let Err(rb) = self.rollback_begun(cx) {
                    warn!(error = %rb, "rollback after failed begin also failed");
                }
                return Err(err);
            }
        }
        self.active = true;
        debug!(participants = self.participants.len(), "transaction begun");
        Ok(())
    }

    /// Sync every participant, then commit every participant.
    ///
    /// If any sync fails, every participant is rolled back and the sync
    /// error is returned; no commit runs. Commit failures are logged and the
    /// first one is returned after all participants have committed.
    pub fn commit_all(&mut self, cx: &Cx) -> Result<()> {
        self.require_active("commit")?;
        for table in &self.participants {
            let mut handle = table.lock();
            if !participates(&handle) {
                continue;
            }
            if let Err(err) = handle.sync(cx) {
                let name = handle.table_name().to_owned();
                drop(handle);
                warn!(table = %name, error = %err, "sync failed; rolling back transaction");
                if let Err(rb) = self.rollback_begun(cx) {
                    warn!(error = %rb, "rollback after failed sync also failed");
                }
                self.active = false;
                return Err(err);
            }
        }

        let mut first_err = None;
        for table in &self.participants {
            let mut handle = table.lock();
            if !participates(&handle) {
                continue;
            }
            if let Err(err) = handle.commit(cx) {
                warn!(table = handle.table_name(), error = %err, "commit failed");
                first_err.get_or_insert(err);
            }
        }
        self.active = false;
        debug!(participants = self.participants.len(), "transaction committed");
        first_err.map_or(Ok(()), Err)
    }

    pub fn rollback_all(&mut self, cx: &Cx) -> Result<()> {
        self.require_active("rollback")?;
        let result = self.rollback_begun(cx);
        self.active = false;
        result
    }

    /// Roll back every participant inside a transaction.
    fn rollback_begun(&self, cx: &Cx) -> Result<()> {
        let mut first_err = None;
        for table in &self.participants {
            let mut handle = table.lock();
            if !participates(&handle) || handle.txn_state() == TxnState::Idle {
                continue;
            }
            if let Err(err) = handle.rollback(cx) {
                warn!(table = handle.table_name(), error = %err, "rollback failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn savepoint_all(&mut self, cx: &Cx, id: i32) -> Result<()> {
        self.require_active("savepoint")?;
        self.each("savepoint", |handle| handle.savepoint(cx, id))
    }

    pub fn release_all(&mut self, cx: &Cx, id: i32) -> Result<()> {
        self.require_active("release")?;
        self.each("release", |handle| handle.release(cx, id))
    }

    pub fn rollback_to_all(&mut self, cx: &Cx, id: i32) -> Result<()> {
        self.require_active("rollback_to")?;
        self.each("rollback_to", |handle| handle.rollback_to(cx, id))
    }

    /// Apply `f` to every participant, even after one fails, so all of
    /// them end at the same savepoint depth. Returns the first error.
    fn each(&self, op: &str, mut f: impl FnMut(&mut VtabHandle) -> Result<()>) -> Result<()> {
        let mut first_err = None;
        for table in &self.participants {
            let mut handle = table.lock();
            if !participates(&handle) {
                continue;
            }
            if let Err(err) = f(&mut handle) {
                warn!(table = handle.table_name(), op, error = %err, "savepoint fan-out failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use vtbridge_types::SqlValue;

    use super::*;
    use crate::dispatch::ModuleRegistry;
    use crate::index::{BestIndexOutcome, IndexInfo};
    use crate::module::{ColumnContext, Module, VirtualTable, VirtualTableCursor, VtabContext};

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Participant {
        name: String,
        journal: Journal,
        fail_sync: bool,
        fail_savepoint: bool,
    }

    struct NoRows;

    impl VirtualTable for Participant {
        type Cursor = NoRows;
        type Aux = Journal;

        fn connect(_cx: &Cx, ctx: &mut VtabContext, aux: &Journal, args: &[&str]) -> Result<Self> {
            ctx.declare_schema("CREATE TABLE x(a)")?;
            Ok(Self {
                name: ctx.table_name().to_owned(),
                journal: Arc::clone(aux),
                fail_sync: args.contains(&"fail_sync"),
                fail_savepoint: args.contains(&"fail_savepoint"),
            })
        }

        fn best_index(&self, _info: &mut IndexInfo) -> Result<BestIndexOutcome> {
            Ok(BestIndexOutcome::Accept)
        }

        fn open(&self) -> Result<NoRows> {
            Ok(NoRows)
        }

        fn begin(&mut self, _cx: &Cx) -> Result<()> {
            self.journal.lock().push(format!("{}:begin", self.name));
            Ok(())
        }

        fn sync(&mut self, _cx: &Cx) -> Result<()> {
            self.journal.lock().push(format!("{}:sync", self.name));
            if self.fail_sync {
                return Err(BridgeError::Busy);
            }
            Ok(())
        }

        fn commit(&mut self, _cx: &Cx) -> Result<()> {
            self.journal.lock().push(format!("{}:commit", self.name));
            Ok(())
        }

        fn rollback(&mut self, _cx: &Cx) -> Result<()> {
            self.journal.lock().push(format!("{}:rollback", self.name));
            Ok(())
        }

        fn savepoint(&mut self, _cx: &Cx, id: i32) -> Result<()> {
            self.journal.lock().push(format!("{}:savepoint{id}", self.name));
            if self.fail_savepoint {
                return Err(BridgeError::Busy);
            }
            Ok(())
        }
    }

    impl VirtualTableCursor for NoRows {
        fn filter(
            &mut self,
            _cx: &Cx,
            _idx_num: i32,
            _idx_str: Option<&str>,
            _args: &[SqlValue],
        ) -> Result<()> {
            Ok(())
        }

        fn next(&mut self, _cx: &Cx) -> Result<()> {
            Ok(())
        }

        fn eof(&self) -> bool {
            true
        }

        fn column(&self, _ctx: &mut ColumnContext, _col: i32) -> Result<()> {
            Ok(())
        }

        fn rowid(&self) -> Result<i64> {
            Ok(0)
        }
    }

    fn setup(specs: &[(&str, bool)]) -> (TransactionCoordinator, Journal, ModuleRegistry) {
        let journal = Journal::default();
        let registry = ModuleRegistry::new();
        registry
            .register(
                "two_phase",
                Module::<Participant>::new()
                    .with_create()
                    .with_transactions()
                    .with_savepoints(),
                Arc::clone(&journal),
            )
            .unwrap();
        registry
            .register(
                "plain",
                Module::<Participant>::new().with_create(),
                Arc::clone(&journal),
            )
            .unwrap();
        let cx = Cx::new();
        let mut coordinator = TransactionCoordinator::new();
        for &(name, fail_sync) in specs {
            let module = if name.starts_with("plain") {
                "plain"
            } else {
                "two_phase"
            };
            let args: &[&str] = if fail_sync { &["fail_sync"] } else { &[] };
            let handle = registry.create_table(&cx, module, name, args).unwrap();
            coordinator.join(&cx, handle.into_shared()).unwrap();
        }
        (coordinator, journal, registry)
    }

    #[test]
    fn test_commit_syncs_everyone_before_any_commit() {
        let (mut coordinator, journal, _registry) = setup(&[("a", false), ("b", false)]);
        let cx = Cx::new();
        coordinator.begin_all(&cx).unwrap();
        coordinator.commit_all(&cx).unwrap();
        assert!(!coordinator.is_active());
        assert_eq!(
            *journal.lock(),
            vec!["a:begin", "b:begin", "a:sync", "b:sync", "a:commit", "b:commit"]
        );
    }

    #[test]
    fn test_failed_sync_rolls_back_without_commit() {
        let (mut coordinator, journal, _registry) =
            setup(&[("a", false), ("b", true), ("c", false)]);
        let cx = Cx::new();
        coordinator.begin_all(&cx).unwrap();
        let err = coordinator.commit_all(&cx).unwrap_err();
        assert!(matches!(err, BridgeError::Busy));

        let entries = journal.lock().clone();
        assert!(entries.iter().all(|e| !e.ends_with(":commit")));
        assert!(!entries.contains(&"c:sync".to_owned()));
        for name in ["a", "b", "c"] {
            assert!(entries.contains(&format!("{name}:rollback")));
        }
        for table in coordinator.participants() {
            assert_eq!(table.lock().txn_state(), TxnState::Idle);
        }
    }

    #[test]
    fn test_non_transactional_participant_skipped() {
        let (mut coordinator, journal, _registry) = setup(&[("plain_t", false), ("a", false)]);
        let cx = Cx::new();
        coordinator.begin_all(&cx).unwrap();
        coordinator.savepoint_all(&cx, 1).unwrap();
        coordinator.commit_all(&cx).unwrap();
        assert!(journal.lock().iter().all(|e| e.starts_with("a:")));
        assert_eq!(journal.lock().len(), 4);
    }

    #[test]
    fn test_failed_savepoint_does_not_stop_the_others() {
        let (mut coordinator, journal, registry) = setup(&[("a", false)]);
        let cx = Cx::new();
        let none: &[&str] = &[];
        for (name, args) in [("b", &["fail_savepoint"][..]), ("c", none)] {
            let handle = registry.create_table(&cx, "two_phase", name, args).unwrap();
            coordinator.join(&cx, handle.into_shared()).unwrap();
        }
        coordinator.begin_all(&cx).unwrap();

        let err = coordinator.savepoint_all(&cx, 1).unwrap_err();
        assert!(matches!(err, BridgeError::Busy));
        assert!(journal.lock().contains(&"c:savepoint1".to_owned()));
        let depths: Vec<Vec<i32>> = coordinator
            .participants()
            .iter()
            .map(|t| t.lock().savepoint_ids())
            .collect();
        assert_eq!(depths, vec![vec![1], vec![], vec![1]]);

        coordinator.release_all(&cx, 1).unwrap();
        for table in coordinator.participants() {
            assert!(table.lock().savepoint_ids().is_empty());
        }
        coordinator.rollback_all(&cx).unwrap();
    }

    #[test]
    fn test_ordering_misuse() {
        let (mut coordinator, _journal, _registry) = setup(&[("a", false)]);
        let cx = Cx::new();
        assert!(coordinator.commit_all(&cx).is_err());
        assert!(coordinator.savepoint_all(&cx, 1).is_err());
        coordinator.begin_all(&cx).unwrap();
        assert!(coordinator.begin_all(&cx).is_err());
        coordinator.rollback_all(&cx).unwrap();
        assert!(coordinator.rollback_all(&cx).is_err());
    }

    #[test]
    fn test_late_join_begins_immediately() {
        let (mut coordinator, journal, registry) = setup(&[("a", false)]);
        let cx = Cx::new();
        coordinator.begin_all(&cx).unwrap();
        let late = registry
            .create_table(&cx, "two_phase", "late", &[])
            .unwrap()
            .into_shared();
        coordinator.join(&cx, Arc::clone(&late)).unwrap();
        coordinator.join(&cx, late).unwrap();
        assert_eq!(coordinator.participants().len(), 2);
        assert!(journal.lock().contains(&"late:begin".to_owned()));
        coordinator.rollback_all(&cx).unwrap();
    }
}
