//! Transaction journal: DAG-ordered multi-entry transactions with failure
//! injection and strict reverse-order undo.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;

use crate::error::{EcsError, Result};
use crate::world::World;

/// Where an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Prepare,
    Commit,
}

/// Failure injection used by tests and soak tooling. Shared between the
/// transaction journal and the structural command buffer.
#[derive(Debug, Clone, Default)]
pub struct FailureInjection {
    /// Raise after this entry's validation runs.
    pub fail_at_entry: Option<u64>,
    /// Raise once this many applies have completed.
    pub fail_after_n_apply: Option<usize>,
    /// Raise at a fixed point of the transaction.
    pub fail_at_phase: Option<TransactionPhase>,
}

type ValidateFn = Box<dyn Fn(&World) -> bool + Send>;
type ApplyFn = Box<dyn FnMut(&mut World) -> Result<()> + Send>;
type UndoFn = Box<dyn FnMut(&mut World) + Send>;

/// One journaled operation with explicit dependencies.
pub struct JournalEntry {
    pub id: u64,
    pub depends_on: Vec<u64>,
    pub validate: Option<ValidateFn>,
    pub apply: Option<ApplyFn>,
    pub undo: Option<UndoFn>,
}

impl JournalEntry {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            depends_on: Vec::new(),
            validate: None,
            apply: None,
            undo: None,
        }
    }

    pub fn depends_on(mut self, ids: &[u64]) -> Self {
        self.depends_on.extend_from_slice(ids);
        self
    }

    pub fn with_validate(mut self, f: impl Fn(&World) -> bool + Send + 'static) -> Self {
        self.validate = Some(Box::new(f));
        self
    }

    pub fn with_apply(mut self, f: impl FnMut(&mut World) -> Result<()> + Send + 'static) -> Self {
        self.apply = Some(Box::new(f));
        self
    }

    pub fn with_undo(mut self, f: impl FnMut(&mut World) + Send + 'static) -> Self {
        self.undo = Some(Box::new(f));
        self
    }
}

/// A vector of journal entries whose `depends_on` ids form a DAG.
pub struct Transaction {
    entries: Vec<JournalEntry>,
}

impl Transaction {
    pub fn new(entries: Vec<JournalEntry>) -> Self {
        Self { entries }
    }

    /// Deterministic topological order: among ready entries the smallest id
    /// goes first. Duplicate ids, unknown dependencies, and cycles fail.
    fn topo_order(&self) -> Result<Vec<usize>> {
        let mut index_by_id: FxHashMap<u64, usize> = FxHashMap::default();
        for (idx, entry) in self.entries.iter().enumerate() {
            if index_by_id.insert(entry.id, idx).is_some() {
                return Err(EcsError::Dependency(format!(
                    "duplicate entry id {}",
                    entry.id
                )));
            }
        }

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.entries.len()];
        let mut indegree = vec![0usize; self.entries.len()];
        for (idx, entry) in self.entries.iter().enumerate() {
            for dep in &entry.depends_on {
                let Some(&dep_idx) = index_by_id.get(dep) else {
                    return Err(EcsError::Dependency(format!(
                        "entry {} depends on unknown id {dep}",
                        entry.id
                    )));
                };
                children[dep_idx].push(idx);
                indegree[idx] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();
        for (idx, &deg) in indegree.iter().enumerate() {
            if deg == 0 {
                ready.push(Reverse((self.entries[idx].id, idx)));
            }
        }

        let mut order = Vec::with_capacity(self.entries.len());
        while let Some(Reverse((_, idx))) = ready.pop() {
            order.push(idx);
            for &child in &children[idx] {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.push(Reverse((self.entries[child].id, child)));
                }
            }
        }

        if order.len() != self.entries.len() {
            return Err(EcsError::TransactionCycle);
        }
        Ok(order)
    }

    pub fn validate_graph_acyclic(&self) -> bool {
        self.topo_order().is_ok()
    }

    /// Validate and apply all entries in dependency order. Any failure during
    /// apply — real or injected — replays the undo stack in strict reverse
    /// order before the error surfaces.
    pub fn execute(
        &mut self,
        world: &mut World,
        failure: Option<&FailureInjection>,
    ) -> Result<()> {
        let order = self.topo_order()?;

        if let Some(f) = failure {
            if f.fail_at_phase == Some(TransactionPhase::Prepare) {
                return Err(EcsError::StructuralApply(
                    "injected prepare failure".into(),
                ));
            }
        }

        for &idx in &order {
            let entry = &self.entries[idx];
            if let Some(validate) = &entry.validate {
                if !validate(world) {
                    return Err(EcsError::Validation(format!(
                        "transaction entry {} failed validation",
                        entry.id
                    )));
                }
            }
            if let Some(f) = failure {
                if f.fail_at_entry == Some(entry.id) {
                    return Err(EcsError::Validation(format!(
                        "injected failure at entry {}",
                        entry.id
                    )));
                }
            }
        }

        if let Some(f) = failure {
            if f.fail_at_phase == Some(TransactionPhase::Commit) {
                return Err(EcsError::StructuralApply("injected commit failure".into()));
            }
        }

        let mut applied: Vec<usize> = Vec::with_capacity(order.len());
        let mut failed: Option<EcsError> = None;
        for &idx in &order {
            if let Some(apply) = &mut self.entries[idx].apply {
                if let Err(err) = apply(world) {
                    failed = Some(err);
                    break;
                }
            }
            applied.push(idx);

            if let Some(f) = failure {
                if f.fail_after_n_apply
                    .is_some_and(|n| applied.len() >= n)
                {
                    failed = Some(EcsError::StructuralApply(format!(
                        "injected failure after {} applies",
                        applied.len()
                    )));
                    break;
                }
            }
        }

        if let Some(err) = failed {
            for &idx in applied.iter().rev() {
                if let Some(undo) = &mut self.entries[idx].undo {
                    undo(world);
                }
            }
            tracing::debug!(category = err.category(), "transaction rolled back");
            return Err(err);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn noop_entry(id: u64) -> JournalEntry {
        JournalEntry::new(id).with_apply(|_| Ok(()))
    }

    #[test]
    fn rejects_duplicate_ids() {
        let tx = Transaction::new(vec![noop_entry(1), noop_entry(1)]);
        assert!(!tx.validate_graph_acyclic());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let tx = Transaction::new(vec![noop_entry(1).depends_on(&[99])]);
        assert!(!tx.validate_graph_acyclic());
    }

    #[test]
    fn rejects_cycles() {
        let tx = Transaction::new(vec![
            noop_entry(1).depends_on(&[2]),
            noop_entry(2).depends_on(&[1]),
        ]);
        assert!(!tx.validate_graph_acyclic());
    }

    #[test]
    fn executes_in_deterministic_topo_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let entry = |id: u64, deps: &[u64]| {
            let log = log.clone();
            JournalEntry::new(id).depends_on(deps).with_apply(move |_| {
                log.lock().unwrap().push(id);
                Ok(())
            })
        };

        // 3 and 1 are both ready at the start; smallest id goes first.
        let mut tx = Transaction::new(vec![entry(3, &[]), entry(1, &[]), entry(2, &[1, 3])]);
        let mut world = World::new();
        tx.execute(&mut world, None).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 3, 2]);
    }

    #[test]
    fn apply_failure_undoes_in_reverse() {
        let counter = Arc::new(AtomicU32::new(0));
        let undo_log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let entry = |id: u64| {
            let counter = counter.clone();
            let undo_log = undo_log.clone();
            JournalEntry::new(id)
                .with_apply(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .with_undo(move |_| {
                    undo_log.lock().unwrap().push(id);
                })
        };

        let mut tx = Transaction::new(vec![entry(1), entry(2), entry(3)]);
        let mut world = World::new();
        let failure = FailureInjection {
            fail_after_n_apply: Some(2),
            ..Default::default()
        };
        let err = tx.execute(&mut world, Some(&failure)).unwrap_err();
        assert_eq!(err.category(), "structural-apply");

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(*undo_log.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn prepare_injection_applies_nothing() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let mut tx = Transaction::new(vec![JournalEntry::new(1).with_apply(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })]);

        let mut world = World::new();
        let failure = FailureInjection {
            fail_at_phase: Some(TransactionPhase::Prepare),
            ..Default::default()
        };
        assert!(tx.execute(&mut world, Some(&failure)).is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn entry_injection_fires_during_validation() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let mut tx = Transaction::new(vec![
            JournalEntry::new(1).with_validate(|_| true).with_apply(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ]);

        let mut world = World::new();
        let failure = FailureInjection {
            fail_at_entry: Some(1),
            ..Default::default()
        };
        let err = tx.execute(&mut world, Some(&failure)).unwrap_err();
        assert_eq!(err.category(), "validation");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
