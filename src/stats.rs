use serde::Serialize;

/// How a `Ledger::record` call changed the working generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The file had no entry before; the action is new as well.
    NewFile,
    /// The file was known but had never received this action.
    NewAction,
    /// The action was recorded under a different token.
    UpdatedAction,
    /// The same token was already recorded.
    Unchanged,
}

/// Counters for a single pass. Created fresh by every reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Regular files visited.
    pub files: usize,
    /// (file, action) pairs found stale.
    pub actions_found: usize,
    /// Action invocations that succeeded.
    pub tasks_performed: usize,
    /// Action invocations that failed; those files stay stale.
    pub actions_failed: usize,
    /// Files that got their first ledger entry.
    pub files_new: usize,
    /// Files evicted because they were not seen this pass.
    pub files_deleted: usize,
    /// Actions registered for the first time on a file.
    pub actions_new: usize,
    /// Actions re-recorded under a new token.
    pub actions_updated: usize,
    /// Files skipped because their token matched.
    pub actions_ignored: usize,
    /// Entries that could not be read during the walk.
    pub traversal_errors: usize,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a record classification into the counters.
    pub fn count_record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::NewFile => {
                self.files_new += 1;
                self.actions_new += 1;
            }
            RecordOutcome::NewAction => self.actions_new += 1,
            RecordOutcome::UpdatedAction => self.actions_updated += 1,
            RecordOutcome::Unchanged => {}
        }
    }

    /// Whether anything went wrong for individual entries.
    pub fn has_failures(&self) -> bool {
        self.actions_failed > 0 || self.traversal_errors > 0
    }
}
