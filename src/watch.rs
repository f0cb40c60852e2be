//! Watch mode.
//!
//! Filesystem notifications under the root are bridged from `notify` into a
//! tokio channel and fed to a [`PassScheduler`]. The scheduler holds at most
//! one pending pass: notifications during the quiet period push its deadline
//! back, and notifications during a running pass mark it for one follow-up
//! pass. The ledger is owned by the background task, so only one pass can
//! ever write to it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ImageLockError, Result};
use crate::ledger::Ledger;
use crate::reconciler::Reconciler;
use crate::stats::RunStats;

/// Capacity of the channel bridging `notify` callbacks to the event loop.
/// When it is full the callback only raises the overflow flag.
const CHANNEL_CAPACITY: usize = 512;

/// State of the single pass slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassSlot {
    Idle,
    PendingDebounce(Instant),
    /// A pass is running; `rerun` is set when notifications arrived since it
    /// started.
    Running { rerun: bool },
}

/// Debounce state machine. Pure: callers supply the current time.
#[derive(Debug, Clone)]
pub struct PassScheduler {
    debounce: Duration,
    slot: PassSlot,
}

impl PassScheduler {
    pub fn new(debounce: Duration) -> Self {
        PassScheduler {
            debounce,
            slot: PassSlot::Idle,
        }
    }

    pub fn slot(&self) -> PassSlot {
        self.slot
    }

    /// Start the baseline pass, bypassing the quiet period.
    pub fn start_immediately(&mut self) {
        if self.slot == PassSlot::Idle {
            self.slot = PassSlot::Running { rerun: false };
        }
    }

    /// A relevant filesystem change was observed at `now`.
    pub fn on_notify(&mut self, now: Instant) {
        self.slot = match self.slot {
            PassSlot::Idle | PassSlot::PendingDebounce(_) => {
                PassSlot::PendingDebounce(now + self.debounce)
            }
            PassSlot::Running { .. } => PassSlot::Running { rerun: true },
        };
    }

    /// When the pending pass is due, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        match self.slot {
            PassSlot::PendingDebounce(deadline) => Some(deadline),
            _ => None,
        }
    }

    /// Move a due pending pass to `Running`. Returns whether a pass starts.
    pub fn try_start(&mut self, now: Instant) -> bool {
        match self.slot {
            PassSlot::PendingDebounce(deadline) if deadline <= now => {
                self.slot = PassSlot::Running { rerun: false };
                true
            }
            _ => false,
        }
    }

    /// The running pass finished at `now`.
    pub fn on_pass_complete(&mut self, now: Instant) {
        self.slot = match self.slot {
            PassSlot::Running { rerun: true } => PassSlot::PendingDebounce(now + self.debounce),
            PassSlot::Running { rerun: false } => PassSlot::Idle,
            other => other,
        };
    }
}

/// Outcome of one watch-mode pass, broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// The pass completed and the ledger was written.
    PassCompleted(RunStats),
    /// The pass completed but the ledger could not be written. The in-memory
    /// ledger is kept and written again after the next pass.
    PersistFailed { stats: RunStats, message: String },
    /// The pass could not run, e.g. because the root disappeared.
    PassFailed(String),
}

/// Runs reconciliation passes whenever files under the root change.
///
/// Dropping the coordinator without calling [`stop`](Self::stop) or
/// [`abort`](Self::abort) leaves the background task running until the
/// runtime shuts down.
pub struct WatchCoordinator {
    sender: broadcast::Sender<WatchEvent>,
    shutdown: Arc<Notify>,
    task: JoinHandle<Ledger>,
    /// Keeps the OS watch registered. Dropped on stop.
    _watcher: notify::RecommendedWatcher,
}

impl WatchCoordinator {
    /// Watch the reconciler's root recursively and run the baseline pass.
    ///
    /// Fails when the watch cannot be registered, e.g. because the root does
    /// not exist.
    pub fn start(
        reconciler: Reconciler,
        ledger: Ledger,
        debounce: Duration,
    ) -> Result<(Self, broadcast::Receiver<WatchEvent>)> {
        let (broadcast_tx, broadcast_rx) = broadcast::channel(64);
        let (bridge_tx, bridge_rx) = mpsc::channel::<notify::Event>(CHANNEL_CAPACITY);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut watcher = {
            let overflow = Arc::clone(&overflowed);
            notify::RecommendedWatcher::new(
                move |res: std::result::Result<notify::Event, notify::Error>| match res {
                    Ok(event) => {
                        if bridge_tx.try_send(event).is_err()
                            && !overflow.swap(true, Ordering::Relaxed)
                        {
                            warn!("watcher channel full, coalescing events into one pass");
                        }
                    }
                    Err(e) => warn!("filesystem watcher error: {e}"),
                },
                notify::Config::default(),
            )
            .map_err(|e| {
                ImageLockError::WatcherError(format!("failed to create filesystem watcher: {e}"))
            })?
        };
        watcher
            .watch(reconciler.root(), RecursiveMode::Recursive)
            .map_err(|e| {
                ImageLockError::WatcherError(format!(
                    "failed to watch {}: {e}",
                    reconciler.root().display()
                ))
            })?;
        info!(root = %reconciler.root().display(), "watching for changes");

        let shutdown = Arc::new(Notify::new());
        let event_loop = EventLoop {
            reconciler,
            ledger,
            scheduler: PassScheduler::new(debounce),
            events: bridge_rx,
            events_open: true,
            overflowed,
            shutdown: Arc::clone(&shutdown),
            stopping: false,
            sender: broadcast_tx.clone(),
        };
        let task = tokio::spawn(event_loop.run());

        Ok((
            WatchCoordinator {
                sender: broadcast_tx,
                shutdown,
                task,
                _watcher: watcher,
            },
            broadcast_rx,
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }

    /// Stop watching. A pass already running is finished and persisted; a
    /// pass still in its quiet period is dropped. Returns the final ledger.
    pub async fn stop(self) -> Result<Ledger> {
        let WatchCoordinator {
            shutdown,
            task,
            _watcher: watcher,
            ..
        } = self;
        drop(watcher);
        shutdown.notify_one();
        task.await
            .map_err(|e| ImageLockError::WatcherError(format!("watch task failed: {e}")))
    }

    /// Stop watching and abandon any running pass. Its in-memory results
    /// are discarded; the ledger on disk keeps the last completed pass.
    /// Returns once the task is gone.
    pub async fn abort(self) {
        self.task.abort();
        // The task was cancelled, or it had already finished.
        let _ = self.task.await;
    }
}

/// Whether a notify event kind can change the outcome of a pass.
fn triggers_pass(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

enum Wakeup {
    Event(Option<notify::Event>),
    Deadline,
    Shutdown,
}

struct EventLoop {
    reconciler: Reconciler,
    ledger: Ledger,
    scheduler: PassScheduler,
    events: mpsc::Receiver<notify::Event>,
    events_open: bool,
    overflowed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    stopping: bool,
    sender: broadcast::Sender<WatchEvent>,
}

impl EventLoop {
    async fn run(mut self) -> Ledger {
        self.scheduler.start_immediately();

        while !self.stopping {
            if matches!(self.scheduler.slot(), PassSlot::Running { .. }) {
                self.run_pass().await;
                self.scheduler.on_pass_complete(Instant::now());
                continue;
            }

            let deadline = self.scheduler.deadline();
            let wakeup = tokio::select! {
                event = self.events.recv(), if self.events_open => Wakeup::Event(event),
                _ = sleep_until(deadline), if deadline.is_some() => Wakeup::Deadline,
                _ = self.shutdown.notified() => Wakeup::Shutdown,
            };
            match wakeup {
                Wakeup::Event(event) => self.handle_event(event),
                Wakeup::Deadline => {
                    self.scheduler.try_start(Instant::now());
                }
                Wakeup::Shutdown => self.stopping = true,
            }
        }

        debug!("watch loop stopped");
        self.ledger
    }

    /// One pass. Notifications and a stop request are still taken in while
    /// the tree walk is in flight; neither interrupts it.
    async fn run_pass(&mut self) {
        let EventLoop {
            reconciler,
            ledger,
            scheduler,
            events,
            events_open,
            overflowed,
            shutdown,
            stopping,
            sender,
        } = self;

        let result = {
            let pass = reconciler.reconcile(ledger);
            tokio::pin!(pass);
            loop {
                tokio::select! {
                    result = &mut pass => break result,
                    event = events.recv(), if *events_open => {
                        accept_event(scheduler, events_open, overflowed, reconciler, event);
                    }
                    _ = shutdown.notified(), if !*stopping => *stopping = true,
                }
            }
        };

        let report = match result {
            Ok(stats) => match reconciler.persist(ledger).await {
                Ok(()) => WatchEvent::PassCompleted(stats),
                Err(e) => {
                    warn!("{e}");
                    WatchEvent::PersistFailed {
                        stats,
                        message: e.to_string(),
                    }
                }
            },
            Err(e) => {
                warn!("{e}");
                WatchEvent::PassFailed(e.to_string())
            }
        };
        // No subscribers is fine.
        let _ = sender.send(report);
    }

    fn handle_event(&mut self, event: Option<notify::Event>) {
        accept_event(
            &mut self.scheduler,
            &mut self.events_open,
            &self.overflowed,
            &self.reconciler,
            event,
        );
    }
}

fn accept_event(
    scheduler: &mut PassScheduler,
    events_open: &mut bool,
    overflowed: &AtomicBool,
    reconciler: &Reconciler,
    event: Option<notify::Event>,
) {
    let Some(event) = event else {
        *events_open = false;
        return;
    };
    let relevant = overflowed.swap(false, Ordering::Relaxed)
        || (triggers_pass(event.kind) && event.paths.iter().any(|p| reconciler.is_relevant(p)));
    if relevant {
        debug!(kind = ?event.kind, paths = ?event.paths, "change detected");
        scheduler.on_notify(Instant::now());
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::action::{ActionRunner, NoopRunner};
    use crate::fs::temp_path_for;
    use crate::token::MtimeSource;
    use crate::types::{FileKey, FreshnessToken, LedgerMap};

    /// Signals when it starts and blocks until released.
    #[derive(Default)]
    struct GatedRunner {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ActionRunner for GatedRunner {
        fn name(&self) -> &str {
            "x"
        }

        async fn run(&self, _path: &Path, _key: &FileKey) -> Result<()> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    /// A ledger on disk holding `a.png` under a token no file will match.
    async fn seed_outdated_ledger(path: &Path) -> Ledger {
        let mut record = BTreeMap::new();
        record.insert("x".to_string(), FreshnessToken::new("OLD"));
        let mut map = LedgerMap::new();
        map.insert(FileKey::new("a.png"), record);
        let ledger = Ledger::from_map(path, map);
        ledger.persist().await.unwrap();
        ledger
    }

    fn gated_fixture() -> (TempDir, Arc<GatedRunner>, Reconciler) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("images");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.png"), b"a").unwrap();
        let runner = Arc::new(GatedRunner::default());
        let reconciler = Reconciler::new(&root, runner.clone(), Arc::new(MtimeSource::default()));
        (dir, runner, reconciler)
    }

    const DEBOUNCE: Duration = Duration::from_millis(100);

    #[test]
    fn test_notify_from_idle_schedules_pass() {
        let now = Instant::now();
        let mut scheduler = PassScheduler::new(DEBOUNCE);
        scheduler.on_notify(now);
        assert_eq!(scheduler.slot(), PassSlot::PendingDebounce(now + DEBOUNCE));
    }

    #[test]
    fn test_notify_during_quiet_period_resets_timer() {
        let now = Instant::now();
        let mut scheduler = PassScheduler::new(DEBOUNCE);
        scheduler.on_notify(now);
        scheduler.on_notify(now + Duration::from_millis(60));
        assert_eq!(
            scheduler.deadline(),
            Some(now + Duration::from_millis(160))
        );
        // Not due at the original deadline.
        assert!(!scheduler.try_start(now + DEBOUNCE));
        assert!(scheduler.try_start(now + Duration::from_millis(160)));
        assert_eq!(scheduler.slot(), PassSlot::Running { rerun: false });
    }

    #[test]
    fn test_burst_yields_one_pass() {
        let now = Instant::now();
        let mut scheduler = PassScheduler::new(DEBOUNCE);
        for i in 0..10 {
            scheduler.on_notify(now + Duration::from_millis(i * 10));
        }
        let due = scheduler.deadline().unwrap();
        assert!(scheduler.try_start(due));
        assert!(!scheduler.try_start(due));
        scheduler.on_pass_complete(due + Duration::from_millis(5));
        assert_eq!(scheduler.slot(), PassSlot::Idle);
    }

    #[test]
    fn test_notify_while_running_schedules_follow_up() {
        let now = Instant::now();
        let mut scheduler = PassScheduler::new(DEBOUNCE);
        scheduler.start_immediately();
        scheduler.on_notify(now);
        scheduler.on_notify(now + Duration::from_millis(1));
        assert_eq!(scheduler.slot(), PassSlot::Running { rerun: true });
        assert_eq!(scheduler.deadline(), None);

        let done = now + Duration::from_millis(500);
        scheduler.on_pass_complete(done);
        assert_eq!(scheduler.slot(), PassSlot::PendingDebounce(done + DEBOUNCE));
    }

    #[test]
    fn test_start_immediately_only_from_idle() {
        let now = Instant::now();
        let mut scheduler = PassScheduler::new(DEBOUNCE);
        scheduler.on_notify(now);
        scheduler.start_immediately();
        assert_eq!(scheduler.slot(), PassSlot::PendingDebounce(now + DEBOUNCE));
    }

    #[test]
    fn test_triggers_pass() {
        use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};
        assert!(triggers_pass(EventKind::Create(CreateKind::File)));
        assert!(triggers_pass(EventKind::Modify(ModifyKind::Any)));
        assert!(triggers_pass(EventKind::Remove(RemoveKind::File)));
        assert!(!triggers_pass(EventKind::Access(AccessKind::Any)));
    }

    fn fixture() -> (TempDir, Reconciler, Ledger) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("images");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.png"), b"a").unwrap();
        let ledger_path = dir.path().join("image-lock.json");
        let reconciler = Reconciler::new(
            &root,
            Arc::new(NoopRunner::new("x")),
            Arc::new(MtimeSource::default()),
        )
        .skip_path(&ledger_path);
        (dir, reconciler, Ledger::empty(ledger_path))
    }

    async fn next_completed(rx: &mut broadcast::Receiver<WatchEvent>) -> RunStats {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(WatchEvent::PassCompleted(stats)) => return stats,
                    Ok(other) => panic!("unexpected watch event: {other:?}"),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("watch channel closed: {e}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("timed out waiting for a pass")
    }

    #[tokio::test]
    async fn test_baseline_pass_then_change_triggers_pass() {
        let (dir, reconciler, ledger) = fixture();
        let root = reconciler.root().to_path_buf();
        let (coordinator, mut rx) = WatchCoordinator::start(reconciler, ledger, DEBOUNCE).unwrap();

        let baseline = next_completed(&mut rx).await;
        assert_eq!(baseline.files_new, 1);
        assert!(dir.path().join("image-lock.json").exists());

        std::fs::write(root.join("b.png"), b"b").unwrap();
        let mut seen_b = false;
        for _ in 0..3 {
            let stats = next_completed(&mut rx).await;
            if stats.files_new == 1 {
                seen_b = true;
                break;
            }
        }
        assert!(seen_b);

        let ledger = coordinator.stop().await.unwrap();
        assert!(ledger.get(&FileKey::new("a.png")).is_some());
        assert!(ledger.get(&FileKey::new("b.png")).is_some());

        let on_disk = Ledger::load(dir.path().join("image-lock.json")).await.unwrap();
        assert_eq!(on_disk.entries(), ledger.entries());
    }

    #[tokio::test]
    async fn test_removal_evicts_entry() {
        let (_dir, reconciler, ledger) = fixture();
        let root = reconciler.root().to_path_buf();
        let (coordinator, mut rx) = WatchCoordinator::start(reconciler, ledger, DEBOUNCE).unwrap();
        next_completed(&mut rx).await;

        std::fs::remove_file(root.join("a.png")).unwrap();
        let stats = next_completed(&mut rx).await;
        assert_eq!(stats.files_deleted, 1);

        let ledger = coordinator.stop().await.unwrap();
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_stop_finishes_and_persists_running_pass() {
        let (dir, runner, reconciler) = gated_fixture();
        let ledger_path = dir.path().join("image-lock.json");
        let ledger = seed_outdated_ledger(&ledger_path).await;

        let (coordinator, _rx) = WatchCoordinator::start(reconciler, ledger, DEBOUNCE).unwrap();
        tokio::time::timeout(Duration::from_secs(10), runner.started.notified())
            .await
            .expect("baseline pass never reached the action");

        let stopping = tokio::spawn(coordinator.stop());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());
        runner.release.notify_one();

        let ledger = tokio::time::timeout(Duration::from_secs(10), stopping)
            .await
            .expect("stop did not return")
            .unwrap()
            .unwrap();
        let token = ledger.get(&FileKey::new("a.png")).unwrap()["x"].clone();
        assert_ne!(token.as_str(), "OLD");

        let on_disk = Ledger::load(&ledger_path).await.unwrap();
        assert_eq!(on_disk.entries(), ledger.entries());
    }

    #[tokio::test]
    async fn test_abort_keeps_previous_ledger_on_disk() {
        let (dir, runner, reconciler) = gated_fixture();
        let ledger_path = dir.path().join("image-lock.json");
        let ledger = seed_outdated_ledger(&ledger_path).await;
        let before = std::fs::read_to_string(&ledger_path).unwrap();

        let (coordinator, _rx) = WatchCoordinator::start(reconciler, ledger, DEBOUNCE).unwrap();
        tokio::time::timeout(Duration::from_secs(10), runner.started.notified())
            .await
            .expect("baseline pass never reached the action");

        coordinator.abort().await;
        // A late release must not resurrect the pass.
        runner.release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(std::fs::read_to_string(&ledger_path).unwrap(), before);
        assert!(!temp_path_for(&ledger_path).exists());
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_root() {
        let dir = TempDir::new().unwrap();
        let reconciler = Reconciler::new(
            dir.path().join("missing"),
            Arc::new(NoopRunner::new("x")),
            Arc::new(MtimeSource::default()),
        );
        let result = WatchCoordinator::start(
            reconciler,
            Ledger::empty(dir.path().join("image-lock.json")),
            DEBOUNCE,
        );
        assert!(matches!(result, Err(ImageLockError::WatcherError(_))));
    }
}
