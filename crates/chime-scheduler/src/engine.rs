use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{watch, Semaphore},
    task::JoinSet,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info};

use crate::{
    error::Result,
    lock::DistributedLock,
    processor::{ProcessOutcome, ReminderProcessor},
    store::ReminderStore,
};

/// Summary of one tick, mostly for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub due: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Polls the reminder store and drives every due reminder through the processor.
///
/// Safe to run in several processes against one store: the processor's
/// distributed lock decides which instance handles each firing.
pub struct SchedulerEngine {
    store: Arc<dyn ReminderStore>,
    processor: Arc<ReminderProcessor>,
    tick_interval: Duration,
    max_concurrent: usize,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn ReminderStore>,
        processor: Arc<ReminderProcessor>,
        tick_interval: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            processor,
            tick_interval,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Main event loop. Ticks until `shutdown` broadcasts `true` or its sender is dropped.
    ///
    /// A tick in progress always runs to completion, so a graceful shutdown
    /// never abandons a held lock.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            max_concurrent = self.max_concurrent,
            "reminder scheduler started"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("scheduler tick error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reminder scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Process every reminder due now. Per-reminder failures are logged and counted.
    pub async fn tick(&self) -> Result<TickStats> {
        let due = self.store.find_due(Utc::now())?;
        let mut stats = TickStats {
            due: due.len(),
            ..TickStats::default()
        };
        if due.is_empty() {
            return Ok(stats);
        }
        debug!(count = due.len(), "due reminders found");

        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut workers = JoinSet::new();
        for reminder in due {
            let processor = Arc::clone(&self.processor);
            let permits = Arc::clone(&permits);
            workers.spawn(async move {
                // The semaphore is never closed, so acquire cannot fail.
                let _permit = permits.acquire_owned().await.ok();
                let result = processor.process(&reminder).await;
                (reminder.id, result)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(ProcessOutcome::Delivered(_)))) => stats.delivered += 1,
                Ok((_, Ok(ProcessOutcome::Skipped))) => stats.skipped += 1,
                Ok((id, Err(e))) => {
                    stats.failed += 1;
                    error!(reminder_id = id, error = %e, "reminder processing failed, will retry next tick");
                }
                Err(e) => {
                    stats.failed += 1;
                    error!(error = %e, "reminder worker panicked");
                }
            }
        }

        if stats.delivered > 0 || stats.failed > 0 {
            info!(
                due = stats.due,
                delivered = stats.delivered,
                skipped = stats.skipped,
                failed = stats.failed,
                "scheduler tick finished"
            );
        }
        Ok(stats)
    }
}

/// Periodically reclaims lock rows abandoned by crashed holders.
pub struct LockJanitor {
    lock: Arc<DistributedLock>,
    sweep_interval: Duration,
}

impl LockJanitor {
    pub fn new(lock: Arc<DistributedLock>, sweep_interval: Duration) -> Self {
        Self {
            lock,
            sweep_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            owner = %self.lock.owner(),
            every_secs = self.sweep_interval.as_secs(),
            "lock janitor started"
        );
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.lock.clean_expired() {
                        error!("lock sweep failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("lock janitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chime_channels::{
        ChannelError, EmailDirectory, EmailTransport, LineTransport, NotificationRouter,
        PassthroughEnhancer,
    };
    use chime_core::{NewReminder, NotificationChannel, Reminder, ReminderStatus, RepeatType};
    use rusqlite::Connection;

    use super::*;
    use crate::{
        lock::{LockStore, SqliteLockStore},
        logs::SqliteReminderLogStore,
        store::SqliteReminderStore,
    };

    #[derive(Default)]
    struct RecordingLine {
        fail_room: Option<String>,
        pushed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LineTransport for RecordingLine {
        async fn push(&self, room_id: &str, _message: &str) -> std::result::Result<(), ChannelError> {
            if self.fail_room.as_deref() == Some(room_id) {
                return Err(ChannelError::SendFailed("blocked".into()));
            }
            self.pushed.lock().unwrap().push(room_id.to_string());
            Ok(())
        }
    }

    struct NoEmail;

    #[async_trait]
    impl EmailTransport for NoEmail {
        async fn send(
            &self,
            _: &Reminder,
            _: &str,
            _: &str,
            _: &str,
        ) -> std::result::Result<bool, ChannelError> {
            Ok(false)
        }
    }

    impl EmailDirectory for NoEmail {
        fn list_enabled_addresses(&self, _: &str) -> std::result::Result<Vec<String>, ChannelError> {
            Ok(Vec::new())
        }
    }

    struct Node {
        store: Arc<SqliteReminderStore>,
        line: Arc<RecordingLine>,
        engine: SchedulerEngine,
    }

    /// One scheduler instance over the database file at `path`.
    fn node(path: &std::path::Path, owner: &str, line: Arc<RecordingLine>, max_concurrent: usize) -> Node {
        let open = || {
            let conn = Connection::open(path).unwrap();
            conn.busy_timeout(Duration::from_secs(5)).unwrap();
            conn
        };
        let store = Arc::new(SqliteReminderStore::new(open()).unwrap());
        let lock_store: Arc<dyn LockStore> = Arc::new(SqliteLockStore::new(open()).unwrap());
        let lock = Arc::new(DistributedLock::new(lock_store, owner, Duration::from_secs(300)));
        let logs = Arc::new(SqliteReminderLogStore::new(open()).unwrap());
        let router = Arc::new(NotificationRouter::new(
            line.clone(),
            Arc::new(NoEmail),
            Arc::new(NoEmail),
            logs,
            Duration::from_secs(5),
        ));
        let processor = Arc::new(ReminderProcessor::new(
            store.clone(),
            lock,
            router,
            Arc::new(PassthroughEnhancer),
        ));
        let engine = SchedulerEngine::new(store.clone(), processor, Duration::from_millis(20), max_concurrent);
        Node {
            store,
            line,
            engine,
        }
    }

    fn add(store: &SqliteReminderStore, room: &str, repeat: RepeatType, at: chrono::DateTime<Utc>) -> Reminder {
        store
            .insert(&NewReminder {
                room_id: room.into(),
                content: "ping".into(),
                timezone: "UTC".into(),
                next_fire_at: at,
                repeat_type: repeat,
                channel: NotificationChannel::Line,
                created_by: "U1".into(),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn tick_processes_only_due_reminders() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let n = node(file.path(), "a", Arc::new(RecordingLine::default()), 1);
        let now = Utc::now();
        add(&n.store, "R1", RepeatType::Once, now - chrono::Duration::seconds(5));
        add(&n.store, "R2", RepeatType::Daily, now - chrono::Duration::days(2));
        add(&n.store, "R3", RepeatType::Once, now + chrono::Duration::hours(1));

        let stats = n.engine.tick().await.unwrap();
        assert_eq!(stats.due, 2);
        assert_eq!(stats.delivered, 2);

        let mut pushed = n.line.pushed.lock().unwrap().clone();
        pushed.sort();
        assert_eq!(pushed, vec!["R1", "R2"]);

        // nothing left due: R1 completed, R2 moved into the future
        assert_eq!(n.engine.tick().await.unwrap(), TickStats::default());
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_tick() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let line = Arc::new(RecordingLine {
            fail_room: Some("R1".into()),
            ..RecordingLine::default()
        });
        let n = node(file.path(), "a", line, 2);
        let now = Utc::now();
        let bad = add(&n.store, "R1", RepeatType::Once, now - chrono::Duration::seconds(5));
        add(&n.store, "R2", RepeatType::Once, now - chrono::Duration::seconds(5));

        let stats = n.engine.tick().await.unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(n.line.pushed.lock().unwrap().as_slice(), &["R2".to_string()]);
        // a failed delivery still advances state
        assert_eq!(n.store.find_by_id(bad.id).unwrap().unwrap().status, ReminderStatus::Completed);
    }

    #[tokio::test]
    async fn two_instances_deliver_each_reminder_once() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let line = Arc::new(RecordingLine::default());
        let a = node(file.path(), "node-a", line.clone(), 4);
        let b = node(file.path(), "node-b", line.clone(), 4);
        let now = Utc::now();
        for i in 0..10 {
            add(&a.store, &format!("R{i}"), RepeatType::Once, now - chrono::Duration::seconds(1));
        }

        let (sa, sb) = tokio::join!(a.engine.tick(), b.engine.tick());
        let (sa, sb) = (sa.unwrap(), sb.unwrap());
        assert_eq!(sa.delivered + sb.delivered, 10);
        assert_eq!(line.pushed.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let n = node(file.path(), "a", Arc::new(RecordingLine::default()), 1);
        add(&n.store, "R1", RepeatType::Once, Utc::now() - chrono::Duration::seconds(1));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(n.engine.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("engine should stop")
            .unwrap();

        assert_eq!(n.line.pushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn janitor_sweeps_and_stops() {
        let store = Arc::new(SqliteLockStore::new(Connection::open_in_memory().unwrap()).unwrap());
        store
            .insert_if_absent("reminder_1", "crashed", Utc::now() - chrono::Duration::minutes(10))
            .unwrap();
        let lock = Arc::new(DistributedLock::new(store.clone(), "a", Duration::from_secs(300)));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(LockJanitor::new(lock.clone(), Duration::from_millis(20)).run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("janitor should stop")
            .unwrap();

        assert!(lock.try_lock("reminder_1"));
    }
}
