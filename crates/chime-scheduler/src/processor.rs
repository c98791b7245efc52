use std::{sync::Arc, time::Duration};

use chime_channels::{enhance_or_raw, ContentEnhancer, DeliveryReport, NotificationRouter};
use chime_core::Reminder;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::{error::Result, lock::DistributedLock, repeat, store::ReminderStore};

/// What happened to one reminder during a processing episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another instance holds the lock, or the reminder was already handled.
    Skipped,
    /// State advanced and notification attempted.
    Delivered(DeliveryReport),
}

/// Upper bound on one enhancement call unless configured otherwise.
pub const DEFAULT_ENHANCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs one reminder through lock → advance → notify → unlock.
pub struct ReminderProcessor {
    store: Arc<dyn ReminderStore>,
    lock: Arc<DistributedLock>,
    router: Arc<NotificationRouter>,
    enhancer: Arc<dyn ContentEnhancer>,
    enhance_timeout: Duration,
}

impl ReminderProcessor {
    pub fn new(
        store: Arc<dyn ReminderStore>,
        lock: Arc<DistributedLock>,
        router: Arc<NotificationRouter>,
        enhancer: Arc<dyn ContentEnhancer>,
    ) -> Self {
        Self {
            store,
            lock,
            router,
            enhancer,
            enhance_timeout: DEFAULT_ENHANCE_TIMEOUT,
        }
    }

    /// Bound the enhancement call; on elapse the raw content is delivered.
    pub fn with_enhance_timeout(mut self, limit: Duration) -> Self {
        self.enhance_timeout = limit;
        self
    }

    pub async fn process(&self, reminder: &Reminder) -> Result<ProcessOutcome> {
        self.process_at(reminder, Utc::now()).await
    }

    /// Process `reminder` as if the clock read `now`.
    ///
    /// The lock is held until delivery has finished, and is released on every
    /// exit path, including an advance error, a panic, or cancellation.
    #[instrument(skip(self, reminder), fields(reminder_id = reminder.id))]
    pub async fn process_at(&self, reminder: &Reminder, now: DateTime<Utc>) -> Result<ProcessOutcome> {
        let key = reminder.lock_key();
        let Some(_guard) = self.lock.acquire(&key) else {
            debug!(%key, "lock held elsewhere, skipping");
            return Ok(ProcessOutcome::Skipped);
        };

        // The due list was read before the lock; another instance may have
        // advanced or deleted the reminder since.
        let current = match self.store.find_by_id(reminder.id)? {
            Some(r) if r.is_due(now) => r,
            _ => {
                debug!("reminder no longer due, skipping");
                return Ok(ProcessOutcome::Skipped);
            }
        };

        let advanced = repeat::advance(&current, now)?;
        self.store.save(&advanced)?;
        info!(
            status = %advanced.status,
            next_fire_at = %advanced.next_fire_at,
            "reminder state advanced"
        );

        let content =
            enhance_or_raw(self.enhancer.as_ref(), &current.content, self.enhance_timeout).await;
        let report = self.router.send(&current, &content).await;
        if report.any_sent() {
            debug!(?report, "reminder delivery finished");
        } else {
            warn!(?report, "reminder reached no channel");
        }

        Ok(ProcessOutcome::Delivered(report))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use chime_channels::{
        ChannelError, EmailDirectory, EmailTransport, LineTransport, PassthroughEnhancer,
    };
    use chime_core::{
        DeliveryMethod, DeliveryStatus, NewReminder, NotificationChannel, ReminderStatus,
        RepeatType,
    };
    use chrono::TimeZone;
    use rusqlite::Connection;

    use super::*;
    use crate::{
        error::SchedulerError,
        lock::{LockStore, SqliteLockStore},
        logs::SqliteReminderLogStore,
        store::SqliteReminderStore,
    };

    #[derive(Default)]
    struct FakeLine {
        fail: bool,
        pushed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LineTransport for FakeLine {
        async fn push(&self, _room_id: &str, message: &str) -> std::result::Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError::SendFailed("LINE down".into()));
            }
            self.pushed.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeEmail {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EmailTransport for FakeEmail {
        async fn send(
            &self,
            _reminder: &Reminder,
            address: &str,
            _content: &str,
            _token: &str,
        ) -> std::result::Result<bool, ChannelError> {
            self.sent.lock().unwrap().push(address.to_string());
            Ok(true)
        }
    }

    struct FakeDirectory(HashMap<String, Vec<String>>);

    impl EmailDirectory for FakeDirectory {
        fn list_enabled_addresses(&self, room_id: &str) -> std::result::Result<Vec<String>, ChannelError> {
            Ok(self.0.get(room_id).cloned().unwrap_or_default())
        }
    }

    struct Upper;

    #[async_trait]
    impl ContentEnhancer for Upper {
        async fn enhance(&self, text: &str) -> std::result::Result<String, ChannelError> {
            Ok(text.to_uppercase())
        }
    }

    struct Stuck;

    #[async_trait]
    impl ContentEnhancer for Stuck {
        async fn enhance(&self, _text: &str) -> std::result::Result<String, ChannelError> {
            std::future::pending().await
        }
    }

    /// Store whose writes always fail.
    struct ReadOnlyStore(SqliteReminderStore);

    impl ReminderStore for ReadOnlyStore {
        fn insert(&self, new: &NewReminder) -> Result<Reminder> {
            self.0.insert(new)
        }
        fn find_due(&self, before: DateTime<Utc>) -> Result<Vec<Reminder>> {
            self.0.find_due(before)
        }
        fn find_by_id(&self, id: i64) -> Result<Option<Reminder>> {
            self.0.find_by_id(id)
        }
        fn find_by_room(&self, room_id: &str) -> Result<Vec<Reminder>> {
            self.0.find_by_room(room_id)
        }
        fn save(&self, _reminder: &Reminder) -> Result<()> {
            Err(SchedulerError::Poisoned)
        }
        fn delete(&self, id: i64) -> Result<bool> {
            self.0.delete(id)
        }
    }

    struct Fixture {
        store: Arc<dyn ReminderStore>,
        lock_store: Arc<SqliteLockStore>,
        lock: Arc<DistributedLock>,
        logs: Arc<SqliteReminderLogStore>,
        line: Arc<FakeLine>,
        email: Arc<FakeEmail>,
        processor: ReminderProcessor,
    }

    fn fixture_with(store: Arc<dyn ReminderStore>, line: FakeLine, enhancer: Arc<dyn ContentEnhancer>) -> Fixture {
        let lock_store = Arc::new(SqliteLockStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let lock = Arc::new(DistributedLock::new(
            lock_store.clone(),
            "node-a",
            Duration::from_secs(300),
        ));
        let logs = Arc::new(SqliteReminderLogStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let line = Arc::new(line);
        let email = Arc::new(FakeEmail::default());
        let mut rooms = HashMap::new();
        rooms.insert("R1".to_string(), vec!["ops@example.com".to_string()]);
        let router = Arc::new(NotificationRouter::new(
            line.clone(),
            email.clone(),
            Arc::new(FakeDirectory(rooms)),
            logs.clone(),
            Duration::from_secs(5),
        ));
        let processor = ReminderProcessor::new(store.clone(), lock.clone(), router, enhancer)
            .with_enhance_timeout(Duration::from_millis(100));
        Fixture {
            store,
            lock_store,
            lock,
            logs,
            line,
            email,
            processor,
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteReminderStore::new(Connection::open_in_memory().unwrap()).unwrap());
        fixture_with(store, FakeLine::default(), Arc::new(PassthroughEnhancer))
    }

    fn due_reminder(
        store: &dyn ReminderStore,
        repeat: RepeatType,
        channel: NotificationChannel,
        at: DateTime<Utc>,
    ) -> Reminder {
        store
            .insert(&NewReminder {
                room_id: "R1".into(),
                content: "stretch".into(),
                timezone: "Asia/Taipei".into(),
                next_fire_at: at,
                repeat_type: repeat,
                channel,
                created_by: "U1".into(),
            })
            .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn once_reminder_completes_and_is_not_reprocessed() {
        let f = fixture();
        let t = now() - chrono::Duration::minutes(1);
        let r = due_reminder(f.store.as_ref(), RepeatType::Once, NotificationChannel::Line, t);

        let outcome = f.processor.process(&r).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Delivered(rep) if rep.line == Some(DeliveryStatus::Sent)));

        let stored = f.store.find_by_id(r.id).unwrap().unwrap();
        assert_eq!(stored.status, ReminderStatus::Completed);
        assert!(f.store.find_due(now()).unwrap().is_empty());

        // a stale copy from an earlier due query is not delivered again
        assert_eq!(f.processor.process(&r).await.unwrap(), ProcessOutcome::Skipped);
        assert_eq!(f.line.pushed.lock().unwrap().len(), 1);
        assert!(f.lock.try_lock(&r.lock_key()), "lock must be released");
    }

    #[tokio::test]
    async fn daily_reminder_three_days_late_moves_to_next_future_day() {
        let f = fixture();
        let processed_at = now();
        let t = processed_at - chrono::Duration::days(3) - chrono::Duration::minutes(10);
        let r = due_reminder(f.store.as_ref(), RepeatType::Daily, NotificationChannel::Line, t);

        f.processor.process_at(&r, processed_at).await.unwrap();

        let stored = f.store.find_by_id(r.id).unwrap().unwrap();
        assert_eq!(stored.status, ReminderStatus::Active);
        assert_eq!(stored.next_fire_at, r.next_fire_at + chrono::Duration::days(4));
        assert!(stored.next_fire_at > processed_at);
    }

    #[tokio::test]
    async fn held_lock_skips_everything() {
        let f = fixture();
        let r = due_reminder(
            f.store.as_ref(),
            RepeatType::Once,
            NotificationChannel::Both,
            now() - chrono::Duration::minutes(1),
        );
        f.lock_store
            .insert_if_absent(&r.lock_key(), "node-b", now())
            .unwrap();

        assert_eq!(f.processor.process(&r).await.unwrap(), ProcessOutcome::Skipped);

        assert_eq!(f.store.find_by_id(r.id).unwrap().unwrap().status, ReminderStatus::Active);
        assert!(f.line.pushed.lock().unwrap().is_empty());
        assert!(f.email.sent.lock().unwrap().is_empty());
        assert!(f.logs.list_for_reminder(r.id).unwrap().is_empty());
        // node-b's lock is untouched
        assert!(!f.lock.try_lock(&r.lock_key()));
    }

    #[tokio::test]
    async fn both_with_line_failure_logs_each_channel_and_succeeds() {
        let store = Arc::new(SqliteReminderStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let line = FakeLine {
            fail: true,
            ..FakeLine::default()
        };
        let f = fixture_with(store, line, Arc::new(PassthroughEnhancer));
        let r = due_reminder(
            f.store.as_ref(),
            RepeatType::Once,
            NotificationChannel::Both,
            now() - chrono::Duration::minutes(1),
        );

        let outcome = f.processor.process(&r).await;
        assert!(outcome.is_ok());

        let logs = f.logs.list_for_reminder(r.id).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs
            .iter()
            .any(|l| l.method == DeliveryMethod::Line && l.status == DeliveryStatus::Failed));
        assert!(logs
            .iter()
            .any(|l| l.method == DeliveryMethod::Email && l.status == DeliveryStatus::Sent));
        assert!(f.lock.try_lock(&r.lock_key()));
    }

    #[tokio::test]
    async fn advance_failure_propagates_and_releases_lock() {
        let inner = SqliteReminderStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let store: Arc<dyn ReminderStore> = Arc::new(ReadOnlyStore(inner));
        let f = fixture_with(store, FakeLine::default(), Arc::new(PassthroughEnhancer));
        let r = due_reminder(
            f.store.as_ref(),
            RepeatType::Daily,
            NotificationChannel::Line,
            now() - chrono::Duration::minutes(1),
        );

        assert!(f.processor.process(&r).await.is_err());
        assert!(f.line.pushed.lock().unwrap().is_empty(), "no delivery without advance");
        assert!(f.lock.try_lock(&r.lock_key()), "lock must be released on error");
        // still due for the next tick
        assert_eq!(f.store.find_due(now()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enhanced_content_is_delivered() {
        let store = Arc::new(SqliteReminderStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let f = fixture_with(store, FakeLine::default(), Arc::new(Upper));
        let r = due_reminder(
            f.store.as_ref(),
            RepeatType::Once,
            NotificationChannel::Line,
            now() - chrono::Duration::minutes(1),
        );

        f.processor.process(&r).await.unwrap();
        assert_eq!(f.line.pushed.lock().unwrap().as_slice(), &["STRETCH".to_string()]);
    }

    #[tokio::test]
    async fn deleted_reminder_is_skipped() {
        let f = fixture();
        let r = due_reminder(
            f.store.as_ref(),
            RepeatType::Once,
            NotificationChannel::Line,
            now() - chrono::Duration::minutes(1),
        );
        f.store.delete(r.id).unwrap();

        assert_eq!(f.processor.process(&r).await.unwrap(), ProcessOutcome::Skipped);
        assert!(f.line.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stuck_enhancer_still_delivers_raw_content() {
        let store = Arc::new(SqliteReminderStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let f = fixture_with(store, FakeLine::default(), Arc::new(Stuck));
        let r = due_reminder(
            f.store.as_ref(),
            RepeatType::Once,
            NotificationChannel::Line,
            now() - chrono::Duration::minutes(1),
        );

        let outcome = tokio::time::timeout(Duration::from_secs(2), f.processor.process(&r))
            .await
            .expect("processing must not hang on the enhancer")
            .unwrap();

        assert!(matches!(outcome, ProcessOutcome::Delivered(rep) if rep.any_sent()));
        assert_eq!(f.line.pushed.lock().unwrap().as_slice(), &["stretch".to_string()]);
        assert_eq!(f.logs.list_for_reminder(r.id).unwrap().len(), 1);
        assert!(f.lock.try_lock(&r.lock_key()));
    }

    #[tokio::test]
    async fn repeated_firings_across_dst_gap_return_to_original_local_time() {
        let f = fixture();
        // daily 02:30 New York; that time does not exist on 2026-03-08
        let r = f
            .store
            .insert(&NewReminder {
                room_id: "R1".into(),
                content: "meds".into(),
                timezone: "America/New_York".into(),
                next_fire_at: Utc.with_ymd_and_hms(2026, 3, 7, 7, 30, 0).unwrap(),
                repeat_type: RepeatType::Daily,
                channel: NotificationChannel::Line,
                created_by: "U1".into(),
            })
            .unwrap();

        let mut fired = Vec::new();
        for _ in 0..3 {
            let current = f.store.find_by_id(r.id).unwrap().unwrap();
            f.processor.process_at(&current, current.next_fire_at).await.unwrap();
            fired.push(f.store.find_by_id(r.id).unwrap().unwrap().next_fire_at);
        }

        assert_eq!(
            fired,
            vec![
                Utc.with_ymd_and_hms(2026, 3, 8, 7, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 9, 6, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 10, 6, 30, 0).unwrap(),
            ]
        );
        assert_eq!(f.line.pushed.lock().unwrap().len(), 3);
    }
}
