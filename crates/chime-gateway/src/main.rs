//! # Chime gateway
//!
//! Runs the reminder scheduler, delivery transports and the confirm-link
//! HTTP endpoint, and offers a few operator commands against the same
//! database.
//!
//! Usage:
//!   chime-gateway                                   # same as `serve`
//!   chime-gateway add --room C1 --content "Stand-up" --at "2026-11-02 09:30" \
//!       --timezone Asia/Taipei --repeat daily
//!   chime-gateway list --room C1
//!   chime-gateway delete 42
//!   chime-gateway add-email --room C1 --address ops@example.com
//!   chime-gateway disable-email --room C1 --address ops@example.com

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use chime_channels::{
    ContentEnhancer, EmailTransport, LineTransport, NotificationRouter, PassthroughEnhancer,
};
use chime_core::{ChimeConfig, NewReminder, NotificationChannel, RepeatType};
use chime_scheduler::{
    DistributedLock, LockJanitor, ReminderProcessor, ReminderStore, SchedulerEngine,
    SqliteEmailDirectory, SqliteLockStore, SqliteReminderLogStore, SqliteReminderStore,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod app;
mod email;
mod enhance;
mod http;
mod line;

#[derive(Parser)]
#[command(name = "chime-gateway", version, about = "Reminder scheduler and delivery gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path (falls back to CHIME_CONFIG, then ~/.chime/chime.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop and HTTP server
    Serve,

    /// Create a reminder
    Add {
        /// LINE room / group / user id
        #[arg(long)]
        room: String,

        #[arg(long)]
        content: String,

        /// First fire time: RFC 3339, or "YYYY-MM-DD HH:MM" in --timezone
        #[arg(long)]
        at: String,

        /// IANA zone the repeat follows
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// once | daily | weekly
        #[arg(long, default_value = "once")]
        repeat: String,

        /// line | email | both
        #[arg(long, default_value = "line")]
        channel: String,

        #[arg(long, default_value = "cli")]
        created_by: String,
    },

    /// List the reminders of a room
    List {
        #[arg(long)]
        room: String,
    },

    /// Delete a reminder
    Delete { id: i64 },

    /// Subscribe an email address to a room's reminders
    AddEmail {
        #[arg(long)]
        room: String,

        #[arg(long)]
        address: String,
    },

    /// Stop sending a room's reminders to an email address
    DisableEmail {
        #[arg(long)]
        room: String,

        #[arg(long)]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("chime_gateway=info,chime_scheduler=info,chime_channels=info")
        }))
        .init();

    // load config: --config > CHIME_CONFIG env > ~/.chime/chime.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("CHIME_CONFIG").ok());
    let config = ChimeConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ChimeConfig::default()
    });

    let db = Database::open(&config.database.path)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, db).await,
        Commands::Add {
            room,
            content,
            at,
            timezone,
            repeat,
            channel,
            created_by,
        } => {
            let tz: Tz = timezone
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown timezone: {timezone}"))?;
            let new = NewReminder {
                room_id: room,
                content,
                next_fire_at: parse_fire_time(&at, tz)?,
                timezone,
                repeat_type: repeat.parse::<RepeatType>()?,
                channel: channel.parse::<NotificationChannel>()?,
                created_by,
            };
            let store = SqliteReminderStore::new(db.connect()?)?;
            let reminder = store.insert(&new)?;
            println!(
                "created reminder {} ({}, next at {})",
                reminder.id, reminder.repeat_type, reminder.next_fire_at
            );
            Ok(())
        }
        Commands::List { room } => {
            let store = SqliteReminderStore::new(db.connect()?)?;
            let reminders = store.find_by_room(&room)?;
            if reminders.is_empty() {
                println!("no reminders for {room}");
            }
            for r in reminders {
                println!(
                    "{:>6}  {:<9}  {:<7}  {:<5}  {}  {}",
                    r.id,
                    r.status.as_str(),
                    r.repeat_type.as_str(),
                    r.channel.as_str(),
                    r.next_fire_at,
                    r.content
                );
            }
            Ok(())
        }
        Commands::Delete { id } => {
            let store = SqliteReminderStore::new(db.connect()?)?;
            if store.delete(id)? {
                println!("deleted reminder {id}");
            } else {
                println!("reminder {id} not found");
            }
            Ok(())
        }
        Commands::AddEmail { room, address } => {
            let directory = SqliteEmailDirectory::new(db.connect()?)?;
            directory.add_address(&room, &address)?;
            println!("{address} will receive reminders for {room}");
            Ok(())
        }
        Commands::DisableEmail { room, address } => {
            let directory = SqliteEmailDirectory::new(db.connect()?)?;
            if directory.set_enabled(&room, &address, false)? {
                println!("{address} will no longer receive reminders for {room}");
            } else {
                println!("{address} is not subscribed to {room}");
            }
            Ok(())
        }
    }
}

async fn serve(config: ChimeConfig, db: Database) -> Result<()> {
    let instance_id = config.scheduler.resolve_instance_id();
    info!(%instance_id, "starting chime gateway");
    if config.scheduler.processing_budget_secs() >= config.scheduler.lock_ttl_secs {
        warn!(
            budget_secs = config.scheduler.processing_budget_secs(),
            lock_ttl_secs = config.scheduler.lock_ttl_secs,
            "enhance + send timeouts reach the lock TTL; a slow firing may be delivered twice"
        );
    }

    // each subsystem gets its own connection
    let store = Arc::new(SqliteReminderStore::new(db.connect()?)?);
    let logs = Arc::new(SqliteReminderLogStore::new(db.connect()?)?);
    let directory = Arc::new(SqliteEmailDirectory::new(db.connect()?)?);
    let lock = Arc::new(DistributedLock::new(
        Arc::new(SqliteLockStore::new(db.connect()?)?),
        instance_id.clone(),
        Duration::from_secs(config.scheduler.lock_ttl_secs),
    ));

    let router = Arc::new(NotificationRouter::new(
        build_line(&config),
        build_email(&config),
        directory,
        logs.clone(),
        Duration::from_secs(config.scheduler.send_timeout_secs),
    ));
    let processor = Arc::new(ReminderProcessor::new(
        store.clone(),
        lock.clone(),
        router,
        build_enhancer(&config),
    )
    .with_enhance_timeout(Duration::from_secs(config.scheduler.enhance_timeout_secs)));
    let engine = SchedulerEngine::new(
        store,
        processor,
        Duration::from_millis(config.scheduler.tick_interval_ms),
        config.scheduler.max_concurrent,
    );
    let janitor = LockJanitor::new(
        lock,
        Duration::from_secs(config.scheduler.lock_sweep_interval_secs),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));
    let janitor_task = tokio::spawn(janitor.run(shutdown_rx));

    let state = Arc::new(app::AppState { instance_id, logs });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!("Chime gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop the loops; an in-flight tick finishes first
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(engine_task, janitor_task);
    info!("chime gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn build_line(config: &ChimeConfig) -> Arc<dyn LineTransport> {
    match &config.line {
        Some(line) => Arc::new(line::LinePushClient::new(line)),
        None => {
            warn!("[line] not configured; LINE deliveries will be logged as failed");
            Arc::new(line::UnconfiguredLine)
        }
    }
}

fn build_email(config: &ChimeConfig) -> Arc<dyn EmailTransport> {
    let Some(email) = &config.email else {
        warn!("[email] not configured; email deliveries will be logged as failed");
        return Arc::new(email::UnconfiguredEmail);
    };
    match email::SmtpEmailTransport::new(email) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            warn!("email transport disabled: {e}");
            Arc::new(email::UnconfiguredEmail)
        }
    }
}

fn build_enhancer(config: &ChimeConfig) -> Arc<dyn ContentEnhancer> {
    match &config.enhancer {
        Some(enhancer) => {
            info!(model = %enhancer.model, "reminder enhancement enabled");
            Arc::new(enhance::OpenAiEnhancer::new(enhancer))
        }
        None => Arc::new(PassthroughEnhancer),
    }
}

/// Accept RFC 3339, or a wall-clock time in `tz`.
fn parse_fire_time(input: &str, tz: Tz) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Ok(t.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M")
        .with_context(|| format!("cannot parse time {input:?}"))?;
    match tz.from_local_datetime(&naive).earliest() {
        Some(t) => Ok(t.with_timezone(&Utc)),
        None => bail!("{input} does not exist in {tz} (DST gap)"),
    }
}

/// SQLite file shared by every store.
struct Database {
    path: String,
}

impl Database {
    /// Create the parent directory, switch to WAL and create the schema.
    fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        info!(path = %path, "opening SQLite database");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        chime_scheduler::db::init_db(&conn)?;
        Ok(Self {
            path: path.to_string(),
        })
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}
