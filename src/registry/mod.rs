mod mutations;
mod queries;
mod state;

pub use state::RegistryState;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{error, info};

use crate::error::ScheduleError;
use crate::model::*;
use crate::wal::Wal;

pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(5);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        /// Not written once this has passed; the caller is told it expired.
        deadline: Instant,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

struct PendingAppend {
    event: Event,
    deadline: Instant,
    response: oneshot::Sender<io::Result<()>>,
}

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
///
/// Every queued append is settled here: it is either durably written or
/// refused without touching the file, and the reply says which. Stops if a
/// failed batch cannot be rolled back, after which every write fails.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append {
            event,
            deadline,
            response,
        } = cmd
        else {
            if !handle_control(&mut wal, cmd) {
                break;
            }
            continue;
        };

        let mut batch = vec![PendingAppend {
            event,
            deadline,
            response,
        }];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append {
                    event,
                    deadline,
                    response,
                }) => batch.push(PendingAppend {
                    event,
                    deadline,
                    response,
                }),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        if !commit_batch(&mut wal, batch) {
            break;
        }
        if let Some(cmd) = deferred
            && !handle_control(&mut wal, cmd)
        {
            break;
        }
    }
}

/// Write one batch under a single fsync. A failure anywhere rewinds the file
/// to where the batch started, so either all of it is on disk or none.
/// Returns `false` when the rewind itself failed.
fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) -> bool {
    let now = Instant::now();
    let (live, expired): (Vec<_>, Vec<_>) = batch.into_iter().partition(|p| p.deadline > now);
    for pending in expired {
        let _ = pending.response.send(Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "storage deadline passed before the write started",
        )));
    }
    if live.is_empty() {
        return true;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(live.len() as f64);
    let started = std::time::Instant::now();

    let mut healthy = true;
    let result = match wal.mark() {
        Ok(mark) => {
            let written = live
                .iter()
                .try_for_each(|p| wal.append_buffered(&p.event))
                .and_then(|()| wal.flush_sync());
            if let Err(e) = &written
                && let Err(rewind) = wal.rewind(mark)
            {
                error!("WAL rewind after failed append failed: {rewind} (append error: {e})");
                healthy = false;
            }
            written
        }
        Err(e) => Err(e),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for pending in live {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = pending.response.send(reply);
    }
    healthy
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
            true
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            true
        }
        WalCommand::Append {
            event,
            deadline,
            response,
        } => commit_batch(
            wal,
            vec![PendingAppend {
                event,
                deadline,
                response,
            }],
        ),
    }
}

/// The authoritative reservation set.
///
/// One `RwLock` guards the whole state. Writers hold it across
/// validate → WAL append → apply, so a slot check and the insert it gates
/// can never interleave with another writer.
pub struct SlotRegistry {
    state: RwLock<RegistryState>,
    wal_tx: mpsc::Sender<WalCommand>,
    wal_path: PathBuf,
    storage_timeout: Duration,
}

impl SlotRegistry {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called from inside a tokio runtime.
    pub fn open(wal_path: impl AsRef<Path>, storage_timeout: Duration) -> io::Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut state = RegistryState::new();
        for event in &events {
            state.apply(event);
        }
        info!(
            "registry loaded {} reservations ({} active) from {}",
            state.len(),
            state.active_count(),
            wal_path.display()
        );
        metrics::gauge!(crate::observability::ACTIVE_RESERVATIONS).set(state.active_count() as f64);

        Ok(Self {
            state: RwLock::new(state),
            wal_tx,
            wal_path,
            storage_timeout,
        })
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    /// Queue a command for the writer task. A command that could not be
    /// queued by `deadline` was never sent.
    async fn enqueue(&self, cmd: WalCommand, deadline: Instant) -> Result<(), ScheduleError> {
        match tokio::time::timeout_at(deadline, self.wal_tx.send(cmd)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(storage_failure("WAL writer shut down")),
            Err(_) => Err(storage_failure("timed out queueing WAL write")),
        }
    }

    /// Send a control command and wait for its reply, bounded by the storage
    /// timeout. Only for commands whose late completion leaves the logged
    /// state unchanged.
    async fn wal_request<T>(
        &self,
        cmd: WalCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ScheduleError> {
        let deadline = Instant::now() + self.storage_timeout;
        self.enqueue(cmd, deadline).await?;
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(storage_failure("WAL writer dropped response")),
            Err(_) => Err(storage_failure("timed out waiting for WAL writer")),
        }
    }

    /// Append one event. The storage timeout bounds how long the event may
    /// wait before the writer starts on it; once queued, the writer's reply
    /// is awaited so the caller never guesses at what reached the log.
    async fn wal_append(&self, event: &Event) -> Result<(), ScheduleError> {
        let deadline = Instant::now() + self.storage_timeout;
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            event: event.clone(),
            deadline,
            response: tx,
        };
        self.enqueue(cmd, deadline).await?;
        match rx.await {
            Ok(reply) => reply.map_err(|e| storage_failure(e.to_string())),
            Err(_) => Err(storage_failure("WAL writer dropped response")),
        }
    }

    /// Durably append `event`, then apply it. Caller holds the write lock.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut RegistryState,
        event: &Event,
    ) -> Result<(), ScheduleError> {
        self.wal_append(event).await?;
        state.apply(event);
        metrics::gauge!(crate::observability::ACTIVE_RESERVATIONS).set(state.active_count() as f64);
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> Result<u64, ScheduleError> {
        let (tx, rx) = oneshot::channel();
        self.wal_request(WalCommand::AppendsSinceCompact { response: tx }, rx)
            .await
    }

    /// Rewrite the WAL as one `ReservationCreated` per stored reservation.
    ///
    /// Holds the write lock for the duration so no append can land between
    /// the snapshot and the file swap.
    pub async fn compact(&self) -> Result<usize, ScheduleError> {
        let guard = self.state.write().await;
        let events = guard.snapshot_events();
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_request(WalCommand::Compact { events, response: tx }, rx)
            .await?
            .map_err(|e| storage_failure(e.to_string()))?;
        drop(guard);
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(count)
    }
}

fn storage_failure(msg: impl Into<String>) -> ScheduleError {
    ScheduleError::TransientStorageFailure(msg.into())
}
