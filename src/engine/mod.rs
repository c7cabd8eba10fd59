mod conflict;
mod error;
mod groups;
mod interval;
mod mutations;
mod queries;
mod recurrence;
mod store;

pub use error::SchedulingError;
pub use groups::deletion_plan;
pub use interval::{busy_blocks, merge_overlapping, overlaps};
pub use recurrence::{expand_weekly, WEEK_MS};
pub use store::CalendarStore;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, warn};
use ulid::Ulid;

use crate::ids::{IdSource, MonotonicUlids};
use crate::model::*;
use crate::notify::{Notification, Notifier};
use crate::permission::{GroupGrants, PermissionGate};
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<OwnerCalendar>>;
pub(crate) type CalendarGuard = OwnedRwLockWriteGuard<OwnerCalendar>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Record, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let written = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = written {
        // Every caller in the batch is told it failed, so none of it may
        // survive to replay.
        if let Err(rollback_err) = wal.rollback() {
            error!("WAL rollback after failed batch also failed: {rollback_err}");
        }
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<(Record, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The collaborators an engine consults but does not own.
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub gate: Arc<dyn PermissionGate>,
    pub ids: Arc<dyn IdSource>,
}

impl Collaborators {
    /// Group-granted capabilities and monotonic ULIDs.
    pub fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            gate: Arc::new(GroupGrants),
            ids: Arc::new(MonotonicUlids::new()),
        }
    }
}

pub struct Engine {
    pub(super) store: CalendarStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every mutation for its whole duration; compaction takes it
    /// exclusively so a snapshot never misses an in-flight commit.
    pub(super) commit_gate: RwLock<()>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) gate: Arc<dyn PermissionGate>,
    pub(super) ids: Arc<dyn IdSource>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notifier: Arc<dyn Notifier>) -> io::Result<Self> {
        Self::with_collaborators(wal_path, Collaborators::with_notifier(notifier))
    }

    pub fn with_collaborators(wal_path: PathBuf, parts: Collaborators) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: CalendarStore::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notifier: parts.notifier,
            gate: parts.gate,
            ids: parts.ids,
        };

        // Replay: we are the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may
        // run inside an async context (e.g. lazy tenant creation).
        for record in &records {
            engine.store.apply_global(record);
            for owner in record.owners() {
                let cal = engine.store.calendar_or_insert(owner);
                match cal.try_write() {
                    Ok(mut guard) => engine.store.apply_record(&mut guard, record),
                    Err(_) => warn!(%owner, "replay: calendar unexpectedly locked, record skipped"),
                }
            }
        }

        Ok(engine)
    }

    /// Write a record to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, record: &Record) -> Result<(), SchedulingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| SchedulingError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulingError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::Persistence(e.to_string()))
    }

    /// Write-lock every listed owner's calendar, in sorted order so that two
    /// multi-owner requests can never wait on each other.
    pub(super) async fn lock_calendars(
        &self,
        owners: &[ActorId],
    ) -> Result<BTreeMap<ActorId, CalendarGuard>, SchedulingError> {
        let mut sorted = owners.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = BTreeMap::new();
        for owner in sorted {
            let cal = self
                .store
                .calendar(&owner)
                .ok_or(SchedulingError::NotFound(owner))?;
            guards.insert(owner, cal.write_owned().await);
        }
        Ok(guards)
    }

    /// Lock the calendar that owns `group_id`. Re-checks ownership after the
    /// lock is held, since the group may have been deleted while we waited.
    pub(super) async fn lock_group(
        &self,
        group_id: &Ulid,
    ) -> Result<(ActorId, CalendarGuard), SchedulingError> {
        let owner = self
            .store
            .owner_of_group(group_id)
            .ok_or(SchedulingError::NotFound(*group_id))?;
        let mut guards = self.lock_calendars(&[owner]).await?;
        let guard = guards
            .remove(&owner)
            .ok_or(SchedulingError::NotFound(owner))?;
        if guard.group(group_id).is_none() {
            return Err(SchedulingError::NotFound(*group_id));
        }
        Ok((owner, guard))
    }

    /// WAL-append, then apply to every locked calendar the record touches.
    pub(super) async fn commit(
        &self,
        record: &Record,
        guards: &mut BTreeMap<ActorId, CalendarGuard>,
    ) -> Result<(), SchedulingError> {
        self.wal_append(record).await?;
        self.store.apply_global(record);
        for guard in guards.values_mut() {
            self.store.apply_record(guard, record);
        }
        Ok(())
    }

    /// Owner always passes; everyone else is up to the gate.
    pub(super) fn authorize(
        &self,
        actor: ActorId,
        group: &Group,
        capability: Capability,
    ) -> Result<(), SchedulingError> {
        if group.is_owner(actor) || self.gate.has_capability(actor, group, capability) {
            return Ok(());
        }
        Err(SchedulingError::Forbidden {
            group_id: group.id,
            group_name: group.name.clone(),
            action: capability.label(),
        })
    }

    /// Hand notifications to the notifier without waiting. A failure is
    /// logged and counted, nothing more.
    pub(super) fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            if notification.recipients.is_empty() {
                continue;
            }
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                let group_id = notification.group_id;
                if let Err(e) = notifier.notify_group(notification).await {
                    metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                    warn!(%group_id, "schedule notification failed: {e}");
                }
            });
        }
    }
}
