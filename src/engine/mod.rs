mod access;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use access::require_admin;
pub use conflict::{check_working_hours, find_conflict};
pub use error::{EngineError, Entity, ErrorKind};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::wal::Wal;

pub type SharedTrainerState = Arc<RwLock<TrainerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
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
                if let Err(e) = &result {
                    tracing::error!("WAL flush failed for {} events: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
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
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        // Appends are always batched by the caller.
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// One gym's scheduling state: the directory it books against and every appointment,
/// held in memory and made durable through the WAL.
pub struct Engine {
    pub(super) trainers: DashMap<TrainerId, SharedTrainerState>,
    pub(super) services: DashMap<ServiceId, ServiceInfo>,
    pub(super) members: DashMap<MemberId, MemberInfo>,
    pub(super) principals: DashMap<String, MemberId>,
    /// Reverse lookup: appointment id → trainer id
    pub(super) appointment_to_trainer: DashMap<AppointmentId, TrainerId>,
    pub(super) next_appointment_id: AtomicU64,
    /// Serializes directory writes so check-then-insert on new records can't race.
    pub(super) directory_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
}

/// Apply an event directly to a TrainerState. The caller holds the lock.
fn apply_to_trainer(ts: &mut TrainerState, event: &Event) {
    match event {
        Event::TrainerPut {
            name,
            working_hours,
            ..
        } => {
            ts.name = name.clone();
            ts.working_hours = *working_hours;
        }
        Event::AppointmentCreated {
            id,
            member_id,
            trainer_id,
            service_id,
            span,
            fee,
            created_at,
        } => {
            ts.insert_appointment(Appointment {
                id: *id,
                member_id: *member_id,
                trainer_id: *trainer_id,
                service_id: *service_id,
                span: *span,
                fee: *fee,
                status: AppointmentStatus::Pending,
                created_at: *created_at,
            });
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            if let Some(appointment) = ts.appointment_mut(*id) {
                appointment.status = *status;
            }
        }
        // Services and members live outside trainer state.
        Event::ServicePut { .. } | Event::MemberPut { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_clock(wal_path, Arc::new(SystemClock))
    }

    pub fn with_clock(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            trainers: DashMap::new(),
            services: DashMap::new(),
            members: DashMap::new(),
            principals: DashMap::new(),
            appointment_to_trainer: DashMap::new(),
            next_appointment_id: AtomicU64::new(1),
            directory_lock: Mutex::new(()),
            wal_tx,
            clock,
        };

        // Replay into plain state first; nothing else can see it yet, so no locks.
        let mut trainers: HashMap<TrainerId, TrainerState> = HashMap::new();
        let mut next_id: AppointmentId = 1;
        for event in &events {
            match event {
                Event::TrainerPut {
                    id,
                    name,
                    working_hours,
                } => {
                    trainers
                        .entry(*id)
                        .or_insert_with(|| TrainerState::new(*id, name.clone(), *working_hours));
                    if let Some(ts) = trainers.get_mut(id) {
                        apply_to_trainer(ts, event);
                    }
                }
                Event::ServicePut { .. } | Event::MemberPut { .. } => engine.apply_directory_event(event),
                Event::AppointmentCreated { id, trainer_id, .. } => {
                    if let Some(ts) = trainers.get_mut(trainer_id) {
                        apply_to_trainer(ts, event);
                        engine.appointment_to_trainer.insert(*id, *trainer_id);
                    }
                    next_id = next_id.max(id + 1);
                }
                Event::AppointmentStatusChanged { trainer_id, .. } => {
                    if let Some(ts) = trainers.get_mut(trainer_id) {
                        apply_to_trainer(ts, event);
                    }
                }
            }
        }
        for (id, ts) in trainers {
            engine.trainers.insert(id, Arc::new(RwLock::new(ts)));
        }
        engine
            .next_appointment_id
            .store(next_id, std::sync::atomic::Ordering::SeqCst);

        Ok(engine)
    }

    /// Service and member records: plain map updates, no trainer lock involved.
    pub(super) fn apply_directory_event(&self, event: &Event) {
        match event {
            Event::ServicePut {
                id,
                name,
                duration_minutes,
                fee,
            } => {
                self.services.insert(
                    *id,
                    ServiceInfo {
                        id: *id,
                        name: name.clone(),
                        duration_minutes: *duration_minutes,
                        fee: *fee,
                    },
                );
            }
            Event::MemberPut {
                id,
                name,
                principal,
            } => {
                let previous = self.members.insert(
                    *id,
                    MemberInfo {
                        id: *id,
                        name: name.clone(),
                        principal: principal.clone(),
                    },
                );
                if let Some(prev) = previous
                    && prev.principal != *principal
                {
                    self.principals.remove(&prev.principal);
                }
                self.principals.insert(principal.clone(), *id);
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_trainer(&self, id: &TrainerId) -> Option<SharedTrainerState> {
        self.trainers.get(id).map(|e| e.value().clone())
    }

    pub fn get_trainer_for_appointment(&self, appointment_id: &AppointmentId) -> Option<TrainerId> {
        self.appointment_to_trainer.get(appointment_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        ts: &mut TrainerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_trainer(ts, event);
        if let Event::AppointmentCreated { id, trainer_id, .. } = event {
            self.appointment_to_trainer.insert(*id, *trainer_id);
        }
        Ok(())
    }

    /// Lookup appointment → trainer, get trainer, acquire write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<TrainerState>, EngineError> {
        let trainer_id = self
            .get_trainer_for_appointment(&appointment_id)
            .ok_or(EngineError::NotFound(Entity::Appointment(appointment_id)))?;
        let ts = self
            .get_trainer(&trainer_id)
            .ok_or(EngineError::NotFound(Entity::Trainer(trainer_id)))?;
        Ok(ts.write_owned().await)
    }

    /// Lookup appointment → trainer, get trainer, acquire read lock.
    pub(super) async fn resolve_appointment_read(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<TrainerState>, EngineError> {
        let trainer_id = self
            .get_trainer_for_appointment(&appointment_id)
            .ok_or(EngineError::NotFound(Entity::Appointment(appointment_id)))?;
        let ts = self
            .get_trainer(&trainer_id)
            .ok_or(EngineError::NotFound(Entity::Trainer(trainer_id)))?;
        Ok(ts.read_owned().await)
    }

    /// Snapshot of every trainer handle, so no DashMap guard is held across an await.
    pub(super) fn trainer_handles(&self) -> Vec<(TrainerId, SharedTrainerState)> {
        let mut handles: Vec<_> = self
            .trainers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }
}
