use std::sync::Arc;
use std::sync::atomic::Ordering;

use rust_decimal::Decimal;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;
use crate::observability::BOOKINGS_TOTAL;

use super::conflict::{check_working_hours, find_conflict, validate_span};
use super::{Engine, EngineError, Entity, WalCommand};

fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidRequest(what));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    /// Register a trainer or replace its name and working hours.
    /// Existing appointments are not re-validated against a new window.
    pub async fn put_trainer(
        &self,
        id: TrainerId,
        name: String,
        working_hours: Option<WorkingHours>,
    ) -> Result<(), EngineError> {
        validate_name(&name, "trainer name must not be empty")?;
        let _directory = self.directory_lock.lock().await;

        let event = Event::TrainerPut {
            id,
            name: name.clone(),
            working_hours,
        };
        match self.get_trainer(&id) {
            Some(ts) => {
                let mut guard = ts.write().await;
                self.persist_and_apply(&mut guard, &event).await?;
            }
            None => {
                if self.trainers.len() >= MAX_TRAINERS_PER_GYM {
                    return Err(EngineError::LimitExceeded("too many trainers"));
                }
                self.wal_append(&event).await?;
                let ts = TrainerState::new(id, name, working_hours);
                self.trainers.insert(id, Arc::new(RwLock::new(ts)));
            }
        }
        info!("trainer {id} registered");
        Ok(())
    }

    /// Register a service or replace it. Booked appointments keep the fee they were
    /// booked at.
    pub async fn put_service(
        &self,
        id: ServiceId,
        name: String,
        duration_minutes: u32,
        fee: Decimal,
    ) -> Result<(), EngineError> {
        validate_name(&name, "service name must not be empty")?;
        if !(MIN_SERVICE_MINUTES..=MAX_SERVICE_MINUTES).contains(&duration_minutes) {
            return Err(EngineError::InvalidRequest(
                "service duration must be between 10 and 300 minutes",
            ));
        }
        if fee.is_sign_negative() || fee > Decimal::from(MAX_SERVICE_FEE) {
            return Err(EngineError::InvalidRequest(
                "service fee must be between 0 and 10000",
            ));
        }
        let _directory = self.directory_lock.lock().await;
        if !self.services.contains_key(&id) && self.services.len() >= MAX_SERVICES_PER_GYM {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        let event = Event::ServicePut {
            id,
            name,
            duration_minutes,
            fee,
        };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);
        info!("service {id} registered");
        Ok(())
    }

    /// Register a member or replace it. A principal maps to at most one member.
    pub async fn put_member(
        &self,
        id: MemberId,
        name: String,
        principal: String,
    ) -> Result<(), EngineError> {
        validate_name(&name, "member name must not be empty")?;
        if principal.trim().is_empty() {
            return Err(EngineError::InvalidRequest("principal must not be empty"));
        }
        if principal.len() > MAX_PRINCIPAL_LEN {
            return Err(EngineError::LimitExceeded("principal too long"));
        }
        let _directory = self.directory_lock.lock().await;
        if let Some(owner) = self.principals.get(&principal)
            && *owner.value() != id
        {
            return Err(EngineError::AlreadyExists(Entity::Principal(principal)));
        }
        if !self.members.contains_key(&id) && self.members.len() >= MAX_MEMBERS_PER_GYM {
            return Err(EngineError::LimitExceeded("too many members"));
        }

        let event = Event::MemberPut {
            id,
            name,
            principal,
        };
        self.wal_append(&event).await?;
        self.apply_directory_event(&event);
        info!("member {id} registered");
        Ok(())
    }

    /// Book `service_id` with `trainer_id` for `member_id` starting at `start`.
    ///
    /// Checks run in a fixed order and the first failure wins: past start, unknown
    /// member/trainer/service, invalid interval, overlap with a slot-holding
    /// appointment, then the trainer's working hours. The overlap check, the WAL
    /// append and the insert all happen under the trainer's write lock.
    pub async fn create_appointment(
        &self,
        member_id: MemberId,
        trainer_id: TrainerId,
        service_id: ServiceId,
        start: Ms,
    ) -> Result<Appointment, EngineError> {
        let now = self.clock.now_ms();
        if start < now {
            return Err(EngineError::InvalidRequest("appointment start is in the past"));
        }
        if !self.members.contains_key(&member_id) {
            return Err(EngineError::NotFound(Entity::Member(member_id)));
        }
        let ts = self
            .get_trainer(&trainer_id)
            .ok_or(EngineError::NotFound(Entity::Trainer(trainer_id)))?;
        let service = self
            .service(service_id)
            .ok_or(EngineError::NotFound(Entity::Service(service_id)))?;

        let end = start
            .checked_add(service.duration_ms())
            .ok_or(EngineError::InvalidRequest("timestamp out of range"))?;
        let span = Span { start, end };
        validate_span(&span)?;

        let mut guard = ts.write().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many appointments on trainer"));
        }
        if let Some(existing) = find_conflict(&guard, &span, None) {
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "conflict").increment(1);
            debug!("booking for trainer {trainer_id} overlaps appointment {existing}");
            return Err(EngineError::Conflict(existing));
        }
        if let Err(e) = check_working_hours(&guard, &span) {
            metrics::counter!(BOOKINGS_TOTAL, "outcome" => "out_of_hours").increment(1);
            return Err(e);
        }

        let id = self.next_appointment_id.fetch_add(1, Ordering::SeqCst);
        let event = Event::AppointmentCreated {
            id,
            member_id,
            trainer_id,
            service_id,
            span,
            fee: service.fee,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => "created").increment(1);
        info!(
            "appointment {id} booked: member {member_id}, trainer {trainer_id}, {}",
            format_instant(start)
        );

        guard
            .appointment(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Appointment(id)))
    }

    /// Move an appointment to `target`. Same-state requests for a terminal or
    /// approved status succeed without writing anything.
    pub async fn set_status(
        &self,
        id: AppointmentId,
        target: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let mut guard = self.resolve_appointment_write(id).await?;
        let current = guard
            .appointment(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Appointment(id)))?;

        match current.status.step(target) {
            None => Err(EngineError::InvalidTransition {
                from: current.status,
                to: target,
            }),
            Some(false) => Ok(current),
            Some(true) => {
                let event = Event::AppointmentStatusChanged {
                    id,
                    trainer_id: current.trainer_id,
                    status: target,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                info!("appointment {id}: {} -> {target}", current.status);
                Ok(Appointment {
                    status: target,
                    ..current
                })
            }
        }
    }

    pub async fn cancel_appointment(&self, id: AppointmentId) -> Result<Appointment, EngineError> {
        self.set_status(id, AppointmentStatus::Cancelled).await
    }

    /// Does not re-check for overlaps: creation already serialized the slot.
    pub async fn approve_appointment(&self, id: AppointmentId) -> Result<Appointment, EngineError> {
        self.set_status(id, AppointmentStatus::Approved).await
    }

    pub async fn reject_appointment(&self, id: AppointmentId) -> Result<Appointment, EngineError> {
        self.set_status(id, AppointmentStatus::Rejected).await
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Holds the directory lock and every trainer write lock until the rewrite is done,
    /// so no append can land between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _directory = self.directory_lock.lock().await;
        let mut guards = Vec::new();
        for (_, ts) in self.trainer_handles() {
            guards.push(ts.write_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::TrainerPut {
                id: guard.id,
                name: guard.name.clone(),
                working_hours: guard.working_hours,
            });
        }
        let mut services: Vec<ServiceInfo> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(|s| Event::ServicePut {
            id: s.id,
            name: s.name,
            duration_minutes: s.duration_minutes,
            fee: s.fee,
        }));
        let mut members: Vec<MemberInfo> = self.members.iter().map(|e| e.value().clone()).collect();
        members.sort_by_key(|m| m.id);
        events.extend(members.into_iter().map(|m| Event::MemberPut {
            id: m.id,
            name: m.name,
            principal: m.principal,
        }));

        let mut appointments: Vec<&Appointment> =
            guards.iter().flat_map(|g| g.appointments.iter()).collect();
        appointments.sort_by_key(|a| a.id);
        for a in appointments {
            events.push(Event::AppointmentCreated {
                id: a.id,
                member_id: a.member_id,
                trainer_id: a.trainer_id,
                service_id: a.service_id,
                span: a.span,
                fee: a.fee,
                created_at: a.created_at,
            });
            if a.status != AppointmentStatus::Pending {
                events.push(Event::AppointmentStatusChanged {
                    id: a.id,
                    trainer_id: a.trainer_id,
                    status: a.status,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
