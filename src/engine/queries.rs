use chrono::NaiveDate;

use crate::model::*;

use super::{Engine, EngineError, Entity};

/// Ascending by start, ties broken by id.
fn sort_appointments(appointments: &mut [Appointment]) {
    appointments.sort_by_key(|a| (a.span.start, a.id));
}

fn within(a: &Appointment, from: Option<Ms>, until: Option<Ms>) -> bool {
    from.is_none_or(|f| a.span.start >= f) && until.is_none_or(|u| a.span.end <= u)
}

impl Engine {
    pub async fn trainer(&self, id: TrainerId) -> Option<TrainerInfo> {
        let ts = self.get_trainer(&id)?;
        let guard = ts.read().await;
        Some(guard.info())
    }

    pub fn service(&self, id: ServiceId) -> Option<ServiceInfo> {
        self.services.get(&id).map(|e| e.value().clone())
    }

    pub fn member(&self, id: MemberId) -> Option<MemberInfo> {
        self.members.get(&id).map(|e| e.value().clone())
    }

    pub fn member_for_principal(&self, principal: &str) -> Option<MemberId> {
        self.principals.get(principal).map(|e| *e.value())
    }

    pub async fn list_trainers(&self) -> Vec<TrainerInfo> {
        let mut out = Vec::new();
        for (_, ts) in self.trainer_handles() {
            out.push(ts.read().await.info());
        }
        out
    }

    pub fn list_services(&self) -> Vec<ServiceInfo> {
        let mut out: Vec<ServiceInfo> = self.services.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn list_members(&self) -> Vec<MemberInfo> {
        let mut out: Vec<MemberInfo> = self.members.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|m| m.id);
        out
    }

    pub async fn get_appointment(&self, id: AppointmentId) -> Result<Appointment, EngineError> {
        let guard = self.resolve_appointment_read(id).await?;
        guard
            .appointment(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Appointment(id)))
    }

    /// Every appointment matching `keep`, across all trainers.
    async fn collect_where(&self, keep: impl Fn(&Appointment) -> bool) -> Vec<Appointment> {
        let mut out = Vec::new();
        for (_, ts) in self.trainer_handles() {
            let guard = ts.read().await;
            out.extend(guard.appointments.iter().filter(|a| keep(a)).cloned());
        }
        sort_appointments(&mut out);
        out
    }

    pub async fn list_by_member(
        &self,
        member_id: MemberId,
        from: Option<Ms>,
        until: Option<Ms>,
    ) -> Result<Vec<Appointment>, EngineError> {
        if !self.members.contains_key(&member_id) {
            return Err(EngineError::NotFound(Entity::Member(member_id)));
        }
        Ok(self
            .collect_where(|a| a.member_id == member_id && within(a, from, until))
            .await)
    }

    pub async fn list_by_trainer(
        &self,
        trainer_id: TrainerId,
        from: Option<Ms>,
        until: Option<Ms>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let ts = self
            .get_trainer(&trainer_id)
            .ok_or(EngineError::NotFound(Entity::Trainer(trainer_id)))?;
        let guard = ts.read().await;
        let mut out: Vec<Appointment> = guard
            .appointments
            .iter()
            .filter(|a| within(a, from, until))
            .cloned()
            .collect();
        sort_appointments(&mut out);
        Ok(out)
    }

    pub async fn list_by_status(&self, status: AppointmentStatus) -> Vec<Appointment> {
        self.collect_where(|a| a.status == status).await
    }

    /// Appointments whose start falls on a UTC date in `[start_date, end_date]`.
    pub async fn list_by_date_range(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<Appointment>, EngineError> {
        if start_date > end_date {
            return Err(EngineError::InvalidRequest("start date is after end date"));
        }
        Ok(self
            .collect_where(|a| {
                let day = utc_date(a.span.start);
                start_date <= day && day <= end_date
            })
            .await)
    }

    pub async fn list_all(&self) -> Vec<Appointment> {
        self.collect_where(|_| true).await
    }

    pub async fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for (_, ts) in self.trainer_handles() {
            let guard = ts.read().await;
            for a in &guard.appointments {
                counts.record(a.status);
            }
        }
        counts
    }

    /// Whole-day check: the instant's time of day must be inside the trainer's window,
    /// and the trainer must have no slot-holding appointment starting that UTC day.
    pub async fn is_trainer_available(
        &self,
        trainer_id: TrainerId,
        at: Ms,
    ) -> Result<bool, EngineError> {
        let ts = self
            .get_trainer(&trainer_id)
            .ok_or(EngineError::NotFound(Entity::Trainer(trainer_id)))?;
        let guard = ts.read().await;
        Ok(free_all_day(&guard, at))
    }

    /// Every trainer `is_trainer_available` would accept at `at`, ordered by name.
    pub async fn available_trainers(&self, at: Ms) -> Vec<TrainerInfo> {
        let mut out = Vec::new();
        for (_, ts) in self.trainer_handles() {
            let guard = ts.read().await;
            if free_all_day(&guard, at) {
                out.push(guard.info());
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }
}

fn free_all_day(ts: &TrainerState, at: Ms) -> bool {
    if let Some(window) = ts.working_hours
        && !window.contains_time(time_of_day(at))
    {
        return false;
    }
    let day = utc_date(at);
    !ts.appointments
        .iter()
        .any(|a| a.status.blocks_slot() && utc_date(a.span.start) == day)
}
