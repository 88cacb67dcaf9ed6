use crate::model::*;

use super::{Engine, EngineError};

pub fn require_admin(caller: Caller, action: &'static str) -> Result<(), EngineError> {
    match caller {
        Caller::Admin => Ok(()),
        Caller::Member(_) => Err(EngineError::Forbidden(action)),
    }
}

fn require_self_or_admin(
    caller: Caller,
    member_id: MemberId,
    action: &'static str,
) -> Result<(), EngineError> {
    match caller {
        Caller::Admin => Ok(()),
        Caller::Member(me) if me == member_id => Ok(()),
        Caller::Member(_) => Err(EngineError::Forbidden(action)),
    }
}

/// Caller-scoped entry points. The transport resolves the caller once per request
/// and every rule is checked here, before the engine operation runs.
impl Engine {
    /// The configured admin login maps to `Admin`; everyone else must be a known member.
    pub fn resolve_caller(&self, principal: &str, admin_user: &str) -> Result<Caller, EngineError> {
        if principal == admin_user {
            return Ok(Caller::Admin);
        }
        self.member_for_principal(principal)
            .map(Caller::Member)
            .ok_or(EngineError::Forbidden("unknown principal"))
    }

    pub async fn book_as(
        &self,
        caller: Caller,
        member_id: MemberId,
        trainer_id: TrainerId,
        service_id: ServiceId,
        start: Ms,
    ) -> Result<Appointment, EngineError> {
        require_self_or_admin(caller, member_id, "members can only book for themselves")?;
        self.create_appointment(member_id, trainer_id, service_id, start)
            .await
    }

    pub async fn cancel_as(&self, caller: Caller, id: AppointmentId) -> Result<Appointment, EngineError> {
        if let Caller::Member(_) = caller {
            let appointment = self.get_appointment(id).await?;
            require_self_or_admin(caller, appointment.member_id, "not your appointment")?;
        }
        self.cancel_appointment(id).await
    }

    /// Status changes other than a member cancelling its own booking are admin-only.
    pub async fn set_status_as(
        &self,
        caller: Caller,
        id: AppointmentId,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        if status == AppointmentStatus::Cancelled {
            return self.cancel_as(caller, id).await;
        }
        require_admin(caller, "only administrators can change appointment status")?;
        self.set_status(id, status).await
    }

    pub async fn appointment_as(
        &self,
        caller: Caller,
        id: AppointmentId,
    ) -> Result<Appointment, EngineError> {
        let appointment = self.get_appointment(id).await?;
        require_self_or_admin(caller, appointment.member_id, "not your appointment")?;
        Ok(appointment)
    }

    pub async fn member_appointments_as(
        &self,
        caller: Caller,
        member_id: MemberId,
        from: Option<Ms>,
        until: Option<Ms>,
    ) -> Result<Vec<Appointment>, EngineError> {
        require_self_or_admin(caller, member_id, "not your appointments")?;
        self.list_by_member(member_id, from, until).await
    }
}
