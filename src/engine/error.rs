use crate::model::*;

/// What a `NotFound` or `AlreadyExists` refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Appointment(AppointmentId),
    Trainer(TrainerId),
    Service(ServiceId),
    Member(MemberId),
    Principal(String),
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Appointment(id) => write!(f, "appointment {id}"),
            Entity::Trainer(id) => write!(f, "trainer {id}"),
            Entity::Service(id) => write!(f, "service {id}"),
            Entity::Member(id) => write!(f, "member {id}"),
            Entity::Principal(p) => write!(f, "principal {p}"),
        }
    }
}

/// Caller-facing failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Conflict,
    OutOfHours,
    NotFound,
    Forbidden,
    /// The only category that is not a business-rule outcome.
    StorageFailure,
}

#[derive(Debug)]
pub enum EngineError {
    InvalidRequest(&'static str),
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    Conflict(AppointmentId),
    OutOfHours(WorkingHours),
    NotFound(Entity),
    AlreadyExists(Entity),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidRequest(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::AlreadyExists(_)
            | EngineError::LimitExceeded(_) => ErrorKind::InvalidRequest,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::OutOfHours(_) => ErrorKind::OutOfHours,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::WalError(_) => ErrorKind::StorageFailure,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot change appointment status from {from} to {to}")
            }
            EngineError::Conflict(id) => {
                write!(f, "trainer already booked: overlaps appointment {id}")
            }
            EngineError::OutOfHours(window) => {
                write!(f, "outside trainer working hours {window}")
            }
            EngineError::NotFound(entity) => write!(f, "not found: {entity}"),
            EngineError::AlreadyExists(entity) => write!(f, "already exists: {entity}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
