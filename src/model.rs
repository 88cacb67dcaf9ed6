use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Unix milliseconds (UTC). The only instant type inside the engine.
pub type Ms = i64;

pub type AppointmentId = u64;
pub type TrainerId = u64;
pub type ServiceId = u64;
pub type MemberId = u64;

pub const MS_PER_MINUTE: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

pub fn utc(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn time_of_day(ms: Ms) -> NaiveTime {
    utc(ms).time()
}

pub fn utc_date(ms: Ms) -> NaiveDate {
    utc(ms).date_naive()
}

pub fn format_instant(ms: Ms) -> String {
    utc(ms).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Daily window a trainer accepts appointments in. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingHours {
    /// Returns `None` for empty or inverted windows.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn contains_time(&self, t: NaiveTime) -> bool {
        self.start <= t && t <= self.end
    }

    /// Both the start and the end time-of-day must fall inside the window.
    pub fn contains_span(&self, span: &Span) -> bool {
        self.contains_time(time_of_day(span.start)) && self.contains_time(time_of_day(span.end))
    }
}

impl fmt::Display for WorkingHours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 4] = [
        AppointmentStatus::Pending,
        AppointmentStatus::Approved,
        AppointmentStatus::Rejected,
        AppointmentStatus::Cancelled,
    ];

    /// Stored/display form shared with the existing gym database.
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "Beklemede",
            AppointmentStatus::Approved => "Onaylandı",
            AppointmentStatus::Rejected => "Reddedildi",
            AppointmentStatus::Cancelled => "İptal Edildi",
        }
    }

    /// Cancelled appointments free their slot; every other status keeps it.
    pub fn blocks_slot(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }

    /// `Some(true)` moves to `next`, `Some(false)` is an idempotent no-op,
    /// `None` is a forbidden transition.
    pub fn step(self, next: AppointmentStatus) -> Option<bool> {
        use AppointmentStatus::*;
        match (self, next) {
            (Pending, Approved) | (Pending, Rejected) | (Pending, Cancelled) | (Approved, Cancelled) => {
                Some(true)
            }
            (Approved, Approved) | (Rejected, Rejected) | (Cancelled, Cancelled) => Some(false),
            _ => None,
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown appointment status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for AppointmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Beklemede" => return Ok(AppointmentStatus::Pending),
            // Both spellings exist in older rows.
            "Onaylandı" | "Onaylı" => return Ok(AppointmentStatus::Approved),
            "Reddedildi" => return Ok(AppointmentStatus::Rejected),
            "İptal Edildi" => return Ok(AppointmentStatus::Cancelled),
            _ => {}
        }
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "approved" => Ok(AppointmentStatus::Approved),
            "rejected" => Ok(AppointmentStatus::Rejected),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    pub id: AppointmentId,
    pub member_id: MemberId,
    pub trainer_id: TrainerId,
    pub service_id: ServiceId,
    pub span: Span,
    /// Service fee at booking time.
    pub fee: Decimal,
    pub status: AppointmentStatus,
    pub created_at: Ms,
}

/// Per-trainer state: the trainer's directory record plus every appointment ever
/// booked with them, cancelled ones included.
#[derive(Debug, Clone)]
pub struct TrainerState {
    pub id: TrainerId,
    pub name: String,
    pub working_hours: Option<WorkingHours>,
    /// Sorted by `span.start`.
    pub appointments: Vec<Appointment>,
}

impl TrainerState {
    pub fn new(id: TrainerId, name: String, working_hours: Option<WorkingHours>) -> Self {
        Self {
            id,
            name,
            working_hours,
            appointments: Vec::new(),
        }
    }

    /// Insert appointment maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn appointment(&self, id: AppointmentId) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: AppointmentId) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose span overlaps the query window, whatever their status.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    pub fn info(&self) -> TrainerInfo {
        TrainerInfo {
            id: self.id,
            name: self.name.clone(),
            working_hours: self.working_hours,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainerInfo {
    pub id: TrainerId,
    pub name: String,
    pub working_hours: Option<WorkingHours>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub name: String,
    pub duration_minutes: u32,
    pub fee: Decimal,
}

impl ServiceInfo {
    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_minutes) * MS_PER_MINUTE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: MemberId,
    pub name: String,
    /// Login name the member authenticates with.
    pub principal: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: AppointmentStatus) {
        self.total += 1;
        match status {
            AppointmentStatus::Pending => self.pending += 1,
            AppointmentStatus::Approved => self.approved += 1,
            AppointmentStatus::Rejected => self.rejected += 1,
            AppointmentStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Who is asking. Resolved once per request by the transport, then passed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Admin,
    Member(MemberId),
}

/// Flat event types; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TrainerPut {
        id: TrainerId,
        name: String,
        working_hours: Option<WorkingHours>,
    },
    ServicePut {
        id: ServiceId,
        name: String,
        duration_minutes: u32,
        #[serde(with = "rust_decimal::serde::str")]
        fee: Decimal,
    },
    MemberPut {
        id: MemberId,
        name: String,
        principal: String,
    },
    AppointmentCreated {
        id: AppointmentId,
        member_id: MemberId,
        trainer_id: TrainerId,
        service_id: ServiceId,
        span: Span,
        #[serde(with = "rust_decimal::serde::str")]
        fee: Decimal,
        created_at: Ms,
    },
    AppointmentStatusChanged {
        id: AppointmentId,
        trainer_id: TrainerId,
        status: AppointmentStatus,
    },
}
