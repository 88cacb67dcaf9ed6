use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.duration_ms() <= 0 {
        return Err(EngineError::InvalidRequest("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidRequest("timestamp out of range"));
    }
    Ok(())
}

/// First slot-holding appointment of the trainer overlapping `span`.
/// Cancelled appointments never conflict; rejected ones still do.
pub fn find_conflict(
    ts: &TrainerState,
    span: &Span,
    exclude: Option<AppointmentId>,
) -> Option<AppointmentId> {
    ts.overlapping(span)
        .filter(|a| a.status.blocks_slot())
        .find(|a| Some(a.id) != exclude)
        .map(|a| a.id)
}

pub fn check_working_hours(ts: &TrainerState, span: &Span) -> Result<(), EngineError> {
    match ts.working_hours {
        Some(window) if !window.contains_span(span) => Err(EngineError::OutOfHours(window)),
        _ => Ok(()),
    }
}
