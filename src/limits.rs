use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_TRAINERS_PER_GYM: usize = 10_000;
pub const MAX_SERVICES_PER_GYM: usize = 10_000;
pub const MAX_MEMBERS_PER_GYM: usize = 1_000_000;
pub const MAX_APPOINTMENTS_PER_TRAINER: usize = 100_000;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_PRINCIPAL_LEN: usize = 256;

pub const MIN_SERVICE_MINUTES: u32 = 10;
pub const MAX_SERVICE_MINUTES: u32 = 300;
/// Whole currency units (TL).
pub const MAX_SERVICE_FEE: i64 = 10_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
