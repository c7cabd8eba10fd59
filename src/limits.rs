//! Hard bounds on caller input. Anything past these is rejected before it
//! reaches the log.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_TITLE_LEN: usize = 512;
pub const MAX_NAME_LEN: usize = 256;

/// Target groups in one create request.
pub const MAX_GROUPS_PER_REQUEST: usize = 64;
/// Extra weekly occurrences, roughly two years.
pub const MAX_REPEAT_COUNT: u32 = 104;

pub const MAX_GROUPS_PER_OWNER: usize = 1_000;
pub const MAX_MEMBERS_PER_GROUP: usize = 1_000;
pub const MAX_EVENTS_PER_OWNER: usize = 100_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// One event may not run longer than 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 60 * 60 * 1000;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
