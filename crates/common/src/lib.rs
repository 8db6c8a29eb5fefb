pub mod logger;
pub mod models;
pub mod symbols;

/// Credit floor a tenant must hold to be considered for dispatch.
pub const MIN_CREDIT: i64 = 100;
/// Credits deducted per executed action.
pub const ACTION_COST: i64 = 10;
