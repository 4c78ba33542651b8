pub mod action;
pub mod idempotency;
pub mod tenant;
