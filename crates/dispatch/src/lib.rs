pub mod dispatcher;
pub mod guard;
pub mod sweeper;

pub use dispatcher::{ActionDispatcher, ActionRequest, DispatchError, DispatchOutcome};
pub use guard::{
    ConflictReason, GuardDecision, GuardError, GuardRequest, GuardSettings, IdempotencyGuard,
    Reservation,
};
pub use sweeper::{ExpirySweeper, SweepReport, SweeperSettings, SweeperShutdown, EXPIRY_LEASE_NAME};
