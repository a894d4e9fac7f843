//! Ceremony lifecycle: pending challenges and the orchestrator that drives
//! registration and authentication through them

pub mod cache;
pub mod clock;
pub mod orchestrator;

pub use cache::{CeremonyRequest, CeremonyState, PendingCeremonyCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use orchestrator::{CeremonyOrchestrator, Deadline};
