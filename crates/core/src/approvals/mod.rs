pub mod engine;
pub mod resolver;

pub use engine::TransitionOutcome;
pub use resolver::{actionable, authorize, can_act, normalize_role, step_matches};
