//! Pure plan state-machine model shared between the agent, the plan store,
//! and the HTTP layer. No I/O lives here; the plan store owns
//! persistence, timestamps, and the write lock that makes a transition
//! atomic.

mod model;
mod reducer;

pub use model::{PlanEvent, PlanStatus, PlanTransitionError};
pub use reducer::transition;
