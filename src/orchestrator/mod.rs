pub mod session;
pub mod state;

pub use session::{NewSession, SessionOrchestrator};
pub use state::{Next, PhaseStateMachine, Session, WorkspaceLock};
