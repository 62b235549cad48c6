pub mod recovery;
pub mod session;

pub use recovery::{RecoveryError, run_recovery, serve_peers};
pub use session::{Session, SessionError};
