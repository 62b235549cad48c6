//! Latched shutdown/restart signal shared by an endpoint's workers.
//!
//! The latch starts clear and is set at most once per endpoint lifetime.
//! `Shutdown` asks workers to return after their current iteration.
//! `Restart` additionally parks them on a rendezvous sized to exactly the
//! participants of a restart cycle: the send worker, the receive worker,
//! and the driver that will rebuild the endpoint. The barrier is created
//! fresh for each cycle; a latch is never cleared within one.

use std::sync::Arc;
use tokio::sync::{Barrier, watch};

/// Number of parties that must meet before a restart proceeds.
pub const RESTART_PARTIES: usize = 3;

#[derive(Debug, Clone, Default)]
pub enum LatchState {
    #[default]
    Clear,
    Shutdown,
    Restart(Arc<Barrier>),
}

/// Setter side, held by the endpoint owner.
#[derive(Debug)]
pub struct ShutdownLatch {
    tx: watch::Sender<LatchState>,
}

/// Worker side; cheap to clone into each worker.
pub type ShutdownRx = watch::Receiver<LatchState>;

impl ShutdownLatch {
    pub fn new() -> (ShutdownLatch, ShutdownRx) {
        let (tx, rx) = watch::channel(LatchState::Clear);
        (ShutdownLatch { tx }, rx)
    }

    /// Latch a plain shutdown. Idempotent; a latched restart wins.
    pub fn shutdown(&self) {
        self.tx.send_if_modified(|state| match state {
            LatchState::Clear => {
                *state = LatchState::Shutdown;
                true
            }
            _ => false,
        });
    }

    /// Latch a restart and hand back the rendezvous the driver must join.
    ///
    /// A latched shutdown stays latched and yields `None`: the workers are
    /// already exiting and no rendezvous will form. Latching restart twice
    /// returns the existing barrier.
    pub fn restart(&self) -> Option<Arc<Barrier>> {
        let mut rendezvous = None;
        self.tx.send_if_modified(|state| match state {
            LatchState::Clear => {
                let barrier = Arc::new(Barrier::new(RESTART_PARTIES));
                rendezvous = Some(Arc::clone(&barrier));
                *state = LatchState::Restart(barrier);
                true
            }
            LatchState::Restart(barrier) => {
                rendezvous = Some(Arc::clone(barrier));
                false
            }
            LatchState::Shutdown => false,
        });
        rendezvous
    }
}
