//! OBD-II session and polling engine
//!
//! Sits between the link layer and the telemetry consumers: the
//! [`session`] engine talks to the ELM327 over any [`LinkWriter`], the
//! [`scheduler`] decides what to ask and how often, the [`health`] monitor
//! tracks whether the vehicle ECU is answering, and [`status`] exposes it
//! all to the outside.

use derive_more::{Display, Error};
use nitrotalk_link_lib::LinkError;

pub mod config;
pub mod health;
pub mod polling;
pub mod scheduler;
pub mod session;
pub mod status;

#[cfg(test)]
mod testing;

pub use config::{PollingConfig, SessionConfig};
pub use health::{AdapterErrorCounts, EcuState, HealthMonitor};
pub use polling::{PollMode, PollingController, RoundTrip, Verdict};
pub use scheduler::Scheduler;
pub use session::{Elm327Session, EcuReply, Marks, SessionShared, SessionState};
pub use status::{Status, StatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum SessionError {
    #[display("adapter link is not ready")]
    NotReady,
    #[display("adapter link was lost")]
    Disconnected,
    #[display("link error: {source}")]
    Link { source: LinkError },
    #[display("command too long")]
    CommandTooLong,
}

impl From<LinkError> for SessionError {
    fn from(source: LinkError) -> Self {
        match source {
            LinkError::NotReady | LinkError::NoWriteEndpoint => Self::NotReady,
            source => Self::Link { source },
        }
    }
}
