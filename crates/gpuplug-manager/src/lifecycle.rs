//! Serve/restart state machine
//!
//! The plugin socket goes through `Idle -> Listening -> Registering ->
//! Serving -> Stopping` and back to `Idle` whenever the kubelet removes it.
//! This module only holds the states and the transition function; the
//! driver that performs the side effects lives in [`crate::server`].

use gpuplug_core::{GpuplugError, PluginEndpoint};
use tracing::warn;

/// Unrecoverable lifecycle failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fatal {
    /// The plugin socket could not be bound
    Bind(String),
    /// The kubelet rejected or could not receive the registration
    Registration(String),
}

impl From<Fatal> for GpuplugError {
    fn from(fatal: Fatal) -> Self {
        match fatal {
            Fatal::Bind(msg) => GpuplugError::Bind(msg),
            Fatal::Registration(msg) => GpuplugError::Registration(msg),
        }
    }
}

/// Where to go once the server has been stopped and joined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AfterStop {
    /// Mint a new endpoint and serve again
    Restart,
    /// Cooperative shutdown
    Exit,
    /// Terminate with an error
    Fail(Fatal),
}

/// Serve loop state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeState {
    Idle,
    Listening { endpoint: PluginEndpoint },
    Registering { endpoint: PluginEndpoint },
    Serving { endpoint: PluginEndpoint },
    Stopping { endpoint: PluginEndpoint, then: AfterStop },
    Exited,
    Failed(Fatal),
}

/// Result of performing the action of the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A fresh endpoint name was minted
    Minted(PluginEndpoint),
    /// Socket bound and server task spawned
    Bound,
    BindFailed(String),
    /// Server answered and the kubelet accepted the registration
    Registered,
    RegistrationFailed(String),
    /// Plugin socket file disappeared
    SocketRemoved,
    /// Server stopped and its task joined
    Joined,
    ShutdownRequested,
}

impl ServeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServeState::Exited | ServeState::Failed(_))
    }

    /// Apply an outcome to the current state.
    ///
    /// Outcomes that make no sense in the current state leave it unchanged.
    pub fn next(self, outcome: Outcome) -> ServeState {
        match (self, outcome) {
            (ServeState::Idle, Outcome::Minted(endpoint)) => ServeState::Listening { endpoint },
            (ServeState::Idle, Outcome::ShutdownRequested) => ServeState::Exited,

            (ServeState::Listening { endpoint }, Outcome::Bound) => {
                ServeState::Registering { endpoint }
            }
            (ServeState::Listening { .. }, Outcome::BindFailed(reason)) => {
                ServeState::Failed(Fatal::Bind(reason))
            }
            // Nothing was started yet, so there is nothing to stop.
            (ServeState::Listening { .. }, Outcome::ShutdownRequested) => ServeState::Exited,

            (ServeState::Registering { endpoint }, Outcome::Registered) => {
                ServeState::Serving { endpoint }
            }
            (ServeState::Registering { endpoint }, Outcome::RegistrationFailed(reason)) => {
                ServeState::Stopping {
                    endpoint,
                    then: AfterStop::Fail(Fatal::Registration(reason)),
                }
            }

            (ServeState::Serving { endpoint }, Outcome::SocketRemoved) => ServeState::Stopping {
                endpoint,
                then: AfterStop::Restart,
            },

            (ServeState::Registering { endpoint }, Outcome::ShutdownRequested)
            | (ServeState::Serving { endpoint }, Outcome::ShutdownRequested) => {
                ServeState::Stopping {
                    endpoint,
                    then: AfterStop::Exit,
                }
            }

            (ServeState::Stopping { then, .. }, Outcome::Joined) => match then {
                AfterStop::Restart => ServeState::Idle,
                AfterStop::Exit => ServeState::Exited,
                AfterStop::Fail(fatal) => ServeState::Failed(fatal),
            },

            (state, outcome) => {
                warn!(state = ?state, outcome = ?outcome, "Ignoring unexpected serve outcome");
                state
            }
        }
    }
}
