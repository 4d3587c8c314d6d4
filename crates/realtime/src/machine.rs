//! Connection state machine.
//!
//! Pure transition logic with no I/O or timers, so every rule is unit
//! testable. The manager owns one [`Machine`] behind its state lock and
//! performs the side effects each transition asks for.
//!
//! | From                    | Event               | To                                    |
//! |-------------------------|---------------------|---------------------------------------|
//! | Idle, BackingOff        | connect             | Connecting                            |
//! | Connecting              | opened              | Open (attempts = 0)                   |
//! | Connecting, Open        | disconnect          | Closing(Operator)                     |
//! | Idle, BackingOff        | disconnect          | Idle                                  |
//! | Open                    | credential rejected | Closing(CredentialRejected)           |
//! | Closing(Operator)       | closed              | Idle (attempts = 0)                   |
//! | Closing(Rejected)       | closed              | Disabled(CredentialRejected)          |
//! | Closing(Rejected), reset| closed              | Idle (attempts = 0)                   |
//! | Connecting, Open        | closed 1000         | Idle (attempts = 0)                   |
//! | Connecting, Open        | closed other        | BackingOff, or Disabled(Exhausted)    |
//! | Idle, BackingOff        | construction failed | BackingOff, or Disabled(Exhausted)    |
//! | Disabled                | reset               | Idle (attempts = 0)                   |

use std::time::Duration;

use serverwatch_protocol::constants::CLOSE_NORMAL;

use crate::types::{CloseIntent, ConnectionPhase, DisableReason, ReconnectConfig};

/// Why a `connect` request was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Skip {
    InFlight,
    AlreadyOpen,
    Disabled(DisableReason),
}

/// What to do after a transport ended or could not be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// Nothing further; the phase is terminal or idle.
    Stop,
    /// Arm the reconnect timer.
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted; reconnection is now disabled.
    GiveUp { attempts: u32 },
}

#[derive(Debug)]
pub(crate) struct Machine {
    phase: ConnectionPhase,
    attempts: u32,
    policy: ReconnectConfig,
    /// Reset requested while the rejection close was still in flight.
    reset_pending: bool,
}

impl Machine {
    pub(crate) fn new(policy: ReconnectConfig) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            attempts: 0,
            policy,
            reset_pending: false,
        }
    }

    pub(crate) fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Checks whether a new transport may be opened now.
    pub(crate) fn admit_connect(&self) -> Result<(), Skip> {
        match self.phase {
            ConnectionPhase::Idle | ConnectionPhase::BackingOff { .. } => Ok(()),
            ConnectionPhase::Connecting { .. } | ConnectionPhase::Closing { .. } => {
                Err(Skip::InFlight)
            }
            ConnectionPhase::Open => Err(Skip::AlreadyOpen),
            ConnectionPhase::Disabled { reason } => Err(Skip::Disabled(reason)),
        }
    }

    /// Enters `Connecting`. Returns the 1-based attempt number.
    pub(crate) fn begin_connect(&mut self) -> u32 {
        let attempt = self.attempts + 1;
        self.phase = ConnectionPhase::Connecting { attempt };
        attempt
    }

    /// The transport opened. Returns `false` if the attempt was abandoned
    /// in the meantime.
    pub(crate) fn opened(&mut self) -> bool {
        if !matches!(self.phase, ConnectionPhase::Connecting { .. }) {
            return false;
        }
        self.phase = ConnectionPhase::Open;
        self.attempts = 0;
        true
    }

    /// The backend refused the credential on an open transport.
    pub(crate) fn reject_credential(&mut self) -> bool {
        if self.phase != ConnectionPhase::Open {
            return false;
        }
        self.phase = ConnectionPhase::Closing {
            intent: CloseIntent::CredentialRejected,
        };
        true
    }

    /// Operator disconnect. `transport_live` tells whether a transport
    /// still has to be closed.
    pub(crate) fn disconnect(&mut self, transport_live: bool) {
        self.attempts = 0;
        match self.phase {
            ConnectionPhase::Disabled { .. }
            | ConnectionPhase::Closing {
                intent: CloseIntent::CredentialRejected,
            } => {}
            _ if transport_live => {
                self.phase = ConnectionPhase::Closing {
                    intent: CloseIntent::Operator,
                };
            }
            _ => self.phase = ConnectionPhase::Idle,
        }
    }

    /// The transport closed with `code`.
    pub(crate) fn closed(&mut self, code: u16) -> Recovery {
        match self.phase {
            ConnectionPhase::Closing {
                intent: CloseIntent::Operator,
            } => {
                self.phase = ConnectionPhase::Idle;
                self.attempts = 0;
                Recovery::Stop
            }
            ConnectionPhase::Closing {
                intent: CloseIntent::CredentialRejected,
            } => {
                self.phase = if std::mem::take(&mut self.reset_pending) {
                    ConnectionPhase::Idle
                } else {
                    ConnectionPhase::Disabled {
                        reason: DisableReason::CredentialRejected,
                    }
                };
                self.attempts = 0;
                Recovery::Stop
            }
            ConnectionPhase::Disabled { .. } => Recovery::Stop,
            _ if code == CLOSE_NORMAL => {
                self.phase = ConnectionPhase::Idle;
                self.attempts = 0;
                Recovery::Stop
            }
            _ => self.failed(),
        }
    }

    /// Counts one failed attempt and decides whether to retry.
    pub(crate) fn failed(&mut self) -> Recovery {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts < self.policy.max_attempts {
            let attempt = self.attempts;
            let delay = self.policy.delay_for_attempt(attempt);
            self.phase = ConnectionPhase::BackingOff { attempt, delay };
            Recovery::Retry { attempt, delay }
        } else {
            self.phase = ConnectionPhase::Disabled {
                reason: DisableReason::RetriesExhausted,
            };
            Recovery::GiveUp {
                attempts: self.attempts,
            }
        }
    }

    /// Clears any disable reason and the attempt counter. A rejection whose
    /// close is still pending ends in `Idle` instead of `Disabled`.
    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
        match self.phase {
            ConnectionPhase::Disabled { .. } => self.phase = ConnectionPhase::Idle,
            ConnectionPhase::Closing {
                intent: CloseIntent::CredentialRejected,
            } => self.reset_pending = true,
            _ => {}
        }
    }
}
