//! Tracking state machine.
//!
//! ```text
//! Initializing ──Initialized──▶ Tracking ──TrackingLost──▶ Lost
//!                                  ▲                        │
//!                                  │              RelocalizationStarted
//!                             Relocalized                   ▼
//!                                  └──────────────── Relocalizing
//!                                                           │
//!                       RelocalizationFailed (attempts left) → Lost
//!                       RelocalizationFailed (exhausted)     → PermanentlyLost
//! ```
//!
//! `Reset` returns every state to `Initializing`. Any other event that has
//! no arrow above is rejected with [`TrackingError::InvalidTransition`].

use std::fmt;

use crate::error::TrackingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// Waiting for two frames that bootstrap the map.
    #[default]
    Initializing,
    Tracking,
    /// Tracking failed; the next frame attempts relocalization.
    Lost { failed_attempts: u32 },
    /// A relocalization attempt is running on the current frame.
    Relocalizing { attempt: u32 },
    /// Relocalization attempts are exhausted. Only a reset leaves this state.
    PermanentlyLost { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingEvent {
    Initialized,
    TrackingLost,
    RelocalizationStarted,
    Relocalized,
    RelocalizationFailed { max_attempts: u32 },
    Reset,
}

impl TrackingState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Tracking => "TRACKING",
            Self::Lost { .. } => "LOST",
            Self::Relocalizing { .. } => "RELOCALIZING",
            Self::PermanentlyLost { .. } => "PERMANENTLY_LOST",
        }
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self, Self::Tracking)
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost { .. } | Self::Relocalizing { .. } | Self::PermanentlyLost { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PermanentlyLost { .. })
    }

    /// Applies `event`, returning the next state.
    pub fn transition(self, event: TrackingEvent) -> Result<Self, TrackingError> {
        use TrackingEvent as E;
        let next = match (self, event) {
            (_, E::Reset) => Self::Initializing,
            (Self::Initializing, E::Initialized) => Self::Tracking,
            (Self::Tracking, E::TrackingLost) => Self::Lost { failed_attempts: 0 },
            (Self::Lost { failed_attempts }, E::RelocalizationStarted) => Self::Relocalizing {
                attempt: failed_attempts + 1,
            },
            (Self::Relocalizing { .. }, E::Relocalized) => Self::Tracking,
            (Self::Relocalizing { attempt }, E::RelocalizationFailed { max_attempts }) => {
                if attempt >= max_attempts {
                    Self::PermanentlyLost { attempts: attempt }
                } else {
                    Self::Lost { failed_attempts: attempt }
                }
            }
            (state, event) => {
                return Err(TrackingError::InvalidTransition {
                    state: state.name(),
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }
}

impl TrackingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::TrackingLost => "TrackingLost",
            Self::RelocalizationStarted => "RelocalizationStarted",
            Self::Relocalized => "Relocalized",
            Self::RelocalizationFailed { .. } => "RelocalizationFailed",
            Self::Reset => "Reset",
        }
    }
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let s = TrackingState::default();
        assert_eq!(s, TrackingState::Initializing);
        let s = s.transition(TrackingEvent::Initialized).unwrap();
        assert!(s.is_tracking());
        let s = s.transition(TrackingEvent::TrackingLost).unwrap();
        assert_eq!(s, TrackingState::Lost { failed_attempts: 0 });
        let s = s.transition(TrackingEvent::RelocalizationStarted).unwrap();
        assert_eq!(s, TrackingState::Relocalizing { attempt: 1 });
        assert_eq!(s.transition(TrackingEvent::Relocalized).unwrap(), TrackingState::Tracking);
    }

    #[test]
    fn test_retries_exhaust() {
        let failed = TrackingEvent::RelocalizationFailed { max_attempts: 2 };
        let mut s = TrackingState::Lost { failed_attempts: 0 };
        s = s.transition(TrackingEvent::RelocalizationStarted).unwrap();
        s = s.transition(failed).unwrap();
        assert_eq!(s, TrackingState::Lost { failed_attempts: 1 });
        s = s.transition(TrackingEvent::RelocalizationStarted).unwrap();
        s = s.transition(failed).unwrap();
        assert_eq!(s, TrackingState::PermanentlyLost { attempts: 2 });
        assert!(s.is_terminal());

        let err = s.transition(TrackingEvent::RelocalizationStarted).unwrap_err();
        assert!(matches!(err, TrackingError::InvalidTransition { state: "PERMANENTLY_LOST", .. }));
        assert_eq!(s.transition(TrackingEvent::Reset).unwrap(), TrackingState::Initializing);
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(TrackingState::Initializing.transition(TrackingEvent::TrackingLost).is_err());
        assert!(TrackingState::Tracking.transition(TrackingEvent::Relocalized).is_err());
        assert!(TrackingState::Lost { failed_attempts: 0 }.transition(TrackingEvent::Initialized).is_err());
    }
}
