use std::fmt;
use std::time::Instant;

use tabula_common::error::{TabulaError, TabulaResult};

/// Role of one cell peer. Transitions consume the old state; only a peer in
/// elections can become leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Leading { epoch: u64 },
    Following { epoch: u64, leader: usize },
    Elections { since: Instant },
    Stopped { since: Instant },
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::Leading { .. } => "leading",
            PeerState::Following { .. } => "following",
            PeerState::Elections { .. } => "elections",
            PeerState::Stopped { .. } => "stopped",
        }
    }

    pub fn is_leading(&self) -> bool {
        matches!(self, PeerState::Leading { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, PeerState::Leading { .. } | PeerState::Following { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, PeerState::Stopped { .. })
    }

    pub fn epoch(&self) -> Option<u64> {
        match *self {
            PeerState::Leading { epoch } | PeerState::Following { epoch, .. } => Some(epoch),
            _ => None,
        }
    }

    pub fn start_elections(self, now: Instant) -> PeerState {
        match self {
            PeerState::Elections { .. } => self,
            _ => PeerState::Elections { since: now },
        }
    }

    pub fn win_election(self, epoch: u64) -> TabulaResult<PeerState> {
        match self {
            PeerState::Elections { .. } => Ok(PeerState::Leading { epoch }),
            other => Err(TabulaError::internal(format!(
                "peer in state {other} cannot take leadership"
            ))),
        }
    }

    pub fn follow(self, epoch: u64, leader: usize) -> PeerState {
        PeerState::Following { epoch, leader }
    }

    pub fn stop(self, now: Instant) -> PeerState {
        match self {
            PeerState::Stopped { .. } => self,
            _ => PeerState::Stopped { since: now },
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_candidates_lead() {
        let now = Instant::now();
        let stopped = PeerState::Elections { since: now }.stop(now);
        assert!(stopped.win_election(2).is_err());
        let leader = stopped.start_elections(now).win_election(2).unwrap();
        assert_eq!(leader, PeerState::Leading { epoch: 2 });
        assert_eq!(leader.name(), "leading");
        assert_eq!(leader.follow(3, 1).epoch(), Some(3));
    }
}
