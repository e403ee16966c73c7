//! Server handle consumed by the engine

use std::cell::Cell;

use crate::traits::ServerHandle;

/// Ready-made [`ServerHandle`] for coordinators without a server object
///
/// The round counter only moves forward. Interior mutability lets the
/// coordinator bump the round while the engine holds a shared reference.
#[derive(Debug, Default)]
pub struct ServerInfo {
    round: Cell<u64>,
    tolerance_for_latency: Cell<u64>,
}

impl ServerInfo {
    pub fn new(tolerance_for_latency: u64) -> Self {
        ServerInfo {
            round: Cell::new(0),
            tolerance_for_latency: Cell::new(tolerance_for_latency),
        }
    }

    /// Move to the next round and return it
    pub fn next_round(&self) -> u64 {
        let round = self.round.get() + 1;
        self.round.set(round);
        round
    }

    /// Jump to `round`; earlier rounds are ignored
    pub fn set_round(&self, round: u64) {
        self.round.set(self.round.get().max(round));
    }
}

impl ServerHandle for ServerInfo {
    fn current_round(&self) -> u64 {
        self.round.get()
    }

    fn tolerance_for_latency(&self) -> u64 {
        self.tolerance_for_latency.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_never_decreases() {
        let server = ServerInfo::new(5);
        assert_eq!(server.next_round(), 1);
        server.set_round(4);
        server.set_round(2);
        assert_eq!(server.current_round(), 4);
        assert_eq!(server.tolerance_for_latency(), 5);
    }
}
