//! Server selection
//!
//! Hands out the next peer to try. Deterministic mode walks the configured
//! list in order forever; otherwise every pass over the list uses a fresh
//! random permutation.

use rand::seq::SliceRandom;

use crate::config::PeerAddress;
use crate::error::ZkError;

#[derive(Debug, Clone)]
pub struct ServerSelector {
    peers: Vec<PeerAddress>,
    order: Vec<usize>,
    cursor: usize,
    deterministic: bool,
}

impl ServerSelector {
    pub fn new(peers: Vec<PeerAddress>, deterministic: bool) -> Result<Self, ZkError> {
        if peers.is_empty() {
            return Err(ZkError::Configuration("server list is empty".into()));
        }
        let mut selector = Self {
            order: (0..peers.len()).collect(),
            peers,
            cursor: 0,
            deterministic,
        };
        selector.reshuffle();
        Ok(selector)
    }

    /// The next candidate, wrapping after the last one.
    pub fn next(&mut self) -> &PeerAddress {
        if self.cursor == self.order.len() {
            self.cursor = 0;
            self.reshuffle();
        }
        let peer = &self.peers[self.order[self.cursor]];
        self.cursor += 1;
        peer
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    fn reshuffle(&mut self) {
        if !self.deterministic {
            self.order.shuffle(&mut rand::thread_rng());
        }
    }
}
