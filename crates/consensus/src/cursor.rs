//! The consensus cursor and the step that moves it
//!
//! The cursor is what this client believes is settled: a height and the
//! digest at that height. Each tick runs [`ConsensusCursor::advance`] over a
//! snapshot of the tracked peers. The search is exponential: strong agreement
//! on the digest `step` blocks ahead doubles `step`, weak agreement halves it,
//! and a bare majority at `step == 1` arms a one-off jump of
//! [`SKIP_STEP`] that must be confirmed by the same agreement ratio on the
//! following tick.

use crate::peer::PeerState;
use light_types::Digest;
use serde::Serialize;
use std::collections::BTreeMap;

/// Distance of the speculative jump armed by a majority at `step == 1`
pub const SKIP_STEP: u64 = 10;

/// Agreement among the current peers, kept as a fraction
///
/// Kept as integers so confirming a skip compares ratios exactly without
/// floating point rounding: 3/5 and 6/10 are the same ratio.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Ratio {
    pub count: usize,
    pub total: usize,
}

impl Ratio {
    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.count as f64 / self.total as f64
        }
    }

    pub fn is_unanimous(&self) -> bool {
        self.total > 0 && self.count == self.total
    }

    /// Exact equality of the two fractions
    pub fn same_as(&self, other: &Ratio) -> bool {
        self.total > 0
            && other.total > 0
            && (self.count as u128) * (other.total as u128)
                == (other.count as u128) * (self.total as u128)
    }
}

/// What one tick did to the cursor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Advance {
    /// Every reporting peer disagreed with the cursor; it went back to genesis
    RolledBack,
    /// No current peers, nothing to vote on
    Idle,
    Advanced { from: u64, to: u64, digest: Digest },
    /// A majority agreed one block ahead; a jump of `SKIP_STEP` is pending
    SkipArmed { count: usize, total: usize },
    /// The pending jump was not confirmed
    SkipDiscarded,
    /// Too little agreement; `step` shrank
    BackedOff { step: u64 },
}

/// Process-wide belief about the canonical chain
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusCursor {
    pub genesis: Digest,
    pub height: u64,
    pub digest: Digest,
    /// Distance ahead currently being tested, always at least 1
    pub step: u64,
    /// Agreement remembered while a speculative jump awaits confirmation
    pub skip: Option<Ratio>,
    /// Whether this client believes it has caught up
    pub is_current: bool,
    /// Required agreement fraction; 1.0 means unanimity
    pub threshold: f64,
}

impl ConsensusCursor {
    pub fn new(genesis: Digest, threshold: f64) -> Self {
        Self {
            digest: genesis.clone(),
            genesis,
            height: 0,
            step: 1,
            skip: None,
            is_current: false,
            threshold,
        }
    }

    /// Height whose digest the peers are asked to peek at
    pub fn peek_height(&self) -> u64 {
        self.height.saturating_add(self.step)
    }

    fn meets_threshold(&self, ratio: &Ratio) -> bool {
        if self.threshold >= 1.0 {
            ratio.is_unanimous()
        } else {
            ratio.value() > self.threshold
        }
    }

    fn rollback(&mut self) {
        self.height = 0;
        self.digest = self.genesis.clone();
        self.step = 1;
        self.skip = None;
        self.is_current = false;
    }

    /// Move the cursor to `height + step` and carry the agreeing peers along
    fn accept(&mut self, best: &Digest, peers: &mut [PeerState]) -> Advance {
        let from = self.height;
        let target = self.peek_height();
        for peer in peers.iter_mut() {
            if peer.agrees_with(from, &self.digest) && peer.peek_at(target) == Some(best) {
                peer.confirm(target, best.clone());
            }
        }
        self.height = target;
        self.digest = best.clone();
        Advance::Advanced {
            from,
            to: target,
            digest: best.clone(),
        }
    }

    /// Run one consensus step over the tracked peers
    pub fn advance(&mut self, peers: &mut [PeerState]) -> Advance {
        let mut reporting = 0usize;
        let mut disputing = 0usize;
        for peer in peers.iter() {
            if peer.agrees_with(self.height, &self.digest) {
                reporting += 1;
            } else if peer.disputes(self.height, &self.digest) {
                reporting += 1;
                disputing += 1;
            }
        }
        if reporting > 0 && disputing == reporting {
            self.rollback();
            return Advance::RolledBack;
        }

        let target = self.peek_height();
        let mut total = 0usize;
        let mut histogram: BTreeMap<&Digest, usize> = BTreeMap::new();
        for peer in peers.iter() {
            if !peer.agrees_with(self.height, &self.digest) {
                continue;
            }
            total += 1;
            if let Some(peek) = peer.peek_at(target) {
                *histogram.entry(peek).or_default() += 1;
            }
        }
        if total == 0 {
            return Advance::Idle;
        }

        let mut best: Option<(&Digest, usize)> = None;
        for (digest, count) in histogram {
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((digest, count));
            }
        }
        let best_digest = best.map(|(d, _)| d.clone());
        let consensus = Ratio {
            count: best.map_or(0, |(_, c)| c),
            total,
        };

        if let Some(skip) = self.skip.take() {
            let confirmed = best_digest.as_ref().filter(|_| consensus.same_as(&skip));
            let outcome = match confirmed {
                Some(digest) => {
                    let outcome = self.accept(digest, peers);
                    self.is_current = false;
                    outcome
                }
                None => {
                    self.is_current = true;
                    Advance::SkipDiscarded
                }
            };
            self.step = 1;
            return outcome;
        }

        if let Some(digest) = best_digest.as_ref().filter(|_| self.meets_threshold(&consensus)) {
            let outcome = self.accept(digest, peers);
            self.step = self.step.saturating_mul(2);
            return outcome;
        }

        if self.step == 1 && consensus.value() > 0.5 {
            self.skip = Some(consensus);
            self.step = SKIP_STEP;
            self.is_current = false;
            return Advance::SkipArmed {
                count: consensus.count,
                total: consensus.total,
            };
        }

        self.step = (self.step / 2).max(1);
        self.is_current = self.step == 1;
        Advance::BackedOff { step: self.step }
    }
}
