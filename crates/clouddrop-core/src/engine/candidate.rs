//! ICE candidate classification and connection-quality prediction.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// ICE candidate type, parsed from the `typ` token of a candidate line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    /// Local interface address.
    Host,
    /// Server-reflexive (STUN-derived).
    Srflx,
    /// Peer-reflexive (discovered during connectivity checks).
    Prflx,
    /// TURN-allocated relay.
    Relay,
}

impl CandidateKind {
    /// Classify a raw candidate attribute string, e.g.
    /// `candidate:842163049 1 udp 1677729535 203.0.113.7 34567 typ srflx ...`.
    pub fn classify(candidate: &str) -> Option<CandidateKind> {
        let mut tokens = candidate.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return tokens.next().and_then(|t| t.parse().ok());
            }
        }
        None
    }
}

impl FromStr for CandidateKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "host" => Ok(CandidateKind::Host),
            "srflx" => Ok(CandidateKind::Srflx),
            "prflx" => Ok(CandidateKind::Prflx),
            "relay" => Ok(CandidateKind::Relay),
            other => Err(Error::protocol(format!("unknown candidate type: {other}"))),
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateKind::Host => f.write_str("host"),
            CandidateKind::Srflx => f.write_str("srflx"),
            CandidateKind::Prflx => f.write_str("prflx"),
            CandidateKind::Relay => f.write_str("relay"),
        }
    }
}

/// The fast-fallback decision at the 5-second mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackVerdict {
    /// Only relay candidates (or none at all): commit to relay now.
    CommitRelay,
    /// Host/srflx/prflx candidates exist: the direct attempt is making
    /// progress, grant it an extension until the hard timeout.
    Extend,
}

/// Continuously updated prediction of whether a direct path can work,
/// derived from the candidate types gathered so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityPrediction {
    has_host: bool,
    has_srflx: bool,
    has_prflx: bool,
    has_relay: bool,
    gathering_complete: bool,
}

impl QualityPrediction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one gathered candidate.
    pub fn observe(&mut self, kind: CandidateKind) {
        match kind {
            CandidateKind::Host => self.has_host = true,
            CandidateKind::Srflx => self.has_srflx = true,
            CandidateKind::Prflx => self.has_prflx = true,
            CandidateKind::Relay => self.has_relay = true,
        }
    }

    /// Record end of gathering.
    pub fn gathering_complete(&mut self) {
        self.gathering_complete = true;
    }

    /// Any of host/srflx/prflx: a direct path is at least conceivable.
    pub fn p2p_possible(&self) -> bool {
        self.has_host || self.has_srflx || self.has_prflx
    }

    /// Srflx or prflx present: a NAT traversal path demonstrably exists.
    pub fn p2p_likely(&self) -> bool {
        self.has_srflx || self.has_prflx
    }

    pub fn has_relay(&self) -> bool {
        self.has_relay
    }

    /// Gathering finished without producing a single candidate.
    pub fn network_issue(&self) -> bool {
        self.gathering_complete
            && !self.p2p_possible()
            && !self.has_relay
    }

    /// Gathering finished with relay candidates only. Grounds an *early*
    /// relay commit; there is nothing to wait for.
    pub fn relay_only(&self) -> bool {
        self.gathering_complete && self.has_relay && !self.p2p_possible()
    }

    /// The fast-fallback decision: relay when the candidate set shows no
    /// direct possibility, an extension otherwise.
    pub fn fast_fallback_verdict(&self) -> FallbackVerdict {
        if self.p2p_possible() {
            FallbackVerdict::Extend
        } else {
            FallbackVerdict::CommitRelay
        }
    }
}
