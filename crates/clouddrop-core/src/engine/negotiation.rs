//! Perfect Negotiation collision handling.
//!
//! Both peers may issue offers at any time. The peer with the
//! lexicographically smaller id is *polite*: on a collision it rolls back
//! its own offer and accepts the remote one. The impolite peer ignores the
//! incoming offer (and any candidates that follow it) and lets its own
//! offer win. Modeled as an explicit state machine with asserted
//! transitions rather than mirroring the underlying connection API.

use crate::error::{Error, Result};

/// Signaling-state mirror of the negotiation machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No negotiation in flight.
    Stable,
    /// Our offer is the local description.
    HaveLocalOffer,
    /// The remote offer is the remote description; an answer is owed.
    HaveRemoteOffer,
}

/// What to do with an incoming offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// No collision: apply the offer and answer.
    Accept,
    /// Collision, polite side: roll back the local offer, then apply.
    AcceptWithRollback,
    /// Collision, impolite side: drop the offer entirely.
    Ignore,
}

/// Per-peer negotiation state.
#[derive(Debug, Clone)]
pub struct Negotiation {
    polite: bool,
    state: NegotiationState,
    /// True while a local offer is being generated and applied.
    making_offer: bool,
    /// True after an impolite collision until the next settled negotiation;
    /// candidates arriving in this window are dropped.
    ignore_offer: bool,
}

impl Negotiation {
    /// `polite` per the peer-id rule: smaller local id ⇒ polite.
    pub fn new(polite: bool) -> Self {
        Negotiation {
            polite,
            state: NegotiationState::Stable,
            making_offer: false,
            ignore_offer: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    /// Begin generating a local offer. At most one offer may be in flight.
    pub fn begin_offer(&mut self) -> Result<()> {
        if self.making_offer || self.state != NegotiationState::Stable {
            return Err(Error::protocol(format!(
                "cannot start an offer in state {:?} (making_offer={})",
                self.state, self.making_offer
            )));
        }
        self.making_offer = true;
        Ok(())
    }

    /// The local offer has been applied as the local description and sent.
    pub fn local_offer_sent(&mut self) {
        debug_assert!(self.making_offer, "local_offer_sent without begin_offer");
        self.making_offer = false;
        self.state = NegotiationState::HaveLocalOffer;
    }

    /// The local offer attempt was abandoned before being applied.
    pub fn abort_offer(&mut self) {
        self.making_offer = false;
    }

    /// Resolve an incoming offer against our own negotiation activity.
    pub fn on_remote_offer(&mut self) -> OfferDisposition {
        let collision = self.making_offer || self.state != NegotiationState::Stable;
        if !collision {
            self.ignore_offer = false;
            self.state = NegotiationState::HaveRemoteOffer;
            return OfferDisposition::Accept;
        }
        if self.polite {
            // Roll back our offer; the remote one becomes the negotiation.
            self.making_offer = false;
            self.ignore_offer = false;
            self.state = NegotiationState::HaveRemoteOffer;
            OfferDisposition::AcceptWithRollback
        } else {
            self.ignore_offer = true;
            OfferDisposition::Ignore
        }
    }

    /// Our answer to the remote offer has been applied and sent.
    pub fn local_answer_sent(&mut self) -> Result<()> {
        if self.state != NegotiationState::HaveRemoteOffer {
            return Err(Error::protocol(format!(
                "answer sent in state {:?}",
                self.state
            )));
        }
        self.state = NegotiationState::Stable;
        Ok(())
    }

    /// A remote answer arrived for our offer.
    pub fn on_remote_answer(&mut self) -> Result<()> {
        if self.state != NegotiationState::HaveLocalOffer {
            return Err(Error::protocol(format!(
                "unexpected answer in state {:?}",
                self.state
            )));
        }
        self.ignore_offer = false;
        self.state = NegotiationState::Stable;
        Ok(())
    }

    /// Whether an arriving remote candidate should be applied. While an
    /// offer is being ignored, its trailing candidates are dropped too.
    pub fn should_apply_candidate(&self) -> bool {
        !self.ignore_offer
    }

    /// Reset after a teardown (new connection attempt starts clean).
    pub fn reset(&mut self) {
        self.state = NegotiationState::Stable;
        self.making_offer = false;
        self.ignore_offer = false;
    }
}
