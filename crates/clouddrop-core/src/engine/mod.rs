//! Connection-engine decision logic.
//!
//! The webrtc plumbing lives in the client crate; everything here is pure
//! state driven by observed events: candidate classification and quality
//! prediction, the Perfect Negotiation collision rules, the ICE-restart
//! policy, and the background recovery schedule. Keeping these as plain
//! state machines lets the racing and restart rules be tested without a
//! peer connection.

mod candidate;
mod negotiation;
mod recovery;
mod restart;

pub use candidate::{CandidateKind, FallbackVerdict, QualityPrediction};
pub use negotiation::{Negotiation, NegotiationState, OfferDisposition};
pub use recovery::RecoverySchedule;
pub use restart::{IceRestartPolicy, RestartDecision};
