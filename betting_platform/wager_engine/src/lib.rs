//! Wager Engine Library
//!
//! Bet lifecycle and resolution consensus for group wagers: creation,
//! staking, closing, resolver voting, pari-mutuel settlement, cancellation
//! with refunds, and social-stake fulfillment.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod fulfillment;
pub mod ledger;
pub mod lifecycle;
pub mod participation;
pub mod projection;
pub mod resolvers;
pub mod store;
pub mod tally;
pub mod tracing_logger;
pub mod types;
pub mod validation;

#[cfg(test)]
mod test_utils;

pub use collaborators::{
    BlobStore, Clock, IdentityProvider, InMemoryBlobStore, InMemoryIdentity, InMemoryMembership,
    ManualClock, MembershipDirectory, SystemClock,
};
pub use config::{ConfigError, EngineConfig};
pub use error::{EngineError, EngineResult, ErrorContext, ErrorKind};
pub use events::{BetEvent, BroadcastEventSink, EventSink, TracingEventSink};
pub use fulfillment::{FulfillmentReport, ProofInput};
pub use lifecycle::{Collaborators, VoteReceipt, WagerEngine};
pub use projection::BetView;
pub use store::{BetStore, DatabaseConfig, InMemoryStore, PostgresStore};
pub use tally::VoteProgress;
pub use types::*;
pub use validation::{
    CancelBetRequest, CastVoteRequest, CreateBetRequest, JoinBetRequest, LoserClaimRequest,
    WinnerConfirmRequest,
};
