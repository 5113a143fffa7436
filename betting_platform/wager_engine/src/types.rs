//! Core domain types for the wager engine

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of labelled options on a BINARY/MULTIPLE_CHOICE bet.
pub const MAX_OPTIONS: usize = 4;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Bet identifier
    BetId
);
id_type!(
    /// User identifier, resolved by the identity collaborator
    UserId
);
id_type!(
    /// Group identifier, owned by the membership collaborator
    GroupId
);
id_type!(ParticipationId);
id_type!(VoteId);

/// Error returned when a stored enum label is not recognised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// Enums persisted as upper-case labels.
macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let label = String::deserialize(deserializer)?;
                label.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

labelled_enum!(
    /// Shape of the proposition
    BetType {
        Binary => "BINARY",
        MultipleChoice => "MULTIPLE_CHOICE",
        Prediction => "PREDICTION",
    }
);

labelled_enum!(
    /// What is staked
    StakeType {
        Credit => "CREDIT",
        Social => "SOCIAL",
    }
);

labelled_enum!(
    /// Who decides the outcome
    ResolutionMethod {
        SelfResolved => "SELF",
        AssignedResolvers => "ASSIGNED_RESOLVERS",
        ParticipantVote => "PARTICIPANT_VOTE",
    }
);

labelled_enum!(
    /// Bet lifecycle state
    BetStatus {
        Open => "OPEN",
        Closed => "CLOSED",
        Resolved => "RESOLVED",
        Cancelled => "CANCELLED",
    }
);

labelled_enum!(
    /// Settlement state of a single participation
    ParticipationStatus {
        Active => "ACTIVE",
        Won => "WON",
        Lost => "LOST",
        Draw => "DRAW",
        Refunded => "REFUNDED",
    }
);

labelled_enum!(
    /// Derived social-stake fulfillment state
    FulfillmentStatus {
        Pending => "PENDING",
        PartiallyFulfilled => "PARTIALLY_FULFILLED",
        Fulfilled => "FULFILLED",
    }
);

impl BetStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BetStatus::Resolved | BetStatus::Cancelled)
    }

    /// Monotonic transition table.
    pub fn can_transition_to(&self, next: BetStatus) -> bool {
        matches!(
            (self, next),
            (BetStatus::Open, BetStatus::Closed)
                | (BetStatus::Closed, BetStatus::Resolved)
                | (BetStatus::Open, BetStatus::Cancelled)
                | (BetStatus::Closed, BetStatus::Cancelled)
        )
    }
}

impl BetType {
    pub fn uses_options(&self) -> bool {
        !matches!(self, BetType::Prediction)
    }
}

/// Per-option aggregates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetOption {
    /// 1-based option index
    pub index: u8,
    pub label: String,
    pub pool: u64,
    pub participant_count: u32,
}

/// Resolved outcome of a bet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BetOutcome {
    /// Winning option index (1-based)
    Option { index: u8 },
    /// Users judged to have predicted correctly, plus those split evenly
    Predictions {
        winners: BTreeSet<UserId>,
        draws: BTreeSet<UserId>,
    },
    /// Tied lead; every participant is refunded
    Draw,
}

/// The central aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub id: BetId,
    pub group_id: GroupId,
    pub creator_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub bet_type: BetType,
    pub stake_type: StakeType,
    pub resolution_method: ResolutionMethod,
    pub options: Vec<BetOption>,
    pub fixed_stake_amount: Option<u64>,
    pub social_stake_description: Option<String>,
    pub minimum_bet: Option<u64>,
    pub maximum_bet: Option<u64>,
    pub betting_deadline: DateTime<Utc>,
    pub resolve_date: DateTime<Utc>,
    pub minimum_votes_required: Option<u32>,
    pub allow_creator_vote: bool,
    pub total_pool: u64,
    pub total_participants: u32,
    pub status: BetStatus,
    pub outcome: Option<BetOutcome>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub loser_claimed_at: Option<DateTime<Utc>>,
    pub all_winners_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bet {
    pub fn option(&self, index: u8) -> Option<&BetOption> {
        self.options.iter().find(|o| o.index == index)
    }

    pub fn is_credit(&self) -> bool {
        self.stake_type == StakeType::Credit
    }

    pub fn is_social(&self) -> bool {
        self.stake_type == StakeType::Social
    }
}

/// What a participant picked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    /// 1-based option index for BINARY/MULTIPLE_CHOICE bets
    Option { index: u8 },
    /// Free-form predicted value for PREDICTION bets
    Prediction { value: String },
}

impl Selection {
    pub fn option_index(&self) -> Option<u8> {
        match self {
            Selection::Option { index } => Some(*index),
            Selection::Prediction { .. } => None,
        }
    }
}

/// Insurance item applied from the external inventory system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsuranceCoverage {
    pub item_id: Option<Uuid>,
    /// Percentage (0-100) of the stake returned if the participation loses
    pub refund_percentage: u8,
}

/// One user's stake on a bet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetParticipation {
    pub id: ParticipationId,
    pub bet_id: BetId,
    pub user_id: UserId,
    pub selection: Selection,
    pub amount: u64,
    pub insurance: Option<InsuranceCoverage>,
    pub status: ParticipationStatus,
    /// Amount credited back on settlement (payout or refund)
    pub payout: u64,
    pub fulfillment_confirmed_at: Option<DateTime<Utc>>,
    pub confirmation_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Authorization record for a resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetResolver {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// What a resolution vote names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VoteChoice {
    Option { index: u8 },
    WinnerSet { winners: BTreeSet<UserId> },
}

/// A resolver's vote; at most one active per (bet, voter)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionVote {
    pub id: VoteId,
    pub bet_id: BetId,
    pub voter_id: UserId,
    pub choice: VoteChoice,
    pub reasoning: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Loser's claim of having delivered a social stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoserFulfillmentClaim {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub proof_url: Option<String>,
    pub proof_description: Option<String>,
    pub claimed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
