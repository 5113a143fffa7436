//! Request payloads and domain validators
//!
//! Field-level rules are declared with `validator` derives; the rules that
//! span several fields (option count per bet type, stake configuration per
//! stake type, deadline ordering, resolver list per resolution method) live in
//! the domain validators below. Everything here runs before any mutation.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::error::{EngineError, EngineResult, ErrorContext};
use crate::fulfillment::ProofInput;
use crate::types::{
    Bet, BetType, InsuranceCoverage, ResolutionMethod, Selection, StakeType, UserId, VoteChoice,
    MAX_OPTIONS,
};

pub const MAX_LABEL_LEN: usize = 100;
pub const MAX_PREDICTION_LEN: usize = 500;
/// Largest single stake; ledgers store amounts as signed 64-bit integers
pub const MAX_STAKE: u64 = i64::MAX as u64;

/// Payload for creating a bet
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateBetRequest {
    pub group_id: crate::types::GroupId,
    #[validate(length(min = 1, max = 200, message = "title must be 1-200 characters"))]
    pub title: String,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    pub bet_type: BetType,
    pub stake_type: StakeType,
    pub resolution_method: ResolutionMethod,
    #[serde(default)]
    pub options: Vec<String>,
    #[validate(range(min = 1, message = "fixed stake must be positive"))]
    pub fixed_stake_amount: Option<u64>,
    #[validate(length(min = 1, max = 500, message = "social stake description must be 1-500 characters"))]
    pub social_stake_description: Option<String>,
    pub minimum_bet: Option<u64>,
    pub maximum_bet: Option<u64>,
    pub betting_deadline: DateTime<Utc>,
    pub resolve_date: DateTime<Utc>,
    #[validate(range(min = 1, message = "minimum votes must be at least 1"))]
    pub minimum_votes_required: Option<u32>,
    #[serde(default)]
    pub allow_creator_vote: bool,
    #[serde(default)]
    pub resolver_ids: Vec<UserId>,
}

/// Payload for joining a bet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinBetRequest {
    pub selection: Selection,
    /// Required for CREDIT bets without a fixed stake; ignored otherwise
    pub amount: Option<u64>,
    pub insurance: Option<InsuranceCoverage>,
}

/// Payload for casting a resolution vote
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CastVoteRequest {
    pub choice: VoteChoice,
    #[validate(length(max = 1000, message = "reasoning must be at most 1000 characters"))]
    pub reasoning: Option<String>,
}

/// Payload for a loser's fulfillment claim
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoserClaimRequest {
    pub proof: Option<ProofInput>,
    #[validate(length(max = 1000, message = "proof description must be at most 1000 characters"))]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct WinnerConfirmRequest {
    #[validate(length(max = 1000, message = "notes must be at most 1000 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CancelBetRequest {
    #[validate(length(max = 500, message = "reason must be at most 500 characters"))]
    pub reason: Option<String>,
}

fn field_error(errors: &mut ValidationErrors, field: &'static str, code: &'static str, message: String) {
    let mut error = ValidationError::new(code);
    error.message = Some(message.into());
    errors.add(field, error);
}

/// Validate a create payload: derived field rules plus cross-field rules
pub fn validate_create(request: &CreateBetRequest, now: DateTime<Utc>) -> EngineResult<()> {
    request.validate()?;

    let mut errors = ValidationErrors::new();

    // Options per bet type
    match request.bet_type {
        BetType::Binary if request.options.len() != 2 => field_error(
            &mut errors,
            "options",
            "binary_options",
            format!("BINARY bets need exactly 2 options, got {}", request.options.len()),
        ),
        BetType::MultipleChoice if !(2..=MAX_OPTIONS).contains(&request.options.len()) => field_error(
            &mut errors,
            "options",
            "multiple_choice_options",
            format!(
                "MULTIPLE_CHOICE bets need 2-{} options, got {}",
                MAX_OPTIONS,
                request.options.len()
            ),
        ),
        BetType::Prediction if !request.options.is_empty() => field_error(
            &mut errors,
            "options",
            "prediction_options",
            "PREDICTION bets take free-form values, not options".to_string(),
        ),
        _ => {}
    }

    let mut seen = BTreeSet::new();
    for label in &request.options {
        let trimmed = label.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_LABEL_LEN {
            field_error(
                &mut errors,
                "options",
                "option_label",
                format!("option labels must be 1-{} characters", MAX_LABEL_LEN),
            );
        } else if !seen.insert(trimmed.to_lowercase()) {
            field_error(
                &mut errors,
                "options",
                "duplicate_option",
                format!("option '{}' appears more than once", trimmed),
            );
        }
    }

    // Stake configuration per stake type
    match request.stake_type {
        StakeType::Credit => {
            if request.social_stake_description.is_some() {
                field_error(
                    &mut errors,
                    "social_stake_description",
                    "credit_with_social_stake",
                    "CREDIT bets cannot carry a social stake description".to_string(),
                );
            }
            if request.fixed_stake_amount.is_none() && request.minimum_bet.is_none() {
                field_error(
                    &mut errors,
                    "fixed_stake_amount",
                    "missing_stake",
                    "CREDIT bets need a fixed stake or a minimum bet".to_string(),
                );
            }
            if let (Some(min), Some(max)) = (request.minimum_bet, request.maximum_bet) {
                if min > max {
                    field_error(
                        &mut errors,
                        "maximum_bet",
                        "min_above_max",
                        format!("minimum bet {} exceeds maximum bet {}", min, max),
                    );
                }
            }
            let amounts = [
                ("fixed_stake_amount", request.fixed_stake_amount),
                ("minimum_bet", request.minimum_bet),
                ("maximum_bet", request.maximum_bet),
            ];
            for (field, amount) in amounts {
                if amount.map_or(false, |a| a > MAX_STAKE) {
                    field_error(
                        &mut errors,
                        field,
                        "amount_too_large",
                        format!("{} cannot exceed {}", field, MAX_STAKE),
                    );
                }
            }
            if request.minimum_bet == Some(0) {
                field_error(
                    &mut errors,
                    "minimum_bet",
                    "zero_minimum",
                    "minimum bet must be positive".to_string(),
                );
            }
        }
        StakeType::Social => {
            if request.social_stake_description.is_none() {
                field_error(
                    &mut errors,
                    "social_stake_description",
                    "missing_social_stake",
                    "SOCIAL bets need a stake description".to_string(),
                );
            }
            if request.fixed_stake_amount.is_some()
                || request.minimum_bet.is_some()
                || request.maximum_bet.is_some()
            {
                field_error(
                    &mut errors,
                    "fixed_stake_amount",
                    "social_with_credit",
                    "SOCIAL bets cannot carry credit amounts".to_string(),
                );
            }
        }
    }

    // Deadline ordering
    if request.betting_deadline <= now {
        field_error(
            &mut errors,
            "betting_deadline",
            "deadline_in_past",
            "betting deadline must be in the future".to_string(),
        );
    }
    if request.betting_deadline >= request.resolve_date {
        field_error(
            &mut errors,
            "resolve_date",
            "resolve_before_deadline",
            "resolve date must be after the betting deadline".to_string(),
        );
    }

    // Resolver list per resolution method
    match request.resolution_method {
        ResolutionMethod::AssignedResolvers if request.resolver_ids.is_empty() => field_error(
            &mut errors,
            "resolver_ids",
            "missing_resolvers",
            "ASSIGNED_RESOLVERS needs at least one resolver".to_string(),
        ),
        ResolutionMethod::SelfResolved | ResolutionMethod::ParticipantVote
            if !request.resolver_ids.is_empty() =>
        {
            field_error(
                &mut errors,
                "resolver_ids",
                "unexpected_resolvers",
                format!("{} bets do not take an upfront resolver list", request.resolution_method),
            )
        }
        _ => {}
    }

    if request.resolution_method == ResolutionMethod::SelfResolved && request.minimum_votes_required.unwrap_or(1) != 1 {
        field_error(
            &mut errors,
            "minimum_votes_required",
            "self_quorum",
            "SELF bets are decided by the creator's single vote".to_string(),
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.into())
    }
}

/// Validate a join payload against the bet; returns the effective stake amount
pub fn validate_selection(bet: &Bet, request: &JoinBetRequest) -> EngineResult<u64> {
    let context = || ErrorContext::new("validation", "join_bet").with_bet(bet.id);

    match (&request.selection, bet.bet_type.uses_options()) {
        (Selection::Option { index }, true) => {
            if bet.option(*index).is_none() {
                return Err(EngineError::validation(
                    "selection",
                    format!("option {} does not exist on this bet", index),
                    context(),
                ));
            }
        }
        (Selection::Prediction { value }, false) => {
            let value = value.trim();
            if value.is_empty() || value.len() > MAX_PREDICTION_LEN {
                return Err(EngineError::validation(
                    "selection",
                    format!("prediction must be 1-{} characters", MAX_PREDICTION_LEN),
                    context(),
                ));
            }
        }
        (Selection::Option { .. }, false) => {
            return Err(EngineError::validation(
                "selection",
                "PREDICTION bets need a predicted value",
                context(),
            ));
        }
        (Selection::Prediction { .. }, true) => {
            return Err(EngineError::validation(
                "selection",
                format!("{} bets need an option", bet.bet_type),
                context(),
            ));
        }
    }

    if let Some(insurance) = &request.insurance {
        if insurance.refund_percentage > 100 {
            return Err(EngineError::validation(
                "insurance",
                "refund percentage must be between 0 and 100",
                context(),
            ));
        }
        if bet.is_social() {
            return Err(EngineError::validation(
                "insurance",
                "insurance only applies to CREDIT bets",
                context(),
            ));
        }
    }

    stake_amount(bet, request.amount).map_err(|message| EngineError::validation("amount", message, context()))
}

/// Effective stake for a join; SOCIAL bets never move funds
fn stake_amount(bet: &Bet, requested: Option<u64>) -> Result<u64, String> {
    if bet.is_social() {
        return Ok(0);
    }

    if let Some(fixed) = bet.fixed_stake_amount {
        return match requested {
            None => Ok(fixed),
            Some(amount) if amount == fixed => Ok(fixed),
            Some(amount) => Err(format!("this bet has a fixed stake of {}, got {}", fixed, amount)),
        };
    }

    let amount = requested.ok_or_else(|| "amount is required".to_string())?;
    if amount == 0 {
        return Err("amount must be positive".to_string());
    }
    if amount > MAX_STAKE {
        return Err(format!("amount {} exceeds the largest allowed stake {}", amount, MAX_STAKE));
    }
    if let Some(min) = bet.minimum_bet {
        if amount < min {
            return Err(format!("amount {} is below the minimum bet {}", amount, min));
        }
    }
    if let Some(max) = bet.maximum_bet {
        if amount > max {
            return Err(format!("amount {} exceeds the maximum bet {}", amount, max));
        }
    }
    Ok(amount)
}

/// Validate a vote choice against the bet type and the set of predictors
pub fn validate_vote_choice(bet: &Bet, choice: &VoteChoice, predictors: &BTreeSet<UserId>) -> EngineResult<()> {
    let context = || ErrorContext::new("validation", "cast_vote").with_bet(bet.id);

    match (choice, bet.bet_type.uses_options()) {
        (VoteChoice::Option { index }, true) => {
            if bet.option(*index).is_none() {
                return Err(EngineError::validation(
                    "choice",
                    format!("option {} does not exist on this bet", index),
                    context(),
                ));
            }
        }
        (VoteChoice::WinnerSet { winners }, false) => {
            if let Some(unknown) = winners.iter().find(|u| !predictors.contains(u)) {
                return Err(EngineError::validation(
                    "choice",
                    format!("user {} did not place a prediction", unknown),
                    context(),
                ));
            }
        }
        (VoteChoice::Option { .. }, false) => {
            return Err(EngineError::validation(
                "choice",
                "PREDICTION bets are resolved with a winner set",
                context(),
            ));
        }
        (VoteChoice::WinnerSet { .. }, true) => {
            return Err(EngineError::validation(
                "choice",
                format!("{} bets are resolved with an option", bet.bet_type),
                context(),
            ));
        }
    }

    Ok(())
}
