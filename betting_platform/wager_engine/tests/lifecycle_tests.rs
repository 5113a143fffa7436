//! Bet lifecycle flows through the engine with the in-memory store

mod common;

use std::collections::BTreeSet;

use common::{pick, predict, TestContext};
use wager_engine::{
    BetEvent, BetOutcome, BetStatus, BetType, CancelBetRequest, CastVoteRequest, ErrorKind,
    ParticipationStatus, ResolutionMethod, StakeType, VoteChoice,
};

fn vote_option(index: u8) -> CastVoteRequest {
    CastVoteRequest {
        choice: VoteChoice::Option { index },
        reasoning: None,
    }
}

fn vote_winners(winners: &[wager_engine::UserId]) -> CastVoteRequest {
    CastVoteRequest {
        choice: VoteChoice::WinnerSet {
            winners: winners.iter().copied().collect(),
        },
        reasoning: None,
    }
}

#[tokio::test]
async fn test_create_bet_emits_event_and_starts_open() {
    let mut ctx = TestContext::new();
    let creator = ctx.member(0).await;

    let request = ctx.bet_request(BetType::MultipleChoice, StakeType::Credit, ResolutionMethod::SelfResolved);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();

    assert_eq!(bet.status, BetStatus::Open);
    assert_eq!(bet.creator_id, creator.id);
    assert_eq!(bet.options.iter().map(|o| o.index).collect::<Vec<_>>(), vec![1, 2, 3]);

    let events = ctx.drain_events();
    assert!(matches!(events.as_slice(), [BetEvent::BetCreated { bet_id, .. }] if *bet_id == bet.id));
}

#[tokio::test]
async fn test_create_bet_rejects_bad_requests() {
    let ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let outsider = ctx.outsider();

    let mut past = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    past.betting_deadline = ctx.clock_now() - chrono::Duration::minutes(1);
    let err = ctx.engine.create_bet(&creator.session, past).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);

    let mut resolvers = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::AssignedResolvers);
    resolvers.resolver_ids = vec![outsider.id];
    let err = ctx.engine.create_bet(&creator.session, resolvers).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(err.field(), Some("resolver_ids"));

    let request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    let err = ctx.engine.create_bet(&outsider.session, request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authorization);

    let request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    let err = ctx.engine.create_bet("no-such-session", request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unauthenticated);
}

#[tokio::test]
async fn test_join_rules() {
    let ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let alice = ctx.member(100).await;
    let broke = ctx.member(5).await;
    let outsider = ctx.outsider();

    let request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();

    let joined = ctx.engine.join_bet(&alice.session, bet.id, pick(1, 10)).await.unwrap();
    assert_eq!(joined.amount, 10);
    assert_eq!(joined.status, ParticipationStatus::Active);
    assert_eq!(ctx.store.balance_of(alice.id).await, 90);

    let err = ctx.engine.join_bet(&alice.session, bet.id, pick(2, 10)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Duplicate);
    assert_eq!(ctx.store.balance_of(alice.id).await, 90);

    let err = ctx.engine.join_bet(&broke.session, bet.id, pick(2, 10)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InsufficientFunds);
    assert_eq!(ctx.store.balance_of(broke.id).await, 5);

    let err = ctx.engine.join_bet(&outsider.session, bet.id, pick(2, 1)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authorization);

    let err = ctx.engine.join_bet(&creator.session, bet.id, pick(3, 1)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);

    let view = ctx.engine.get_bet(&creator.session, bet.id).await.unwrap();
    assert_eq!(view.total_pool, 10);
    assert_eq!(view.total_participants, 1);
    assert_eq!(view.options[0].pool, 10);
    assert!(view.is_creator);
    assert!(view.my_participation.is_none());
}

#[tokio::test]
async fn test_oversized_stakes_are_rejected_without_moving_funds() {
    let ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let whale = ctx.member(u64::MAX).await;
    let other_whale = ctx.member(u64::MAX).await;

    let request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();

    let err = ctx.engine.join_bet(&whale.session, bet.id, pick(1, 1 << 63)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(err.field(), Some("amount"));
    assert_eq!(ctx.store.balance_of(whale.id).await, u64::MAX);

    let largest = i64::MAX as u64;
    ctx.engine.join_bet(&whale.session, bet.id, pick(1, largest)).await.unwrap();

    // the pool cannot grow past what the ledger can represent
    let err = ctx.engine.join_bet(&other_whale.session, bet.id, pick(2, largest)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert_eq!(ctx.store.balance_of(other_whale.id).await, u64::MAX);

    let view = ctx.engine.get_bet(&creator.session, bet.id).await.unwrap();
    assert_eq!(view.total_pool, largest);
    assert_eq!(view.total_participants, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_keep_aggregates_consistent() {
    let ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let mut request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    request.minimum_bet = None;
    request.fixed_stake_amount = Some(5);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();

    let mut members = Vec::new();
    for _ in 0..20 {
        members.push(ctx.member(50).await);
    }

    let handles: Vec<_> = members
        .iter()
        .enumerate()
        .map(|(i, member)| {
            let engine = ctx.engine.clone();
            let session = member.session.clone();
            let bet_id = bet.id;
            tokio::spawn(async move {
                let index = (i % 2) as u8 + 1;
                engine
                    .join_bet(
                        &session,
                        bet_id,
                        wager_engine::JoinBetRequest {
                            selection: wager_engine::Selection::Option { index },
                            amount: None,
                            insurance: None,
                        },
                    )
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let view = ctx.engine.get_bet(&creator.session, bet.id).await.unwrap();
    assert_eq!(view.total_pool, 100);
    assert_eq!(view.total_participants, 20);
    assert_eq!(view.options[0].pool + view.options[1].pool, 100);
    assert_eq!(view.options[0].participant_count, 10);
}

#[tokio::test]
async fn test_close_is_idempotent_and_blocks_joins() {
    let mut ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let alice = ctx.member(100).await;
    let bob = ctx.member(100).await;

    let request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();
    ctx.engine.join_bet(&alice.session, bet.id, pick(1, 10)).await.unwrap();

    let err = ctx.engine.close_bet(&alice.session, bet.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authorization);

    let closed = ctx.engine.close_bet(&creator.session, bet.id).await.unwrap();
    assert_eq!(closed.status, BetStatus::Closed);
    let again = ctx.engine.close_bet(&creator.session, bet.id).await.unwrap();
    assert_eq!(again.status, BetStatus::Closed);

    let err = ctx.engine.join_bet(&bob.session, bet.id, pick(2, 10)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::StateConflict);
    assert_eq!(ctx.store.balance_of(bob.id).await, 100);

    let closes = ctx
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, BetEvent::BetClosed { .. }))
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn test_vote_before_deadline_on_open_bet_is_rejected() {
    let ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();

    let err = ctx.engine.cast_vote(&creator.session, bet.id, vote_option(1)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::StateConflict);
}

#[tokio::test]
async fn test_self_resolved_vote_after_deadline_closes_and_resolves() {
    let mut ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let alice = ctx.member(100).await;
    let bob = ctx.member(100).await;

    let request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();
    ctx.engine.join_bet(&alice.session, bet.id, pick(1, 10)).await.unwrap();
    ctx.engine.join_bet(&bob.session, bet.id, pick(2, 10)).await.unwrap();
    ctx.drain_events();

    ctx.pass_betting_deadline();
    let err = ctx.engine.cast_vote(&alice.session, bet.id, vote_option(1)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authorization);

    let receipt = ctx.engine.cast_vote(&creator.session, bet.id, vote_option(1)).await.unwrap();
    assert_eq!(receipt.bet.status, BetStatus::Resolved);
    assert_eq!(receipt.bet.outcome, Some(BetOutcome::Option { index: 1 }));
    assert_eq!(receipt.progress.quorum, 1);

    assert_eq!(ctx.store.balance_of(alice.id).await, 110);
    assert_eq!(ctx.store.balance_of(bob.id).await, 90);

    let events = ctx.drain_events();
    assert!(matches!(events[0], BetEvent::BetClosed { closed_by: None, .. }));
    match &events[1] {
        BetEvent::BetResolved { winners, .. } => assert_eq!(winners, &vec![alice.id]),
        other => panic!("expected BetResolved, got {:?}", other),
    }
}

#[tokio::test]
async fn test_revote_supersedes_previous_vote() {
    let ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let resolvers = [ctx.member(0).await, ctx.member(0).await, ctx.member(0).await];

    let mut request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::AssignedResolvers);
    request.resolver_ids = resolvers.iter().map(|r| r.id).collect();
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();
    ctx.engine.close_bet(&creator.session, bet.id).await.unwrap();

    let first = ctx.engine.cast_vote(&resolvers[0].session, bet.id, vote_option(1)).await.unwrap();
    assert!(first.superseded.is_none());

    let second = ctx.engine.cast_vote(&resolvers[0].session, bet.id, vote_option(2)).await.unwrap();
    assert_eq!(second.superseded, Some(first.vote_id));
    assert_eq!(second.progress.votes_cast, 1);
    assert_eq!(second.progress.quorum, 3);
    assert_eq!(second.progress.votes_remaining(), 2);
    assert_eq!(ctx.store.active_vote_count(bet.id, resolvers[0].id).await, 1);

    let err = ctx.engine.cast_vote(&creator.session, bet.id, vote_option(1)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authorization);
}

#[tokio::test]
async fn test_quorum_two_of_three_resolves_on_second_vote() {
    let mut ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let alice = ctx.member(100).await;
    let resolvers = [ctx.member(0).await, ctx.member(0).await, ctx.member(0).await];

    let mut request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::AssignedResolvers);
    request.resolver_ids = resolvers.iter().map(|r| r.id).collect();
    request.minimum_votes_required = Some(2);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();
    ctx.engine.join_bet(&alice.session, bet.id, pick(1, 10)).await.unwrap();
    ctx.engine.close_bet(&resolvers[1].session, bet.id).await.unwrap();

    let first = ctx.engine.cast_vote(&resolvers[0].session, bet.id, vote_option(1)).await.unwrap();
    assert_eq!(first.bet.status, BetStatus::Closed);
    assert!(!first.progress.is_decided());

    let progress = ctx.engine.get_vote_progress(&alice.session, bet.id).await.unwrap();
    assert_eq!(progress.votes_cast, 1);
    assert_eq!(progress.votes_remaining(), 1);

    ctx.drain_events();
    let second = ctx.engine.cast_vote(&resolvers[2].session, bet.id, vote_option(1)).await.unwrap();
    assert_eq!(second.bet.status, BetStatus::Resolved);
    assert_eq!(second.bet.outcome, Some(BetOutcome::Option { index: 1 }));
    assert_eq!(ctx.store.balance_of(alice.id).await, 100);

    let resolved = ctx
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, BetEvent::BetResolved { .. }))
        .count();
    assert_eq!(resolved, 1);

    let err = ctx.engine.cast_vote(&resolvers[1].session, bet.id, vote_option(2)).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::StateConflict);
}

#[tokio::test]
async fn test_binary_tie_resolves_as_draw_with_refunds() {
    let ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let voters = [
        ctx.member(100).await,
        ctx.member(100).await,
        ctx.member(100).await,
        ctx.member(100).await,
    ];

    let request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::ParticipantVote);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();
    for (i, voter) in voters.iter().enumerate() {
        let side = if i < 2 { 1 } else { 2 };
        ctx.engine.join_bet(&voter.session, bet.id, pick(side, 10)).await.unwrap();
    }

    ctx.pass_betting_deadline();
    let mut last = None;
    for (i, voter) in voters.iter().enumerate() {
        let side = if i < 2 { 1 } else { 2 };
        last = Some(ctx.engine.cast_vote(&voter.session, bet.id, vote_option(side)).await.unwrap());
    }

    let receipt = last.unwrap();
    assert_eq!(receipt.progress.quorum, 4);
    assert_eq!(receipt.bet.outcome, Some(BetOutcome::Draw));
    for voter in &voters {
        assert_eq!(ctx.store.balance_of(voter.id).await, 100);
    }

    let view = ctx.engine.get_bet(&voters[0].session, bet.id).await.unwrap();
    assert!(view.participants.iter().all(|p| p.status == ParticipationStatus::Draw));
    assert_eq!(view.outcome_label.as_deref(), Some("Draw"));
}

#[tokio::test]
async fn test_prediction_majority_names_the_winner() {
    let ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let u = ctx.member(100).await;
    let v = ctx.member(100).await;
    let w = ctx.member(100).await;

    let request = ctx.bet_request(BetType::Prediction, StakeType::Credit, ResolutionMethod::ParticipantVote);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();
    ctx.engine.join_bet(&u.session, bet.id, predict("3-1 home win", 10)).await.unwrap();
    ctx.engine.join_bet(&v.session, bet.id, predict("2-2 draw", 10)).await.unwrap();
    ctx.engine.join_bet(&w.session, bet.id, predict("0-1 away win", 10)).await.unwrap();

    ctx.pass_betting_deadline();
    let err = ctx
        .engine
        .cast_vote(&u.session, bet.id, vote_winners(&[creator.id]))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);

    ctx.engine.cast_vote(&u.session, bet.id, vote_winners(&[u.id])).await.unwrap();
    ctx.engine.cast_vote(&v.session, bet.id, vote_winners(&[u.id])).await.unwrap();
    let receipt = ctx.engine.cast_vote(&w.session, bet.id, vote_winners(&[w.id])).await.unwrap();

    let expected: BTreeSet<_> = [u.id].into_iter().collect();
    assert_eq!(
        receipt.bet.outcome,
        Some(BetOutcome::Predictions {
            winners: expected,
            draws: BTreeSet::new(),
        })
    );
    assert_eq!(ctx.store.balance_of(u.id).await, 120);
    assert_eq!(ctx.store.balance_of(v.id).await, 90);
    assert_eq!(ctx.store.balance_of(w.id).await, 90);
}

#[tokio::test]
async fn test_explicit_resolve_requires_decided_tally() {
    let ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let resolvers = [ctx.member(0).await, ctx.member(0).await];

    let mut request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::AssignedResolvers);
    request.resolver_ids = resolvers.iter().map(|r| r.id).collect();
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();

    let err = ctx.engine.resolve_bet(&creator.session, bet.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::StateConflict);

    ctx.engine.close_bet(&creator.session, bet.id).await.unwrap();
    ctx.engine.cast_vote(&resolvers[0].session, bet.id, vote_option(2)).await.unwrap();
    let err = ctx.engine.resolve_bet(&creator.session, bet.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::StateConflict);

    let receipt = ctx.engine.cast_vote(&resolvers[1].session, bet.id, vote_option(2)).await.unwrap();
    assert_eq!(receipt.bet.status, BetStatus::Resolved);

    let again = ctx.engine.resolve_bet(&creator.session, bet.id).await.unwrap();
    assert_eq!(again.outcome, Some(BetOutcome::Option { index: 2 }));
    assert_eq!(again.resolved_at, receipt.bet.resolved_at);
}

#[tokio::test]
async fn test_cancel_open_credit_bet_refunds_everyone() {
    let mut ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let players = [ctx.member(50).await, ctx.member(50).await, ctx.member(50).await];

    let mut request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    request.minimum_bet = None;
    request.fixed_stake_amount = Some(10);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();
    for (i, player) in players.iter().enumerate() {
        ctx.engine
            .join_bet(&player.session, bet.id, pick((i % 2) as u8 + 1, 10))
            .await
            .unwrap();
        assert_eq!(ctx.store.balance_of(player.id).await, 40);
    }

    let err = ctx
        .engine
        .cancel_bet(&players[0].session, bet.id, CancelBetRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authorization);

    let reason = CancelBetRequest {
        reason: Some("match postponed".to_string()),
    };
    let cancelled = ctx.engine.cancel_bet(&creator.session, bet.id, reason).await.unwrap();
    assert_eq!(cancelled.status, BetStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("match postponed"));
    assert_eq!(cancelled.total_pool, 0);

    for player in &players {
        assert_eq!(ctx.store.balance_of(player.id).await, 50);
    }

    // second cancel is a no-op, no double refund
    let again = ctx
        .engine
        .cancel_bet(&creator.session, bet.id, CancelBetRequest::default())
        .await
        .unwrap();
    assert_eq!(again.status, BetStatus::Cancelled);
    assert_eq!(ctx.store.balance_of(players[0].id).await, 50);

    let err = ctx.engine.close_bet(&creator.session, bet.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::StateConflict);

    let view = ctx.engine.get_bet(&players[0].session, bet.id).await.unwrap();
    assert!(view.participants.iter().all(|p| p.status == ParticipationStatus::Refunded));

    let cancels = ctx
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, BetEvent::BetCancelled { .. }))
        .count();
    assert_eq!(cancels, 1);
}

#[tokio::test]
async fn test_resolved_bet_cannot_be_cancelled() {
    let ctx = TestContext::new();
    let creator = ctx.member(0).await;
    let request = ctx.bet_request(BetType::Binary, StakeType::Credit, ResolutionMethod::SelfResolved);
    let bet = ctx.engine.create_bet(&creator.session, request).await.unwrap();
    ctx.pass_betting_deadline();
    ctx.engine.cast_vote(&creator.session, bet.id, vote_option(1)).await.unwrap();

    let err = ctx
        .engine
        .cancel_bet(&creator.session, bet.id, CancelBetRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::StateConflict);
}

#[tokio::test]
async fn test_unknown_bet_is_not_found() {
    let ctx = TestContext::new();
    let member = ctx.member(0).await;
    let err = ctx
        .engine
        .get_bet(&member.session, wager_engine::BetId::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_engine_logs_events_when_no_sink_is_wired() {
    use std::sync::Arc;
    use wager_engine::{
        Collaborators, EngineConfig, InMemoryBlobStore, InMemoryIdentity, InMemoryMembership,
        InMemoryStore, ManualClock, UserId, WagerEngine,
    };

    let identity = Arc::new(InMemoryIdentity::new());
    let membership = Arc::new(InMemoryMembership::new());
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let deps = Collaborators::new(
        identity.clone(),
        membership.clone(),
        Arc::new(InMemoryBlobStore::new()),
        clock.clone(),
    );
    let engine = WagerEngine::new(EngineConfig::default(), Arc::new(InMemoryStore::new()), deps);

    let creator = UserId::new();
    let request = common::bet_request_at(
        wager_engine::GroupId::new(),
        chrono::Utc::now(),
        BetType::Binary,
        StakeType::Social,
        ResolutionMethod::SelfResolved,
    );
    membership.add_member(request.group_id, creator);
    let session = identity.session_for(creator);

    let bet = engine.create_bet(&session, request).await.unwrap();
    let closed = engine.close_bet(&session, bet.id).await.unwrap();
    assert_eq!(closed.status, BetStatus::Closed);
}
