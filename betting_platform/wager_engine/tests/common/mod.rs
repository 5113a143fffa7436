//! Shared harness for engine integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::broadcast;

use wager_engine::{
    BetEvent, BetType, BroadcastEventSink, Clock, Collaborators, CreateBetRequest, EngineConfig, GroupId,
    InMemoryBlobStore, InMemoryIdentity, InMemoryMembership, InMemoryStore, JoinBetRequest,
    ManualClock, ResolutionMethod, Selection, StakeType, UserId, WagerEngine,
};

pub struct Member {
    pub id: UserId,
    pub session: String,
}

pub struct TestContext {
    pub engine: Arc<WagerEngine>,
    pub store: InMemoryStore,
    pub identity: Arc<InMemoryIdentity>,
    pub membership: Arc<InMemoryMembership>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub clock: Arc<ManualClock>,
    pub group: GroupId,
    events: broadcast::Receiver<BetEvent>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = InMemoryStore::new();
        let identity = Arc::new(InMemoryIdentity::new());
        let membership = Arc::new(InMemoryMembership::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let sink = Arc::new(BroadcastEventSink::from_config(&config));
        let events = sink.subscribe();
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        ));

        let deps = Collaborators::new(identity.clone(), membership.clone(), blobs.clone(), clock.clone())
            .with_events(sink);
        let engine = Arc::new(WagerEngine::new(config, Arc::new(store.clone()), deps));

        Self {
            engine,
            store,
            identity,
            membership,
            blobs,
            clock,
            group: GroupId::new(),
            events,
        }
    }

    /// A group member with a session and `balance` credits
    pub async fn member(&self, balance: u64) -> Member {
        let id = UserId::new();
        self.membership.add_member(self.group, id);
        self.store.set_balance(id, balance).await;
        Member {
            id,
            session: self.identity.session_for(id),
        }
    }

    /// A signed-in user outside the group
    pub fn outsider(&self) -> Member {
        let id = UserId::new();
        Member {
            id,
            session: self.identity.session_for(id),
        }
    }

    /// Bet request closing in one hour and resolving in two
    pub fn bet_request(
        &self,
        bet_type: BetType,
        stake_type: StakeType,
        resolution_method: ResolutionMethod,
    ) -> CreateBetRequest {
        bet_request_at(self.group, self.clock.now(), bet_type, stake_type, resolution_method)
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn pass_betting_deadline(&self) {
        self.clock.advance(Duration::minutes(61));
    }

    /// Everything emitted since the last drain
    pub fn drain_events(&mut self) -> Vec<BetEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

/// Bet request in `group` closing an hour after `now` and resolving an hour later
pub fn bet_request_at(
    group: GroupId,
    now: DateTime<Utc>,
    bet_type: BetType,
    stake_type: StakeType,
    resolution_method: ResolutionMethod,
) -> CreateBetRequest {
    let options: &[&str] = match bet_type {
        BetType::Binary => &["Yes", "No"],
        BetType::MultipleChoice => &["Red", "Green", "Blue"],
        BetType::Prediction => &[],
    };
    let credit = stake_type == StakeType::Credit;
    CreateBetRequest {
        group_id: group,
        title: "Will it rain on Saturday?".to_string(),
        description: None,
        bet_type,
        stake_type,
        resolution_method,
        options: options.iter().map(|s| s.to_string()).collect(),
        fixed_stake_amount: None,
        social_stake_description: if credit { None } else { Some("Loser buys coffee".to_string()) },
        minimum_bet: if credit { Some(1) } else { None },
        maximum_bet: None,
        betting_deadline: now + Duration::hours(1),
        resolve_date: now + Duration::hours(2),
        minimum_votes_required: None,
        allow_creator_vote: false,
        resolver_ids: Vec::new(),
    }
}

pub fn pick(index: u8, amount: u64) -> JoinBetRequest {
    JoinBetRequest {
        selection: Selection::Option { index },
        amount: Some(amount),
        insurance: None,
    }
}

pub fn predict(value: &str, amount: u64) -> JoinBetRequest {
    JoinBetRequest {
        selection: Selection::Prediction {
            value: value.to_string(),
        },
        amount: Some(amount),
        insurance: None,
    }
}

pub fn pick_social(index: u8) -> JoinBetRequest {
    JoinBetRequest {
        selection: Selection::Option { index },
        amount: None,
        insurance: None,
    }
}
