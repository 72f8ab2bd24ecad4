//! Leadership token and role transitions

use std::fmt;

use uuid::Uuid;

/// Opaque value this process writes into the leadership key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipToken(String);

impl LeadershipToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeadershipToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the leadership key currently holds, relative to our token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    /// Absent, expired, or empty
    Vacant,
    Mine,
    Other(String),
}

impl TokenState {
    pub fn classify(stored: Option<&str>, mine: &LeadershipToken) -> Self {
        match stored.map(str::trim) {
            None | Some("") => TokenState::Vacant,
            Some(value) if value == mine.as_str() => TokenState::Mine,
            Some(value) => TokenState::Other(value.to_string()),
        }
    }
}

/// Step the orchestrator takes after reading the leadership key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderAction {
    /// Still leading: extend the key and reconcile
    Refresh,
    /// Someone else leads: stop every bot and go passive
    StandDown,
    /// The key vanished under us: stop every bot, then try to claim again
    Reclaim,
    /// Nobody leads: try to claim
    Claim,
    /// Passive and someone else leads
    Idle,
}

impl LeaderAction {
    pub fn decide(active: bool, state: &TokenState) -> Self {
        match (active, state) {
            (true, TokenState::Mine) => LeaderAction::Refresh,
            (true, TokenState::Other(_)) => LeaderAction::StandDown,
            (true, TokenState::Vacant) => LeaderAction::Reclaim,
            (false, TokenState::Vacant) => LeaderAction::Claim,
            (false, _) => LeaderAction::Idle,
        }
    }
}

/// Local leadership state
///
/// The epoch increments on every promotion and demotion, so work started
/// under one term can be told apart from work started under the next.
#[derive(Debug, Clone)]
pub struct Leadership {
    token: LeadershipToken,
    active: bool,
    epoch: u64,
}

impl Default for Leadership {
    fn default() -> Self {
        Self::new()
    }
}

impl Leadership {
    pub fn new() -> Self {
        Self {
            token: LeadershipToken::generate(),
            active: false,
            epoch: 0,
        }
    }

    pub fn token(&self) -> &LeadershipToken {
        &self.token
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn promote(&mut self) {
        if !self.active {
            self.active = true;
            self.epoch += 1;
        }
    }

    pub(crate) fn demote(&mut self) {
        if self.active {
            self.active = false;
            self.epoch += 1;
        }
    }
}
