use std::{collections::HashMap, fmt, str::FromStr};

use anyhow::{anyhow, Context};
use bolero::generator::TypeGenerator;

use crate::{CommentId, Db, Error, PostId, UserId};

/// Number of compare-and-swap rounds before giving up on a contended vote
pub const MAX_VOTE_ATTEMPTS: usize = 3;

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    pub fn weight(self) -> i64 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VoteDirection::Up => "up",
            VoteDirection::Down => "down",
        }
    }
}

impl fmt::Display for VoteDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<VoteDirection> {
        match s {
            "up" => Ok(VoteDirection::Up),
            "down" => Ok(VoteDirection::Down),
            _ => Err(anyhow!("unknown vote direction {s:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum VoteTarget {
    Post(PostId),
    Comment(CommentId),
}

impl VoteTarget {
    pub fn not_found(self) -> Error {
        match self {
            VoteTarget::Post(p) => Error::PostNotFound(p),
            VoteTarget::Comment(c) => Error::CommentNotFound(c),
        }
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct VoteRequest {
    #[serde(rename = "type")]
    pub direction: VoteDirection,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct VoteResponse {
    pub votes: i64,
}

/// Tally change caused by moving a user's vote from `prev` to `next`.
///
/// Re-casting the vote the user already has is rejected rather than undone.
pub fn transition(prev: Option<VoteDirection>, next: VoteDirection) -> Result<i64, Error> {
    match prev {
        Some(prev) if prev == next => Err(Error::DuplicateVote(next)),
        Some(prev) => Ok(next.weight() - prev.weight()),
        None => Ok(next.weight()),
    }
}

/// Vote state of a single post or comment
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Votes {
    pub tally: i64,
    pub voters: HashMap<UserId, VoteDirection>,
}

impl Votes {
    pub fn new() -> Votes {
        Votes::default()
    }

    pub fn of(&self, user: &UserId) -> Option<VoteDirection> {
        self.voters.get(user).copied()
    }

    /// Records `direction` for `user` and returns the new tally. Leaves
    /// everything untouched on error.
    pub fn apply(&mut self, user: UserId, direction: VoteDirection) -> Result<i64, Error> {
        let delta = transition(self.of(&user), direction)?;
        self.tally += delta;
        self.voters.insert(user, direction);
        Ok(self.tally)
    }

    /// Checks that the tally is the signed sum of the recorded votes
    pub fn is_consistent(&self) -> bool {
        self.tally == self.voters.values().map(|d| d.weight()).sum::<i64>()
    }
}

/// Casts `user`'s vote on `target`, returning the resulting tally.
///
/// The outer error is a storage failure, the inner one is meant for the client.
pub async fn cast_vote<D: Db>(
    db: &mut D,
    target: VoteTarget,
    user: UserId,
    direction: VoteDirection,
) -> anyhow::Result<Result<i64, Error>> {
    for attempt in 0..MAX_VOTE_ATTEMPTS {
        let prev = match db
            .current_vote(target, user)
            .await
            .with_context(|| format!("reading vote of {user:?} on {target:?}"))?
        {
            Some(prev) => prev,
            None => return Ok(Err(target.not_found())),
        };
        let delta = match transition(prev, direction) {
            Ok(delta) => delta,
            Err(e) => return Ok(Err(e)),
        };
        match db
            .swap_vote(target, user, prev, direction, delta)
            .await
            .with_context(|| format!("recording vote of {user:?} on {target:?}"))?
        {
            Some(tally) => {
                tracing::debug!(?target, ?user, %direction, delta, tally, "vote recorded");
                return Ok(Ok(tally));
            }
            None => {
                tracing::debug!(?target, ?user, attempt, "vote changed concurrently, retrying")
            }
        }
    }
    Err(anyhow!(
        "vote of {user:?} on {target:?} kept changing after {MAX_VOTE_ATTEMPTS} attempts"
    ))
}
