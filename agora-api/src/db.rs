use std::collections::HashMap;

use async_trait::async_trait;

use crate::{Post, UserId, VoteDirection, VoteTarget};

/// Storage operations the vote ledger and the rankings rely on
#[async_trait]
pub trait Db: Send {
    /// Returns `None` if the target does not exist, otherwise the vote the
    /// user currently has on it, if any.
    async fn current_vote(
        &mut self,
        target: VoteTarget,
        user: UserId,
    ) -> anyhow::Result<Option<Option<VoteDirection>>>;

    /// Atomically replaces the user's vote on `target` with `next` and adds
    /// `delta` to its tally, but only if the user's vote is still `expected`.
    ///
    /// Returns the new tally, or `None` if the vote changed in the meantime.
    async fn swap_vote(
        &mut self,
        target: VoteTarget,
        user: UserId,
        expected: Option<VoteDirection>,
        next: VoteDirection,
        delta: i64,
    ) -> anyhow::Result<Option<i64>>;

    /// At most `limit` posts, highest tally first, then newest first
    async fn top_posts(&mut self, limit: usize) -> anyhow::Result<Vec<Post>>;

    async fn post_counts_by_author(&mut self) -> anyhow::Result<Vec<(UserId, u64)>>;

    async fn comment_counts_by_author(&mut self) -> anyhow::Result<Vec<(UserId, u64)>>;

    async fn post_counts_by_category(&mut self) -> anyhow::Result<Vec<(String, u64)>>;

    /// Users that do not exist are absent from the returned map
    async fn usernames(&mut self, users: &[UserId]) -> anyhow::Result<HashMap<UserId, String>>;
}
