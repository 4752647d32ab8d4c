use std::collections::{BTreeMap, HashMap};

use anyhow::Context;

use crate::{Db, Post, UserId};

pub const TOP_POSTS: usize = 10;
pub const TOP_USERS: usize = 5;
pub const TOP_CATEGORIES: usize = 5;

/// Display name for ranked users that could not be found anymore
pub const UNKNOWN_USERNAME: &str = "Unknown user";

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRanking {
    pub id: UserId,
    pub username: String,
    pub post_count: u64,
    pub comment_count: u64,
    pub total_interactions: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CategoryRanking {
    pub name: String,
    pub count: u64,
}

/// Per-user activity, before usernames are resolved
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Interactions {
    pub posts: u64,
    pub comments: u64,
}

impl Interactions {
    pub fn total(&self) -> u64 {
        self.posts + self.comments
    }
}

/// Highest tally first; ties go to the newest post, then to the lowest id
pub fn sort_by_votes(posts: &mut [Post]) {
    posts.sort_by(|a, b| {
        b.votes
            .cmp(&a.votes)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Joins both per-author counts on user id, a user missing from one side
/// counting zero there. Result is sorted by total interactions, descending.
pub fn merge_interactions(
    posts: impl IntoIterator<Item = (UserId, u64)>,
    comments: impl IntoIterator<Item = (UserId, u64)>,
) -> Vec<(UserId, Interactions)> {
    let mut merged = BTreeMap::<UserId, Interactions>::new();
    for (user, n) in posts {
        merged.entry(user).or_default().posts += n;
    }
    for (user, n) in comments {
        merged.entry(user).or_default().comments += n;
    }
    let mut res = merged.into_iter().collect::<Vec<_>>();
    // stable sort, so equal totals stay ordered by user id
    res.sort_by(|(_, a), (_, b)| b.total().cmp(&a.total()));
    res
}

/// Sums counts per category and sorts them descending, ties by name
pub fn sort_categories(counts: impl IntoIterator<Item = (String, u64)>) -> Vec<CategoryRanking> {
    let mut merged = BTreeMap::<String, u64>::new();
    for (name, n) in counts {
        *merged.entry(name).or_default() += n;
    }
    let mut res = merged
        .into_iter()
        .map(|(name, count)| CategoryRanking { name, count })
        .collect::<Vec<_>>();
    res.sort_by(|a, b| b.count.cmp(&a.count));
    res
}

pub async fn top_posts<D: Db>(db: &mut D) -> anyhow::Result<Vec<Post>> {
    let mut posts = db
        .top_posts(TOP_POSTS)
        .await
        .context("fetching most voted posts")?;
    sort_by_votes(&mut posts);
    posts.truncate(TOP_POSTS);
    Ok(posts)
}

pub async fn top_users<D: Db>(db: &mut D) -> anyhow::Result<Vec<UserRanking>> {
    let posts = db
        .post_counts_by_author()
        .await
        .context("counting posts per author")?;
    let comments = db
        .comment_counts_by_author()
        .await
        .context("counting comments per author")?;
    let mut ranked = merge_interactions(posts, comments);
    ranked.truncate(TOP_USERS);

    let ids = ranked.iter().map(|(u, _)| *u).collect::<Vec<_>>();
    let mut names: HashMap<UserId, String> = db
        .usernames(&ids)
        .await
        .with_context(|| format!("fetching names of {} ranked users", ids.len()))?;
    Ok(ranked
        .into_iter()
        .map(|(id, i)| UserRanking {
            id,
            username: names
                .remove(&id)
                .unwrap_or_else(|| String::from(UNKNOWN_USERNAME)),
            post_count: i.posts,
            comment_count: i.comments,
            total_interactions: i.total(),
        })
        .collect())
}

pub async fn top_categories<D: Db>(db: &mut D) -> anyhow::Result<Vec<CategoryRanking>> {
    let counts = db
        .post_counts_by_category()
        .await
        .context("counting posts per category")?;
    let mut res = sort_categories(counts);
    res.truncate(TOP_CATEGORIES);
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Author, PostId, Uuid};
    use chrono::{Duration, TimeZone, Utc};

    fn user(n: u8) -> UserId {
        UserId(Uuid::from_bytes([n; 16]))
    }

    fn post(n: u8, votes: i64, age_minutes: i64) -> Post {
        Post {
            id: PostId(Uuid::from_bytes([n; 16])),
            author: Author {
                id: user(0),
                username: String::from("author"),
            },
            title: format!("post {n}"),
            content: String::new(),
            category: String::from("general"),
            file: None,
            votes,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap() - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn posts_sorted_by_votes_then_recency() {
        let mut posts = vec![post(1, 3, 0), post(2, 5, 10), post(3, 3, 5), post(4, -1, 0)];
        sort_by_votes(&mut posts);
        let order = posts.iter().map(|p| p.title.as_str()).collect::<Vec<_>>();
        assert_eq!(order, ["post 2", "post 1", "post 3", "post 4"]);
    }

    #[test]
    fn merge_counts_users_present_on_one_side() {
        let merged = merge_interactions(
            vec![(user(1), 2), (user(2), 1)],
            vec![(user(2), 4), (user(3), 1)],
        );
        assert_eq!(
            merged,
            vec![
                (
                    user(2),
                    Interactions {
                        posts: 1,
                        comments: 4
                    }
                ),
                (
                    user(1),
                    Interactions {
                        posts: 2,
                        comments: 0
                    }
                ),
                (
                    user(3),
                    Interactions {
                        posts: 0,
                        comments: 1
                    }
                ),
            ]
        );
    }

    #[test]
    fn categories_sorted_with_name_tie_break() {
        let res = sort_categories(vec![
            (String::from("news"), 2),
            (String::from("art"), 2),
            (String::from("help"), 7),
        ]);
        assert_eq!(
            res,
            vec![
                CategoryRanking {
                    name: String::from("help"),
                    count: 7
                },
                CategoryRanking {
                    name: String::from("art"),
                    count: 2
                },
                CategoryRanking {
                    name: String::from("news"),
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn fuzz_merge_preserves_totals() {
        bolero::check!()
            .with_type::<(Vec<(u8, u8)>, Vec<(u8, u8)>)>()
            .cloned()
            .for_each(|(posts, comments)| {
                let posts = posts
                    .into_iter()
                    .map(|(u, n)| (user(u % 16), u64::from(n)))
                    .collect::<Vec<_>>();
                let comments = comments
                    .into_iter()
                    .map(|(u, n)| (user(u % 16), u64::from(n)))
                    .collect::<Vec<_>>();
                let merged = merge_interactions(posts.clone(), comments.clone());

                let sum = |v: &[(UserId, u64)], u: UserId| {
                    v.iter().filter(|(x, _)| *x == u).map(|(_, n)| n).sum::<u64>()
                };
                for (u, i) in &merged {
                    assert_eq!(i.posts, sum(&posts, *u));
                    assert_eq!(i.comments, sum(&comments, *u));
                }
                assert!(merged
                    .windows(2)
                    .all(|w| w[0].1.total() >= w[1].1.total()));
                let grand_total = posts.iter().chain(&comments).map(|(_, n)| n).sum::<u64>();
                assert_eq!(
                    merged.iter().map(|(_, i)| i.total()).sum::<u64>(),
                    grand_total
                );
            })
    }
}
