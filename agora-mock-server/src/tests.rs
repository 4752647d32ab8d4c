use std::{collections::HashMap, future::Future, panic::AssertUnwindSafe};

use agora_api::{
    ranking::{self, UNKNOWN_USERNAME},
    COMMENT_PREVIEW_LEN,
};

use super::*;

fn block_on<F: Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed initializing tokio runtime")
        .block_on(f)
}

fn creds(name: &str) -> Credentials {
    Credentials::new(String::from(name), format!("{name} password"))
}

fn new_post(title: &str, category: &str) -> NewPost {
    NewPost {
        title: String::from(title),
        content: format!("body of {title}"),
        category: String::from(category),
        file: None,
    }
}

fn new_comment(content: &str) -> NewComment {
    NewComment {
        content: String::from(content),
    }
}

/// One post by alice, voted on by bob
fn one_post() -> (MockServer, UserId, UserId, PostId) {
    let mut s = MockServer::new();
    let alice = s.register(creds("alice")).unwrap();
    let bob = s.register(creds("bob")).unwrap();
    let post = s.create_post(alice, new_post("hello", "news")).unwrap();
    (s, alice, bob, post.id)
}

#[test]
fn register_and_login() {
    let mut s = MockServer::new();
    let alice = s.register(creds("alice")).unwrap();
    assert_eq!(s.test_num_users(), 1);
    assert_eq!(
        s.register(creds("alice")),
        Err(Error::NameAlreadyUsed(String::from("alice")))
    );
    assert_eq!(s.test_num_users(), 1);

    assert_eq!(s.login(creds("alice")), Ok(alice));
    assert_eq!(
        s.login(Credentials::new(String::from("alice"), String::from("nope"))),
        Err(Error::InvalidCredentials)
    );
    assert_eq!(s.login(creds("mallory")), Err(Error::InvalidCredentials));
    assert_eq!(
        s.login(Credentials::new(String::from("alice"), String::new())),
        Err(Error::MissingField(String::from("password")))
    );
}

#[test]
fn up_down_sequence() {
    let (mut s, _, bob, post) = one_post();
    let target = VoteTarget::Post(post);
    block_on(async {
        assert_eq!(s.vote(target, bob, VoteDirection::Up).await, Ok(1));
        assert_eq!(
            s.vote(target, bob, VoteDirection::Up).await,
            Err(Error::DuplicateVote(VoteDirection::Up))
        );
        assert_eq!(s.post(post).unwrap().votes, 1);
        assert_eq!(s.vote(target, bob, VoteDirection::Down).await, Ok(-1));
        assert_eq!(
            s.vote(target, bob, VoteDirection::Down).await,
            Err(Error::DuplicateVote(VoteDirection::Down))
        );
        assert_eq!(s.vote(target, bob, VoteDirection::Up).await, Ok(1));
    });
    assert_eq!(s.post(post).unwrap().votes, 1);
    assert_eq!(s.votes(target).unwrap().of(&bob), Some(VoteDirection::Up));
}

#[test]
fn votes_of_several_users_add_up() {
    let (mut s, alice, bob, post) = one_post();
    let carol = s.register(creds("carol")).unwrap();
    let target = VoteTarget::Post(post);
    block_on(async {
        assert_eq!(s.vote(target, alice, VoteDirection::Up).await, Ok(1));
        assert_eq!(s.vote(target, bob, VoteDirection::Up).await, Ok(2));
        assert_eq!(s.vote(target, carol, VoteDirection::Down).await, Ok(1));
        assert_eq!(s.vote(target, alice, VoteDirection::Down).await, Ok(-1));
    });
    assert!(s.votes(target).unwrap().is_consistent());
}

#[test]
fn voting_on_missing_targets() {
    let (mut s, _, bob, post) = one_post();
    let ghost_post = PostId(Uuid::new_v4());
    let ghost_comment = CommentId(Uuid::new_v4());
    block_on(async {
        assert_eq!(
            s.vote(VoteTarget::Post(ghost_post), bob, VoteDirection::Up).await,
            Err(Error::PostNotFound(ghost_post))
        );
        assert_eq!(
            s.vote(VoteTarget::Comment(ghost_comment), bob, VoteDirection::Down)
                .await,
            Err(Error::CommentNotFound(ghost_comment))
        );
    });
    assert_eq!(s.post(post).unwrap().votes, 0);
}

#[test]
fn comment_votes_are_separate_from_post_votes() {
    let (mut s, alice, bob, post) = one_post();
    let comment = s.create_comment(alice, post, new_comment("first")).unwrap();
    block_on(async {
        assert_eq!(
            s.vote(VoteTarget::Comment(comment.id), bob, VoteDirection::Down)
                .await,
            Ok(-1)
        );
        assert_eq!(
            s.vote(VoteTarget::Post(post), bob, VoteDirection::Down).await,
            Ok(-1)
        );
        assert_eq!(
            s.vote(VoteTarget::Comment(comment.id), bob, VoteDirection::Up)
                .await,
            Ok(1)
        );
    });
    assert_eq!(s.post(post).unwrap().votes, -1);
    let all = CommentsQuery {
        all: Some(String::from("true")),
    };
    assert_eq!(s.comments(post, &all)[0].votes, 1);
}

#[test]
fn comments_preview_newest_first() {
    let (mut s, alice, bob, post) = one_post();
    let (_, _, _, other) = one_post();
    assert_eq!(
        s.create_comment(bob, other, new_comment("lost")),
        Err(Error::PostNotFound(other))
    );
    assert_eq!(
        s.create_comment(bob, post, new_comment(" ")),
        Err(Error::MissingField(String::from("content")))
    );
    for i in 0..5 {
        let who = if i % 2 == 0 { alice } else { bob };
        s.create_comment(who, post, new_comment(&format!("comment {i}")))
            .unwrap();
    }

    let preview = s.comments(post, &CommentsQuery::default());
    let contents = preview.iter().map(|c| c.content.as_str()).collect::<Vec<_>>();
    assert_eq!(contents, ["comment 4", "comment 3", "comment 2"]);
    assert_eq!(preview[0].author.username, "alice");

    let not_quite = CommentsQuery {
        all: Some(String::from("yes")),
    };
    assert_eq!(s.comments(post, &not_quite).len(), COMMENT_PREVIEW_LEN);

    let all = CommentsQuery {
        all: Some(String::from("true")),
    };
    assert_eq!(s.comments(post, &all).len(), 5);
    assert!(s.comments(other, &all).is_empty());
}

#[test]
fn posts_keep_their_attachment() {
    let (mut s, alice, _, _) = one_post();
    let mut p = new_post("pic", "art");
    p.file = Some(String::from("https://example.org/cat.png"));
    let with_file = s.create_post(alice, p).unwrap();
    let mut p = new_post("nopic", "art");
    p.file = Some(String::new());
    let without = s.create_post(alice, p).unwrap();

    assert_eq!(
        s.post(with_file.id).unwrap().file.as_deref(),
        Some("https://example.org/cat.png")
    );
    assert_eq!(s.post(without.id).unwrap().file, None);
    let titles = s.posts().into_iter().map(|p| p.title).collect::<Vec<_>>();
    assert_eq!(titles, ["nopic", "pic", "hello"]);
}

/// Wraps a store and makes the first `races` swaps lose: with an interloper,
/// the same user's vote changes under `cast_vote`'s feet, without one the
/// swap is just refused
struct RacingDb {
    inner: MockServer,
    races: usize,
    interloper: Option<VoteDirection>,
}

#[async_trait]
impl Db for RacingDb {
    async fn current_vote(
        &mut self,
        target: VoteTarget,
        user: UserId,
    ) -> anyhow::Result<Option<Option<VoteDirection>>> {
        self.inner.current_vote(target, user).await
    }

    async fn swap_vote(
        &mut self,
        target: VoteTarget,
        user: UserId,
        expected: Option<VoteDirection>,
        next: VoteDirection,
        delta: i64,
    ) -> anyhow::Result<Option<i64>> {
        if self.races > 0 {
            self.races -= 1;
            match self.interloper {
                Some(d) => {
                    let _ = self.inner.votes_mut(target).unwrap().apply(user, d);
                }
                None => return Ok(None),
            }
        }
        self.inner
            .swap_vote(target, user, expected, next, delta)
            .await
    }

    async fn top_posts(&mut self, limit: usize) -> anyhow::Result<Vec<Post>> {
        self.inner.top_posts(limit).await
    }

    async fn post_counts_by_author(&mut self) -> anyhow::Result<Vec<(UserId, u64)>> {
        self.inner.post_counts_by_author().await
    }

    async fn comment_counts_by_author(&mut self) -> anyhow::Result<Vec<(UserId, u64)>> {
        self.inner.comment_counts_by_author().await
    }

    async fn post_counts_by_category(&mut self) -> anyhow::Result<Vec<(String, u64)>> {
        self.inner.post_counts_by_category().await
    }

    async fn usernames(&mut self, users: &[UserId]) -> anyhow::Result<HashMap<UserId, String>> {
        self.inner.usernames(users).await
    }
}

#[test]
fn concurrent_change_is_retried() {
    let (s, _, bob, post) = one_post();
    let target = VoteTarget::Post(post);
    let mut db = RacingDb {
        inner: s,
        races: 1,
        interloper: Some(VoteDirection::Down),
    };
    // bob's down vote lands first, so the up vote is a full swing
    let res = block_on(vote::cast_vote(&mut db, target, bob, VoteDirection::Up)).unwrap();
    assert_eq!(res, Ok(1));
    let votes = db.inner.votes(target).unwrap();
    assert!(votes.is_consistent());
    assert_eq!(votes.of(&bob), Some(VoteDirection::Up));
}

#[test]
fn concurrent_same_vote_becomes_duplicate() {
    let (s, _, bob, post) = one_post();
    let target = VoteTarget::Post(post);
    let mut db = RacingDb {
        inner: s,
        races: 1,
        interloper: Some(VoteDirection::Up),
    };
    let res = block_on(vote::cast_vote(&mut db, target, bob, VoteDirection::Up)).unwrap();
    assert_eq!(res, Err(Error::DuplicateVote(VoteDirection::Up)));
    assert_eq!(db.inner.post(post).unwrap().votes, 1);
}

#[test]
fn endless_contention_gives_up() {
    let (s, alice, bob, post) = one_post();
    let target = VoteTarget::Post(post);
    let mut s = s;
    block_on(s.vote(target, alice, VoteDirection::Up)).unwrap();
    let mut db = RacingDb {
        inner: s,
        races: usize::MAX,
        interloper: None,
    };
    let res = block_on(vote::cast_vote(&mut db, target, bob, VoteDirection::Up));
    match res {
        Ok(Err(e)) => panic!("contention surfaced as a client error: {e:?}"),
        Ok(Ok(tally)) => panic!("vote went through despite contention: {tally}"),
        Err(_) => (),
    }
    let votes = db.inner.votes(target).unwrap();
    assert!(votes.is_consistent());
    assert_eq!(votes.tally, 1);
    assert_eq!(votes.of(&bob), None);
}

#[test]
fn fuzz_ledger_matches_model() {
    let runtime = AssertUnwindSafe(
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed initializing tokio runtime"),
    );
    bolero::check!()
        .with_type::<Vec<(u8, u8, VoteDirection)>>()
        .cloned()
        .for_each(move |ops| {
            let mut s = MockServer::new();
            let users = ["alice", "bob", "carol"]
                .into_iter()
                .map(|n| s.register(creds(n)).unwrap())
                .collect::<Vec<_>>();
            let p1 = s.create_post(users[0], new_post("one", "a")).unwrap().id;
            let p2 = s.create_post(users[1], new_post("two", "b")).unwrap().id;
            let c1 = s.create_comment(users[2], p1, new_comment("x")).unwrap().id;
            let c2 = s.create_comment(users[0], p2, new_comment("y")).unwrap().id;
            let targets = [
                VoteTarget::Post(p1),
                VoteTarget::Post(p2),
                VoteTarget::Comment(c1),
                VoteTarget::Comment(c2),
            ];

            let mut model = HashMap::<VoteTarget, Votes>::new();
            for (u, t, direction) in ops {
                let user = users[usize::from(u) % users.len()];
                let target = targets[usize::from(t) % targets.len()];
                let expected = model.entry(target).or_default().apply(user, direction);
                let got = runtime.block_on(s.vote(target, user, direction));
                assert_eq!(got, expected, "voting {direction} on {target:?}");
            }

            for target in targets {
                let votes = s.votes(target).unwrap();
                assert!(votes.is_consistent(), "inconsistent votes on {target:?}");
                assert_eq!(votes.tally, model.get(&target).map(|v| v.tally).unwrap_or(0));
            }
        })
}

#[test]
fn top_posts_by_votes() {
    let mut s = MockServer::new();
    let users = (0..4)
        .map(|i| s.register(creds(&format!("user{i}"))).unwrap())
        .collect::<Vec<_>>();
    let posts = (0..12)
        .map(|i| s.create_post(users[0], new_post(&format!("p{i}"), "x")).unwrap().id)
        .collect::<Vec<_>>();
    block_on(async {
        // p5 gets 3 up votes, p7 gets 2, p2 gets 1 down vote
        for u in &users[1..] {
            s.vote(VoteTarget::Post(posts[5]), *u, VoteDirection::Up)
                .await
                .unwrap();
        }
        for u in &users[1..3] {
            s.vote(VoteTarget::Post(posts[7]), *u, VoteDirection::Up)
                .await
                .unwrap();
        }
        s.vote(VoteTarget::Post(posts[2]), users[1], VoteDirection::Down)
            .await
            .unwrap();

        let top = ranking::top_posts(&mut s).await.unwrap();
        assert_eq!(top.len(), ranking::TOP_POSTS);
        assert_eq!(top[0].id, posts[5]);
        assert_eq!(top[0].votes, 3);
        assert_eq!(top[1].id, posts[7]);
        assert!(top.windows(2).all(|w| w[0].votes >= w[1].votes));
        assert!(top.iter().all(|p| p.id != posts[2]));
    });
}

#[test]
fn user_ranking() {
    let mut s = MockServer::new();
    let users = (0..7)
        .map(|i| s.register(creds(&format!("user{i}"))).unwrap())
        .collect::<Vec<_>>();
    // user i writes i posts, and user 1 also writes 10 comments
    let mut first_post = None;
    for (i, u) in users.iter().enumerate() {
        for j in 0..i {
            let p = s.create_post(*u, new_post(&format!("{i}-{j}"), "x")).unwrap();
            first_post.get_or_insert(p.id);
        }
    }
    let post = first_post.unwrap();
    for i in 0..10 {
        s.create_comment(users[1], post, new_comment(&format!("c{i}")))
            .unwrap();
    }
    s.test_forget_user(users[6]);

    let ranked = block_on(ranking::top_users(&mut s)).unwrap();
    assert_eq!(ranked.len(), ranking::TOP_USERS);
    assert_eq!(ranked[0].id, users[1]);
    assert_eq!(ranked[0].post_count, 1);
    assert_eq!(ranked[0].comment_count, 10);
    assert_eq!(ranked[0].total_interactions, 11);
    assert_eq!(ranked[1].id, users[6]);
    assert_eq!(ranked[1].username, UNKNOWN_USERNAME);
    assert_eq!(ranked[2].username, "user5");
    for r in &ranked {
        assert_eq!(r.total_interactions, r.post_count + r.comment_count);
    }
    assert!(ranked
        .windows(2)
        .all(|w| w[0].total_interactions >= w[1].total_interactions));
    // user0 wrote nothing and never shows up
    assert!(ranked.iter().all(|r| r.id != users[0]));
}

#[test]
fn category_ranking() {
    let mut s = MockServer::new();
    let alice = s.register(creds("alice")).unwrap();
    let categories = [
        ("news", 4),
        ("art", 2),
        ("music", 3),
        ("sport", 1),
        ("games", 2),
        ("food", 1),
    ];
    for (c, n) in categories {
        for i in 0..n {
            s.create_post(alice, new_post(&format!("{c}{i}"), c)).unwrap();
        }
    }
    let ranked = block_on(ranking::top_categories(&mut s)).unwrap();
    let got = ranked
        .iter()
        .map(|c| (c.name.as_str(), c.count))
        .collect::<Vec<_>>();
    assert_eq!(
        got,
        [("news", 4), ("music", 3), ("art", 2), ("games", 2), ("food", 1)]
    );
}

#[test]
fn empty_forum_rankings() {
    let mut s = MockServer::new();
    block_on(async {
        assert!(ranking::top_posts(&mut s).await.unwrap().is_empty());
        assert!(ranking::top_users(&mut s).await.unwrap().is_empty());
        assert!(ranking::top_categories(&mut s).await.unwrap().is_empty());
    });
}
