use std::collections::{BTreeMap, HashMap};

use agora_api::{
    ranking, vote, Author, Comment, CommentId, CommentsQuery, Credentials, Db, Error, NewComment,
    NewPost, Post, PostId, UserId, Uuid, VoteDirection, VoteTarget, Votes,
};
use async_trait::async_trait;
use chrono::Utc;

/// In-memory forum behaving like the real server, minus persistence
pub struct MockServer {
    users: BTreeMap<UserId, DbUser>,
    // both in creation order
    posts: Vec<DbPost>,
    comments: Vec<DbComment>,
}

#[derive(Debug)]
struct DbUser {
    name: String,
    // tests (of which mock-server is a part of) don't actually use bcrypt
    pass: String,
}

#[derive(Debug)]
struct DbPost {
    post: Post,
    votes: Votes,
}

impl DbPost {
    fn render(&self) -> Post {
        Post {
            votes: self.votes.tally,
            ..self.post.clone()
        }
    }
}

#[derive(Debug)]
struct DbComment {
    comment: Comment,
    votes: Votes,
}

impl DbComment {
    fn render(&self) -> Comment {
        Comment {
            votes: self.votes.tally,
            ..self.comment.clone()
        }
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer {
            users: BTreeMap::new(),
            posts: Vec::new(),
            comments: Vec::new(),
        }
    }

    fn author(&self, user: UserId) -> Author {
        Author {
            id: user,
            username: self
                .users
                .get(&user)
                .map(|u| u.name.clone())
                .unwrap_or_else(|| String::from(ranking::UNKNOWN_USERNAME)),
        }
    }

    fn votes_mut(&mut self, target: VoteTarget) -> Option<&mut Votes> {
        match target {
            VoteTarget::Post(id) => self
                .posts
                .iter_mut()
                .find(|p| p.post.id == id)
                .map(|p| &mut p.votes),
            VoteTarget::Comment(id) => self
                .comments
                .iter_mut()
                .find(|c| c.comment.id == id)
                .map(|c| &mut c.votes),
        }
    }

    pub fn votes(&self, target: VoteTarget) -> Option<&Votes> {
        match target {
            VoteTarget::Post(id) => self.posts.iter().find(|p| p.post.id == id).map(|p| &p.votes),
            VoteTarget::Comment(id) => self
                .comments
                .iter()
                .find(|c| c.comment.id == id)
                .map(|c| &c.votes),
        }
    }

    /// Return the current number of users
    pub fn test_num_users(&self) -> usize {
        self.users.len()
    }

    /// Drops a user's account but keeps everything they wrote
    pub fn test_forget_user(&mut self, user: UserId) {
        self.users.remove(&user);
    }

    pub fn register(&mut self, c: Credentials) -> Result<UserId, Error> {
        c.validate()?;
        if self.users.values().any(|u| u.name == c.username) {
            return Err(Error::NameAlreadyUsed(c.username));
        }
        let id = UserId(Uuid::new_v4());
        self.users.insert(
            id,
            DbUser {
                name: c.username,
                pass: c.password,
            },
        );
        Ok(id)
    }

    pub fn login(&self, c: Credentials) -> Result<UserId, Error> {
        c.validate()?;
        self.users
            .iter()
            .find(|(_, u)| u.name == c.username && u.pass == c.password)
            .map(|(id, _)| *id)
            .ok_or(Error::InvalidCredentials)
    }

    pub fn create_post(&mut self, user: UserId, p: NewPost) -> Result<Post, Error> {
        p.validate()?;
        let post = Post {
            id: PostId(Uuid::new_v4()),
            author: self.author(user),
            file: p.file().map(String::from),
            title: p.title,
            content: p.content,
            category: p.category,
            votes: 0,
            created_at: Utc::now(),
        };
        self.posts.push(DbPost {
            post: post.clone(),
            votes: Votes::new(),
        });
        Ok(post)
    }

    /// Newest first
    pub fn posts(&self) -> Vec<Post> {
        self.posts.iter().rev().map(DbPost::render).collect()
    }

    pub fn post(&self, id: PostId) -> Result<Post, Error> {
        self.posts
            .iter()
            .find(|p| p.post.id == id)
            .map(DbPost::render)
            .ok_or(Error::PostNotFound(id))
    }

    pub fn create_comment(
        &mut self,
        user: UserId,
        post: PostId,
        c: NewComment,
    ) -> Result<Comment, Error> {
        c.validate()?;
        if !self.posts.iter().any(|p| p.post.id == post) {
            return Err(Error::PostNotFound(post));
        }
        let comment = Comment {
            id: CommentId(Uuid::new_v4()),
            post_id: post,
            author: self.author(user),
            content: c.content,
            votes: 0,
            created_at: Utc::now(),
        };
        self.comments.push(DbComment {
            comment: comment.clone(),
            votes: Votes::new(),
        });
        Ok(comment)
    }

    /// Newest first
    pub fn comments(&self, post: PostId, q: &CommentsQuery) -> Vec<Comment> {
        let all = self
            .comments
            .iter()
            .rev()
            .filter(|c| c.comment.post_id == post)
            .map(DbComment::render);
        match q.limit() {
            Some(limit) => all.take(limit).collect(),
            None => all.collect(),
        }
    }

    pub async fn vote(
        &mut self,
        target: VoteTarget,
        user: UserId,
        direction: VoteDirection,
    ) -> Result<i64, Error> {
        vote::cast_vote(self, target, user, direction)
            .await
            .unwrap_or_else(|e| Err(Error::Unknown(format!("{e:?}"))))
    }
}

impl Default for MockServer {
    fn default() -> MockServer {
        MockServer::new()
    }
}

fn count_by<T>(items: impl Iterator<Item = T>) -> Vec<(T, u64)>
where
    T: Ord,
{
    let mut counts = BTreeMap::new();
    for i in items {
        *counts.entry(i).or_insert(0) += 1;
    }
    counts.into_iter().collect()
}

#[async_trait]
impl Db for MockServer {
    async fn current_vote(
        &mut self,
        target: VoteTarget,
        user: UserId,
    ) -> anyhow::Result<Option<Option<VoteDirection>>> {
        Ok(self.votes(target).map(|v| v.of(&user)))
    }

    async fn swap_vote(
        &mut self,
        target: VoteTarget,
        user: UserId,
        expected: Option<VoteDirection>,
        next: VoteDirection,
        delta: i64,
    ) -> anyhow::Result<Option<i64>> {
        let votes = self
            .votes_mut(target)
            .ok_or_else(|| anyhow::anyhow!("{target:?} vanished while voting"))?;
        if votes.of(&user) != expected {
            return Ok(None);
        }
        votes.voters.insert(user, next);
        votes.tally += delta;
        Ok(Some(votes.tally))
    }

    async fn top_posts(&mut self, limit: usize) -> anyhow::Result<Vec<Post>> {
        let mut posts = self.posts();
        ranking::sort_by_votes(&mut posts);
        posts.truncate(limit);
        Ok(posts)
    }

    async fn post_counts_by_author(&mut self) -> anyhow::Result<Vec<(UserId, u64)>> {
        Ok(count_by(self.posts.iter().map(|p| p.post.author.id)))
    }

    async fn comment_counts_by_author(&mut self) -> anyhow::Result<Vec<(UserId, u64)>> {
        Ok(count_by(self.comments.iter().map(|c| c.comment.author.id)))
    }

    async fn post_counts_by_category(&mut self) -> anyhow::Result<Vec<(String, u64)>> {
        Ok(count_by(self.posts.iter().map(|p| p.post.category.clone())))
    }

    async fn usernames(&mut self, users: &[UserId]) -> anyhow::Result<HashMap<UserId, String>> {
        Ok(users
            .iter()
            .filter_map(|u| self.users.get(u).map(|d| (*u, d.name.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests;
