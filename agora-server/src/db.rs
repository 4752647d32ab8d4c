use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use agora_api::{
    Author, Comment, CommentId, Db, NewPost, Post, PostId, UserId, Uuid, VoteDirection,
    VoteTarget,
};
use sqlx::{postgres::PgRow, Connection, Row};

use crate::Error;

/// Foreign keys from rows written on behalf of a user to that user
const USER_FOREIGN_KEYS: &[&str] = &[
    "posts_author_id_fkey",
    "comments_author_id_fkey",
    "post_voters_user_id_fkey",
    "comment_voters_user_id_fkey",
];

/// A validly signed token can still name a user that has no row, eg. after
/// the database was wiped. Writes on its behalf then trip a user foreign key,
/// which is reported as `Unauthorized` rather than as an internal error.
pub fn unknown_user_is_unauthorized(err: anyhow::Error) -> Error {
    let unknown_user = err.chain().any(|e| match e.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => db_err
            .constraint()
            .map_or(false, |c| USER_FOREIGN_KEYS.contains(&c)),
        _ => false,
    });
    if unknown_user {
        tracing::info!(?err, "write on behalf of a user that does not exist");
        Error::unauthorized()
    } else {
        Error::Anyhow(err)
    }
}

pub async fn create_user(
    conn: &mut sqlx::PgConnection,
    name: &str,
    password_hash: &str,
) -> Result<UserId, Error> {
    let id = UserId(Uuid::new_v4());
    let res = sqlx::query(
        "INSERT INTO users (id, name, password_hash, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO NOTHING",
    )
    .bind(id.0)
    .bind(name)
    .bind(password_hash)
    .bind(Utc::now())
    .execute(conn)
    .await
    .with_context(|| format!("inserting user {name:?}"))?;
    if res.rows_affected() != 1 {
        return Err(Error::name_already_used(String::from(name)));
    }
    Ok(id)
}

/// Returns the id and password hash of user `name`
pub async fn fetch_user_by_name(
    conn: &mut sqlx::PgConnection,
    name: &str,
) -> anyhow::Result<Option<(UserId, String)>> {
    let row = sqlx::query("SELECT id, password_hash FROM users WHERE name = $1")
        .bind(name)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("querying users table for {name:?}"))?;
    row.map(|r| -> anyhow::Result<_> {
        Ok((
            UserId(r.try_get("id").context("retrieving the id field")?),
            r.try_get("password_hash")
                .context("retrieving the password_hash field")?,
        ))
    })
    .transpose()
}

const SELECT_POSTS: &str = "
    SELECT p.id, p.author_id, u.name AS author_name, p.title, p.content,
           p.category, p.file, p.votes, p.created_at
        FROM posts p
    INNER JOIN users u
        ON u.id = p.author_id
";

fn post_from_row(r: &PgRow) -> anyhow::Result<Post> {
    Ok(Post {
        id: PostId(r.try_get("id").context("retrieving the id field")?),
        author: Author {
            id: UserId(r.try_get("author_id").context("retrieving the author_id field")?),
            username: r
                .try_get("author_name")
                .context("retrieving the author_name field")?,
        },
        title: r.try_get("title").context("retrieving the title field")?,
        content: r.try_get("content").context("retrieving the content field")?,
        category: r.try_get("category").context("retrieving the category field")?,
        file: r.try_get("file").context("retrieving the file field")?,
        votes: r.try_get("votes").context("retrieving the votes field")?,
        created_at: r
            .try_get("created_at")
            .context("retrieving the created_at field")?,
    })
}

pub async fn create_post(
    conn: &mut sqlx::PgConnection,
    author: UserId,
    p: &NewPost,
) -> anyhow::Result<Post> {
    let id = PostId(Uuid::new_v4());
    sqlx::query(
        "INSERT INTO posts (id, author_id, title, content, category, file, votes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7)",
    )
    .bind(id.0)
    .bind(author.0)
    .bind(&p.title)
    .bind(&p.content)
    .bind(&p.category)
    .bind(p.file())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .with_context(|| format!("inserting post {id:?}"))?;
    fetch_post(conn, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("post {id:?} vanished right after insertion"))
}

pub async fn fetch_posts(conn: &mut sqlx::PgConnection) -> anyhow::Result<Vec<Post>> {
    let rows = sqlx::query(&format!("{SELECT_POSTS} ORDER BY p.created_at DESC, p.id"))
        .fetch_all(conn)
        .await
        .context("querying posts table")?;
    rows.iter().map(post_from_row).collect()
}

pub async fn fetch_post(conn: &mut sqlx::PgConnection, id: PostId) -> anyhow::Result<Option<Post>> {
    sqlx::query(&format!("{SELECT_POSTS} WHERE p.id = $1"))
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("querying posts table for {id:?}"))?
        .as_ref()
        .map(post_from_row)
        .transpose()
}

const SELECT_COMMENTS: &str = "
    SELECT c.id, c.post_id, c.author_id, u.name AS author_name, c.content,
           c.votes, c.created_at
        FROM comments c
    INNER JOIN users u
        ON u.id = c.author_id
";

fn comment_from_row(r: &PgRow) -> anyhow::Result<Comment> {
    Ok(Comment {
        id: CommentId(r.try_get("id").context("retrieving the id field")?),
        post_id: PostId(r.try_get("post_id").context("retrieving the post_id field")?),
        author: Author {
            id: UserId(r.try_get("author_id").context("retrieving the author_id field")?),
            username: r
                .try_get("author_name")
                .context("retrieving the author_name field")?,
        },
        content: r.try_get("content").context("retrieving the content field")?,
        votes: r.try_get("votes").context("retrieving the votes field")?,
        created_at: r
            .try_get("created_at")
            .context("retrieving the created_at field")?,
    })
}

/// Returns `None` if the post does not exist
pub async fn create_comment(
    conn: &mut sqlx::PgConnection,
    post: PostId,
    author: UserId,
    content: &str,
) -> anyhow::Result<Option<Comment>> {
    let id = CommentId(Uuid::new_v4());
    let res = sqlx::query(
        "INSERT INTO comments (id, post_id, author_id, content, votes, created_at)
            SELECT $1, p.id, $3, $4, 0, $5
                FROM posts p
            WHERE p.id = $2",
    )
    .bind(id.0)
    .bind(post.0)
    .bind(author.0)
    .bind(content)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .with_context(|| format!("inserting comment {id:?} on {post:?}"))?;
    if res.rows_affected() == 0 {
        return Ok(None);
    }
    let row = sqlx::query(&format!("{SELECT_COMMENTS} WHERE c.id = $1"))
        .bind(id.0)
        .fetch_one(conn)
        .await
        .with_context(|| format!("querying comments table for {id:?}"))?;
    comment_from_row(&row).map(Some)
}

/// Newest first, at most `limit` if set
pub async fn fetch_comments(
    conn: &mut sqlx::PgConnection,
    post: PostId,
    limit: Option<usize>,
) -> anyhow::Result<Vec<Comment>> {
    let limit = limit
        .map(i64::try_from)
        .transpose()
        .context("comment limit does not fit in a bigint")?;
    let rows = sqlx::query(&format!(
        "{SELECT_COMMENTS} WHERE c.post_id = $1 ORDER BY c.created_at DESC, c.id LIMIT $2"
    ))
    .bind(post.0)
    .bind(limit)
    .fetch_all(conn)
    .await
    .with_context(|| format!("querying comments of {post:?}"))?;
    rows.iter().map(comment_from_row).collect()
}

/// Entity table, voters table and voters foreign key column for a target
fn vote_tables(target: VoteTarget) -> (&'static str, &'static str, &'static str, Uuid) {
    match target {
        VoteTarget::Post(p) => ("posts", "post_voters", "post_id", p.0),
        VoteTarget::Comment(c) => ("comments", "comment_voters", "comment_id", c.0),
    }
}

async fn counts_by(
    conn: &mut sqlx::PgConnection,
    table: &str,
    column: &str,
) -> anyhow::Result<Vec<(Uuid, u64)>> {
    sqlx::query(&format!(
        "SELECT {column} AS key, COUNT(*) AS count FROM {table} GROUP BY {column}"
    ))
    .fetch(conn)
    .map_err(anyhow::Error::from)
    .and_then(|r| async move {
        let key: Uuid = r.try_get("key").context("retrieving the key field")?;
        let count: i64 = r.try_get("count").context("retrieving the count field")?;
        Ok::<_, anyhow::Error>((key, u64::try_from(count).context("negative count")?))
    })
    .try_collect()
    .await
    .with_context(|| format!("counting {table} by {column}"))
}

pub struct PostgresDb<'a> {
    pub conn: &'a mut sqlx::PgConnection,
}

#[async_trait]
impl<'a> Db for PostgresDb<'a> {
    async fn current_vote(
        &mut self,
        target: VoteTarget,
        user: UserId,
    ) -> anyhow::Result<Option<Option<VoteDirection>>> {
        let (entities, voters, fk, id) = vote_tables(target);
        let row = sqlx::query(&format!(
            "SELECT v.direction
                FROM {entities} e
            LEFT JOIN {voters} v
                ON v.{fk} = e.id AND v.user_id = $2
            WHERE e.id = $1"
        ))
        .bind(id)
        .bind(user.0)
        .fetch_optional(&mut *self.conn)
        .await
        .with_context(|| format!("querying {voters} table"))?;
        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        let direction: Option<String> = row
            .try_get("direction")
            .context("retrieving the direction field")?;
        Ok(Some(direction.map(|d| d.parse()).transpose()?))
    }

    async fn swap_vote(
        &mut self,
        target: VoteTarget,
        user: UserId,
        expected: Option<VoteDirection>,
        next: VoteDirection,
        delta: i64,
    ) -> anyhow::Result<Option<i64>> {
        let (entities, voters, fk, id) = vote_tables(target);
        let mut tx = self.conn.begin().await.context("starting transaction")?;

        let swapped = match expected {
            None => sqlx::query(&format!(
                "INSERT INTO {voters} ({fk}, user_id, direction)
                    VALUES ($1, $2, $3)
                    ON CONFLICT DO NOTHING"
            ))
            .bind(id)
            .bind(user.0)
            .bind(next.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting into {voters}"))?,
            Some(prev) => sqlx::query(&format!(
                "UPDATE {voters}
                    SET direction = $3
                    WHERE {fk} = $1 AND user_id = $2 AND direction = $4"
            ))
            .bind(id)
            .bind(user.0)
            .bind(next.as_str())
            .bind(prev.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("updating {voters}"))?,
        };
        if swapped.rows_affected() != 1 {
            tx.rollback().await.context("rolling back lost vote swap")?;
            return Ok(None);
        }

        let tally: i64 = sqlx::query(&format!(
            "UPDATE {entities} SET votes = votes + $2 WHERE id = $1 RETURNING votes"
        ))
        .bind(id)
        .bind(delta)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("updating tally in {entities}"))?
        .try_get("votes")
        .context("retrieving the votes field")?;

        tx.commit().await.context("committing vote")?;
        Ok(Some(tally))
    }

    async fn top_posts(&mut self, limit: usize) -> anyhow::Result<Vec<Post>> {
        let limit = i64::try_from(limit).context("post limit does not fit in a bigint")?;
        let rows = sqlx::query(&format!(
            "{SELECT_POSTS} ORDER BY p.votes DESC, p.created_at DESC, p.id LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&mut *self.conn)
        .await
        .context("querying posts table")?;
        rows.iter().map(post_from_row).collect()
    }

    async fn post_counts_by_author(&mut self) -> anyhow::Result<Vec<(UserId, u64)>> {
        Ok(counts_by(&mut *self.conn, "posts", "author_id")
            .await?
            .into_iter()
            .map(|(u, n)| (UserId(u), n))
            .collect())
    }

    async fn comment_counts_by_author(&mut self) -> anyhow::Result<Vec<(UserId, u64)>> {
        Ok(counts_by(&mut *self.conn, "comments", "author_id")
            .await?
            .into_iter()
            .map(|(u, n)| (UserId(u), n))
            .collect())
    }

    async fn post_counts_by_category(&mut self) -> anyhow::Result<Vec<(String, u64)>> {
        sqlx::query("SELECT category, COUNT(*) AS count FROM posts GROUP BY category")
            .fetch(&mut *self.conn)
            .map_err(anyhow::Error::from)
            .and_then(|r| async move {
                let category: String = r
                    .try_get("category")
                    .context("retrieving the category field")?;
                let count: i64 = r.try_get("count").context("retrieving the count field")?;
                Ok::<_, anyhow::Error>((category, u64::try_from(count).context("negative count")?))
            })
            .try_collect()
            .await
            .context("counting posts by category")
    }

    async fn usernames(&mut self, users: &[UserId]) -> anyhow::Result<HashMap<UserId, String>> {
        let ids = users.iter().map(|u| u.0).collect::<Vec<Uuid>>();
        sqlx::query("SELECT id, name FROM users WHERE id = ANY($1)")
            .bind(ids)
            .fetch(&mut *self.conn)
            .map_err(anyhow::Error::from)
            .and_then(|r| async move {
                let name: String = r.try_get("name").context("retrieving the name field")?;
                Ok::<_, anyhow::Error>((
                    UserId(r.try_get("id").context("retrieving the id field")?),
                    name,
                ))
            })
            .try_collect()
            .await
            .context("querying users table")
    }
}
