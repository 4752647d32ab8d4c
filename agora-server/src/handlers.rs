use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use agora_api::{
    ranking, vote, AuthResponse, CategoryRanking, Comment, CommentId, CommentsQuery,
    Credentials, NewComment, NewPost, Post, PostId, UserRanking, VoteRequest, VoteResponse,
    VoteTarget, BCRYPT_COST,
};

use crate::{db, extractors::*, token::TokenKeys, Error};

pub async fn register(
    State(keys): State<TokenKeys>,
    State(pool): State<PgPool>,
    JsonBody(data): JsonBody<Credentials>,
) -> Result<Json<AuthResponse>, Error> {
    data.validate()?;
    let mut conn = pool.acquire().await?;
    let hash = bcrypt::hash(&data.password, BCRYPT_COST).context("hashing password")?;
    let user = db::create_user(&mut *conn, &data.username, &hash).await?;
    tracing::info!(?user, username = %data.username, "registered new user");
    Ok(Json(AuthResponse {
        token: keys.issue(user)?,
        username: data.username,
    }))
}

pub async fn login(
    State(keys): State<TokenKeys>,
    State(pool): State<PgPool>,
    JsonBody(data): JsonBody<Credentials>,
) -> Result<Json<AuthResponse>, Error> {
    data.validate()?;
    let mut conn = pool.acquire().await?;
    let (user, hash) = db::fetch_user_by_name(&mut *conn, &data.username)
        .await
        .context("logging user in")?
        .ok_or(Error::invalid_credentials())?;
    if !bcrypt::verify(&data.password, &hash).context("verifying password hash")? {
        return Err(Error::invalid_credentials());
    }
    Ok(Json(AuthResponse {
        token: keys.issue(user)?,
        username: data.username,
    }))
}

pub async fn create_post(
    Auth(user): Auth,
    State(pool): State<PgPool>,
    JsonBody(data): JsonBody<NewPost>,
) -> Result<(StatusCode, Json<Post>), Error> {
    data.validate()?;
    let mut conn = pool.acquire().await?;
    let post = db::create_post(&mut *conn, user, &data)
        .await
        .with_context(|| format!("creating post for {user:?}"))
        .map_err(db::unknown_user_is_unauthorized)?;
    Ok((StatusCode::CREATED, Json(post)))
}

pub async fn list_posts(mut conn: PgConn) -> Result<Json<Vec<Post>>, Error> {
    Ok(Json(
        db::fetch_posts(&mut *conn)
            .await
            .context("fetching post list")?,
    ))
}

pub async fn get_post(
    State(pool): State<PgPool>,
    Path(id): Path<String>,
) -> Result<Json<Post>, Error> {
    let id = PostId::parse(&id)?;
    let mut conn = pool.acquire().await?;
    Ok(Json(
        db::fetch_post(&mut *conn, id)
            .await
            .with_context(|| format!("fetching post {id:?}"))?
            .ok_or(agora_api::Error::PostNotFound(id))?,
    ))
}

pub async fn top_posts(mut conn: PgConn) -> Result<Json<Vec<Post>>, Error> {
    let mut db = db::PostgresDb { conn: &mut *conn };
    Ok(Json(ranking::top_posts(&mut db).await?))
}

pub async fn vote_post(
    Auth(user): Auth,
    State(pool): State<PgPool>,
    Path(id): Path<String>,
    JsonBody(data): JsonBody<VoteRequest>,
) -> Result<Json<VoteResponse>, Error> {
    let target = VoteTarget::Post(PostId::parse(&id)?);
    let mut conn = pool.acquire().await?;
    let mut db = db::PostgresDb { conn: &mut *conn };
    let votes = vote::cast_vote(&mut db, target, user, data.direction)
        .await
        .map_err(db::unknown_user_is_unauthorized)??;
    Ok(Json(VoteResponse { votes }))
}

pub async fn vote_comment(
    Auth(user): Auth,
    State(pool): State<PgPool>,
    Path(id): Path<String>,
    JsonBody(data): JsonBody<VoteRequest>,
) -> Result<Json<VoteResponse>, Error> {
    let target = VoteTarget::Comment(CommentId::parse(&id)?);
    let mut conn = pool.acquire().await?;
    let mut db = db::PostgresDb { conn: &mut *conn };
    let votes = vote::cast_vote(&mut db, target, user, data.direction)
        .await
        .map_err(db::unknown_user_is_unauthorized)??;
    Ok(Json(VoteResponse { votes }))
}

pub async fn create_comment(
    Auth(user): Auth,
    State(pool): State<PgPool>,
    Path(id): Path<String>,
    JsonBody(data): JsonBody<NewComment>,
) -> Result<(StatusCode, Json<Comment>), Error> {
    let post = PostId::parse(&id)?;
    data.validate()?;
    let mut conn = pool.acquire().await?;
    let comment = db::create_comment(&mut *conn, post, user, &data.content)
        .await
        .with_context(|| format!("commenting on {post:?} for {user:?}"))
        .map_err(db::unknown_user_is_unauthorized)?
        .ok_or(agora_api::Error::PostNotFound(post))?;
    Ok((StatusCode::CREATED, Json(comment)))
}

pub async fn list_comments(
    State(pool): State<PgPool>,
    Path(id): Path<String>,
    Query(q): Query<CommentsQuery>,
) -> Result<Json<Vec<Comment>>, Error> {
    let post = PostId::parse(&id)?;
    let mut conn = pool.acquire().await?;
    Ok(Json(
        db::fetch_comments(&mut *conn, post, q.limit())
            .await
            .with_context(|| format!("fetching comments of {post:?}"))?,
    ))
}

pub async fn rank_users(mut conn: PgConn) -> Result<Json<Vec<UserRanking>>, Error> {
    let mut db = db::PostgresDb { conn: &mut *conn };
    Ok(Json(ranking::top_users(&mut db).await?))
}

pub async fn rank_categories(mut conn: PgConn) -> Result<Json<Vec<CategoryRanking>>, Error> {
    let mut db = db::PostgresDb { conn: &mut *conn };
    Ok(Json(ranking::top_categories(&mut db).await?))
}
