use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod db;
mod error;
mod extractors;
mod fuzz;
mod handlers;
mod token;

use error::Error;
use extractors::{AppState, PgPool};
use token::TokenKeys;

/// Posts may carry their attachment inline as base64
const BODY_LIMIT: usize = 10 * 1024 * 1024;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(structopt::StructOpt)]
struct Opt {
    /// Postgres connection string
    #[structopt(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    #[structopt(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:4000")]
    listen: SocketAddr,

    /// Secret used to sign the bearer tokens
    #[structopt(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    #[structopt(long, env = "TOKEN_LIFETIME_HOURS", default_value = "168")]
    token_lifetime_hours: i64,

    /// Origin of the web frontend, allowed through CORS
    #[structopt(long, env = "CORS_ORIGIN", default_value = "http://localhost:3000")]
    cors_origin: String,
}

async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(db_url)
        .await
        .with_context(|| format!("Error opening database {:?}", db_url))
}

fn cors(origin: HeaderValue) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

pub fn app(db: sqlx::PgPool, keys: TokenKeys, cors_origin: HeaderValue) -> Router {
    Router::new()
        .route("/auth/register", post(handlers::register))
        .route("/auth/login", post(handlers::login))
        .route(
            "/forum",
            get(handlers::list_posts).post(handlers::create_post),
        )
        .route("/forum/top", get(handlers::top_posts))
        .route("/forum/ranking/users", get(handlers::rank_users))
        .route("/forum/ranking/categories", get(handlers::rank_categories))
        .route("/forum/:id", get(handlers::get_post))
        .route("/forum/:id/vote", post(handlers::vote_post))
        .route(
            "/forum/:id/comments",
            get(handlers::list_comments).post(handlers::create_comment),
        )
        .route("/comments/:id/vote", post(handlers::vote_comment))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors(cors_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            db: PgPool::new(db),
            keys,
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let opt = <Opt as structopt::StructOpt>::from_args();
    let cors_origin = HeaderValue::from_str(&opt.cors_origin)
        .with_context(|| format!("parsing CORS origin {:?}", opt.cors_origin))?;
    let keys = TokenKeys::new(
        &opt.jwt_secret,
        chrono::Duration::hours(opt.token_lifetime_hours),
    );

    let db = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&db)
        .await
        .context("applying database migrations")?;

    let app = app(db, keys, cors_origin);

    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}
