#![cfg(test)]

use std::{
    cmp, collections::HashMap, fmt::Debug, ops::RangeTo, panic::AssertUnwindSafe, path::Path,
    time::Duration,
};

use agora_api::{
    ranking, AuthResponse, CategoryRanking, Comment, CommentId, CommentsQuery, Credentials,
    Error as ApiError, NewComment, NewPost, Post, PostId, UserId, UserRanking, Uuid,
    VoteDirection, VoteRequest, VoteResponse, VoteTarget,
};
use agora_mock_server::MockServer;
use axum::{
    extract::FromRequestParts,
    http::{self, request, HeaderValue},
    Router,
};
use bolero::generator::TypeGenerator;
use tower::{Service, ServiceExt};

use crate::{extractors::*, *};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

macro_rules! do_app_test {
    ( $name:ident, |$app:ident, $keys:ident| $body:expr ) => {
        #[test]
        fn $name() {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed initializing tokio runtime");
            runtime.block_on(async move {
                let ($app, $keys) = unreachable_db_app();
                let mut $app = $app;
                $body.await
            })
        }
    };
}

fn build_pg_cluster(data: &Path) -> postgresfixture::cluster::Cluster {
    let mut runtime = None;
    let mut best_version = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            match (&mut runtime, &mut best_version) {
                (None, None) => {
                    runtime = Some(r);
                    best_version = Some(v);
                }
                (Some(runtime), Some(best_version)) => {
                    if *best_version < v {
                        *runtime = r;
                        *best_version = v;
                    }
                }
                _ => unreachable!(),
            }
        }
    }
    postgresfixture::cluster::Cluster::new(
        data,
        runtime.expect("postgresql seems to not be installed in path"),
    )
}

/// Runs `test` against a throwaway postgres cluster with the schema applied
fn with_test_db<F>(test: F)
where
    F: FnOnce(&tokio::runtime::Runtime, sqlx::PgPool),
{
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt().try_init();
    }
    let lockfile = tempfile::tempfile().expect("creating tempfile");
    let datadir = tempfile::tempdir().expect("creating tempdir");
    let datadir_path: &Path = datadir.as_ref();
    let cluster = build_pg_cluster(datadir_path);
    let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
    postgresfixture::coordinate::run_and_destroy(
        &cluster,
        lockfile.into(),
        AssertUnwindSafe(|| {
            cluster
                .createdb("test_db")
                .expect("creating test_db database");
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed initializing tokio runtime");
            let pool = runtime.block_on(async move {
                let pool = create_sqlx_pool(&format!(
                    "postgresql://?host={}&dbname=test_db",
                    datadir_path
                ))
                .await
                .expect("creating sqlx pool");
                MIGRATOR
                    .run(&mut *pool.acquire().await.expect("getting migrator connection"))
                    .await
                    .expect("failed applying migrations");
                pool
            });
            test(&runtime, pool)
        }),
    )
    .expect("coordinating spinup and shutdown of the pg cluster");
}

macro_rules! do_sqlx_test {
    ( $name:ident, |$pool:ident| $body:expr ) => {
        #[test]
        fn $name() {
            with_test_db(|runtime, $pool| runtime.block_on($body))
        }
    };

    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            with_test_db(|runtime, pool| {
                let runtime = AssertUnwindSafe(runtime);
                let pool = AssertUnwindSafe(pool);
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            sqlx::query(include_str!("../reset-test-db.sql"))
                                .execute(&mut *conn)
                                .await
                                .expect("failed cleaning up database");
                        });
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            })
        }
    };
}

const SECRET: &str = "test secret";
const ORIGIN: &str = "http://localhost:3000";

fn test_keys() -> TokenKeys {
    TokenKeys::new(SECRET, chrono::Duration::hours(1))
}

/// App whose database cannot be reached: any request that gets to the store
/// fails with an internal error.
fn unreachable_db_app() -> (Router, TokenKeys) {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(200))
        .connect_lazy("postgres://agora@127.0.0.1:1/agora")
        .expect("building lazy pool");
    let keys = test_keys();
    let app = app(pool, keys.clone(), HeaderValue::from_static(ORIGIN));
    (app, keys)
}

do_tokio_test!(fuzz_preauth_extractor, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(PreAuth(tok)) => assert!(!tok.is_empty() && !tok.contains(' ')),
            Err(Error::Api(ApiError::Unauthorized)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

do_tokio_test!(fuzz_token_verification, String, |token: String| async move {
    let keys = test_keys();
    match keys.verify(&token) {
        Err(Error::Api(ApiError::Unauthorized)) => (),
        res => panic!("random string {token:?} was accepted as a token: {res:?}"),
    }
});

async fn call(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: &impl serde::Serialize,
) -> (http::StatusCode, Vec<u8>) {
    let req = request::Builder::new()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    let req = match token {
        Some(token) => req.header(http::header::AUTHORIZATION, format!("Bearer {token}")),
        None => req,
    };
    let req = req
        .body(axum::body::Body::from(
            serde_json::to_vec(body).expect("serializing request body to json"),
        ))
        .expect("building request");
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes");
    (status, body.to_vec())
}

async fn call_err(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: &(impl serde::Serialize + Debug),
) -> (http::StatusCode, ApiError) {
    let (status, resp) = call(app, method, uri, token, body).await;
    let err = ApiError::parse(&resp).unwrap_or_else(|err| {
        panic!("parsing error response body {err}, body is {resp:?}, request was {body:?}")
    });
    assert_eq!(status, err.status_code(), "status does not match error {err:?}");
    (status, err)
}

fn vote_body(direction: &str) -> serde_json::Value {
    serde_json::json!({ "type": direction })
}

do_app_test!(vote_without_token_is_unauthorized, |app, _keys| async move {
    let post = Uuid::new_v4();
    for uri in [format!("/forum/{post}/vote"), format!("/comments/{post}/vote")] {
        let (status, err) = call_err(&mut app, "POST", &uri, None, &vote_body("up")).await;
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);
        assert_eq!(err, ApiError::Unauthorized);
    }
});

do_app_test!(vote_with_forged_token_is_unauthorized, |app, _keys| async move {
    let forged = TokenKeys::new("not the secret", chrono::Duration::hours(1))
        .issue(UserId(Uuid::new_v4()))
        .unwrap();
    let uri = format!("/forum/{}/vote", Uuid::new_v4());
    let (status, _) = call_err(&mut app, "POST", &uri, Some(&forged), &vote_body("up")).await;
    assert_eq!(status, http::StatusCode::UNAUTHORIZED);
    let (status, _) =
        call_err(&mut app, "POST", &uri, Some("garbage"), &vote_body("down")).await;
    assert_eq!(status, http::StatusCode::UNAUTHORIZED);
});

do_app_test!(writes_require_a_token, |app, _keys| async move {
    let post = serde_json::json!({"title": "t", "content": "c", "type": "news"});
    let (_, err) = call_err(&mut app, "POST", "/forum", None, &post).await;
    assert_eq!(err, ApiError::Unauthorized);

    let uri = format!("/forum/{}/comments", Uuid::new_v4());
    let comment = serde_json::json!({"content": "hi"});
    let (_, err) = call_err(&mut app, "POST", &uri, None, &comment).await;
    assert_eq!(err, ApiError::Unauthorized);
});

do_app_test!(malformed_ids_are_bad_requests, |app, keys| async move {
    let tok = keys.issue(UserId(Uuid::new_v4())).unwrap();
    let (_, err) = call_err(&mut app, "GET", "/forum/1234", None, &()).await;
    assert_eq!(err, ApiError::InvalidId(String::from("1234")));

    let (_, err) = call_err(
        &mut app,
        "POST",
        "/comments/abc/vote",
        Some(&tok),
        &vote_body("up"),
    )
    .await;
    assert_eq!(err, ApiError::InvalidId(String::from("abc")));

    let (_, err) = call_err(&mut app, "GET", "/forum/xyz/comments?all=true", None, &()).await;
    assert_eq!(err, ApiError::InvalidId(String::from("xyz")));
});

do_app_test!(invalid_bodies_are_bad_requests, |app, keys| async move {
    let tok = keys.issue(UserId(Uuid::new_v4())).unwrap();
    let uri = format!("/forum/{}/vote", Uuid::new_v4());

    let (status, err) = call_err(&mut app, "POST", &uri, Some(&tok), &vote_body("sideways")).await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);
    assert!(matches!(err, ApiError::InvalidBody(_)), "got {err:?}");

    let post = serde_json::json!({"content": "c", "type": "news"});
    let (_, err) = call_err(&mut app, "POST", "/forum", Some(&tok), &post).await;
    assert_eq!(err, ApiError::MissingField(String::from("title")));

    let creds = serde_json::json!({"username": "alice"});
    let (_, err) = call_err(&mut app, "POST", "/auth/register", None, &creds).await;
    assert_eq!(err, ApiError::MissingField(String::from("password")));
});

do_app_test!(store_failures_are_masked_internal_errors, |app, keys| async move {
    let tok = keys.issue(UserId(Uuid::new_v4())).unwrap();
    let uri = format!("/forum/{}/vote", Uuid::new_v4());
    let (status, err) = call_err(&mut app, "POST", &uri, Some(&tok), &vote_body("up")).await;
    assert_eq!(status, http::StatusCode::INTERNAL_SERVER_ERROR);
    assert!(matches!(err, ApiError::Unknown(_)), "got {err:?}");
});

async fn run_on_app<Req, Resp>(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: serde::de::DeserializeOwned,
{
    let (status, resp) = call(app, method, uri, token, body).await;
    if status.is_success() {
        return Ok(serde_json::from_slice(&resp).unwrap_or_else(|err| {
            panic!("parsing resp body {err}, body is {resp:?}, request was {body:?}")
        }));
    }
    let err = ApiError::parse(&resp)
        .unwrap_or_else(|err| panic!("parsing error response body {err}, body is {resp:?}"));
    assert_eq!(status, err.status_code(), "status does not match error {err:?}");
    Err(err)
}

fn compare<T>(name: &str, app_res: Result<T, ApiError>, mock_res: Result<T, ApiError>)
where
    T: Debug + PartialEq,
{
    assert_eq!(
        app_res, mock_res,
        "app and mock did not return the same result for {name}"
    );
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end);
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1))
}

const NAMES: &[&str] = &["alice", "bob", "carol", "dave", "erin", "frank", "grace"];
const CATEGORIES: &[&str] = &["news", "art", "music", "sport", "games", "food", "misc"];

#[derive(Clone, Debug, TypeGenerator)]
enum FuzzOp {
    Register { name: u8 },
    Login { uid: usize, wrong_password: bool },
    CreatePost { uid: usize, category: u8 },
    GetPost { pid: usize },
    ListPosts,
    CreateComment { uid: usize, pid: usize },
    CommentOnMissingPost { uid: usize },
    ListComments { pid: usize, all: bool },
    VotePost { uid: usize, pid: usize, direction: VoteDirection },
    VoteComment { uid: usize, cid: usize, direction: VoteDirection },
    VoteOnMissing { uid: usize, comment: bool, direction: VoteDirection },
    TopPosts,
    RankUsers,
    RankCategories,
}

/// Title, category, author name, tally and attachment
type PostView = (String, String, String, i64, Option<String>);

fn post_view(p: &Post) -> PostView {
    (
        p.title.clone(),
        p.category.clone(),
        p.author.username.clone(),
        p.votes,
        p.file.clone(),
    )
}

/// Content, author name and tally
fn comment_view(c: &Comment) -> (String, String, i64) {
    (c.content.clone(), c.author.username.clone(), c.votes)
}

fn category_view(c: &CategoryRanking) -> (String, u64) {
    (c.name.clone(), c.count)
}

struct FuzzUser {
    name: String,
    token: String,
    mock: UserId,
}

/// One entity, under the id the app gave it and the one the mock gave it
struct Both<T> {
    app: T,
    mock: T,
}

struct ComparativeFuzzer {
    app: Router,
    mock: MockServer,
    users: Vec<FuzzUser>,
    posts: Vec<Both<PostId>>,
    comments: Vec<Both<CommentId>>,
    /// Posts and comments written per username
    activity: HashMap<String, (u64, u64)>,
    written: usize,
}

impl ComparativeFuzzer {
    fn new(pool: sqlx::PgPool) -> ComparativeFuzzer {
        ComparativeFuzzer {
            app: app(pool, test_keys(), HeaderValue::from_static(ORIGIN)),
            mock: MockServer::new(),
            users: Vec::new(),
            posts: Vec::new(),
            comments: Vec::new(),
            activity: HashMap::new(),
            written: 0,
        }
    }

    async fn register(&mut self, name: &str) {
        let creds = Credentials::new(String::from(name), format!("{name} password"));
        let app_res: Result<AuthResponse, ApiError> =
            run_on_app(&mut self.app, "POST", "/auth/register", None, &creds).await;
        let mock_res = self.mock.register(creds);
        if let (Ok(resp), &Ok(mock)) = (&app_res, &mock_res) {
            self.users.push(FuzzUser {
                name: String::from(name),
                token: resp.token.clone(),
                mock,
            });
        }
        compare(
            "Register",
            app_res.map(|r| r.username),
            mock_res.map(|_| String::from(name)),
        );
    }

    /// Picks a user, registering the first one if needed
    async fn user(&mut self, uid: usize) -> usize {
        if self.users.is_empty() {
            self.register(NAMES[0]).await;
        }
        resize_int(uid, ..self.users.len()).expect("no user even after registering one")
    }

    /// Picks a post, writing the first one if needed
    async fn post(&mut self, uid: usize, pid: usize) -> usize {
        if self.posts.is_empty() {
            self.create_post(uid, 0).await;
        }
        resize_int(pid, ..self.posts.len()).expect("no post even after writing one")
    }

    async fn create_post(&mut self, uid: usize, category: u8) {
        let uid = self.user(uid).await;
        self.written += 1;
        let data = NewPost {
            title: format!("post {}", self.written),
            content: String::from("some content"),
            category: String::from(CATEGORIES[usize::from(category) % CATEGORIES.len()]),
            file: (self.written % 3 == 0).then(|| String::from("https://example.org/a.png")),
        };
        let user = &self.users[uid];
        let app_res: Result<Post, ApiError> =
            run_on_app(&mut self.app, "POST", "/forum", Some(&user.token), &data).await;
        let mock_res = self.mock.create_post(user.mock, data);
        if let (Ok(app), Ok(mock)) = (&app_res, &mock_res) {
            self.posts.push(Both {
                app: app.id,
                mock: mock.id,
            });
            self.activity.entry(user.name.clone()).or_default().0 += 1;
        }
        compare(
            "CreatePost",
            app_res.map(|p| post_view(&p)),
            mock_res.map(|p| post_view(&p)),
        );
    }

    async fn create_comment(&mut self, uid: usize, pid: usize) {
        let pid = self.post(uid, pid).await;
        let uid = self.user(uid).await;
        self.written += 1;
        let data = NewComment {
            content: format!("comment {}", self.written),
        };
        let (user, post) = (&self.users[uid], &self.posts[pid]);
        let app_res: Result<Comment, ApiError> = run_on_app(
            &mut self.app,
            "POST",
            &format!("/forum/{}/comments", post.app.0),
            Some(&user.token),
            &data,
        )
        .await;
        let mock_res = self.mock.create_comment(user.mock, post.mock, data);
        if let (Ok(app), Ok(mock)) = (&app_res, &mock_res) {
            self.comments.push(Both {
                app: app.id,
                mock: mock.id,
            });
            self.activity.entry(user.name.clone()).or_default().1 += 1;
        }
        compare(
            "CreateComment",
            app_res.map(|c| comment_view(&c)),
            mock_res.map(|c| comment_view(&c)),
        );
    }

    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::Register { name } => {
                self.register(NAMES[usize::from(name) % NAMES.len()]).await
            }
            FuzzOp::Login {
                uid,
                wrong_password,
            } => {
                let uid = self.user(uid).await;
                let name = self.users[uid].name.clone();
                let password = match wrong_password {
                    true => String::from("wrong password"),
                    false => format!("{name} password"),
                };
                let creds = Credentials::new(name, password);
                let app_res: Result<AuthResponse, ApiError> =
                    run_on_app(&mut self.app, "POST", "/auth/login", None, &creds).await;
                let mock_res = self.mock.login(creds);
                compare("Login", app_res.map(|_| ()), mock_res.map(|_| ()));
            }
            FuzzOp::CreatePost { uid, category } => self.create_post(uid, category).await,
            FuzzOp::GetPost { pid } => {
                let (app_id, mock_id) = match resize_int(pid, ..self.posts.len()) {
                    Some(pid) => (self.posts[pid].app, self.posts[pid].mock),
                    None => {
                        let missing = PostId(Uuid::new_v4());
                        (missing, missing)
                    }
                };
                let uri = format!("/forum/{}", app_id.0);
                let app_res: Result<Post, ApiError> =
                    run_on_app(&mut self.app, "GET", &uri, None, &()).await;
                let mock_res = self.mock.post(mock_id);
                compare(
                    "GetPost",
                    app_res.map(|p| post_view(&p)),
                    mock_res.map(|p| post_view(&p)),
                );
            }
            FuzzOp::ListPosts => {
                let app_res: Result<Vec<Post>, ApiError> =
                    run_on_app(&mut self.app, "GET", "/forum", None, &()).await;
                let mock_res = self.mock.posts();
                compare(
                    "ListPosts",
                    app_res.map(|v| v.iter().map(post_view).collect::<Vec<_>>()),
                    Ok(mock_res.iter().map(post_view).collect()),
                );
            }
            FuzzOp::CreateComment { uid, pid } => self.create_comment(uid, pid).await,
            FuzzOp::CommentOnMissingPost { uid } => {
                let uid = self.user(uid).await;
                let missing = PostId(Uuid::new_v4());
                let data = NewComment {
                    content: String::from("lost"),
                };
                let user = &self.users[uid];
                let app_res: Result<Comment, ApiError> = run_on_app(
                    &mut self.app,
                    "POST",
                    &format!("/forum/{}/comments", missing.0),
                    Some(&user.token),
                    &data,
                )
                .await;
                let mock_res = self.mock.create_comment(user.mock, missing, data);
                compare(
                    "CommentOnMissingPost",
                    app_res.map(|c| comment_view(&c)),
                    mock_res.map(|c| comment_view(&c)),
                );
            }
            FuzzOp::ListComments { pid, all } => {
                if let Some(pid) = resize_int(pid, ..self.posts.len()) {
                    let post = &self.posts[pid];
                    let query = CommentsQuery {
                        all: all.then(|| String::from("true")),
                    };
                    let uri = match all {
                        true => format!("/forum/{}/comments?all=true", post.app.0),
                        false => format!("/forum/{}/comments", post.app.0),
                    };
                    let app_res: Result<Vec<Comment>, ApiError> =
                        run_on_app(&mut self.app, "GET", &uri, None, &()).await;
                    let mock_res = self.mock.comments(post.mock, &query);
                    compare(
                        "ListComments",
                        app_res.map(|v| v.iter().map(comment_view).collect::<Vec<_>>()),
                        Ok(mock_res.iter().map(comment_view).collect()),
                    );
                }
            }
            FuzzOp::VotePost {
                uid,
                pid,
                direction,
            } => {
                let pid = self.post(uid, pid).await;
                let uid = self.user(uid).await;
                let (user, post) = (&self.users[uid], &self.posts[pid]);
                let app_res: Result<VoteResponse, ApiError> = run_on_app(
                    &mut self.app,
                    "POST",
                    &format!("/forum/{}/vote", post.app.0),
                    Some(&user.token),
                    &VoteRequest { direction },
                )
                .await;
                let mock_res = self
                    .mock
                    .vote(VoteTarget::Post(post.mock), user.mock, direction)
                    .await;
                compare("VotePost", app_res.map(|r| r.votes), mock_res);
            }
            FuzzOp::VoteComment {
                uid,
                cid,
                direction,
            } => {
                if self.comments.is_empty() {
                    self.create_comment(uid, 0).await;
                }
                let cid = resize_int(cid, ..self.comments.len())
                    .expect("no comment even after writing one");
                let uid = self.user(uid).await;
                let (user, comment) = (&self.users[uid], &self.comments[cid]);
                let app_res: Result<VoteResponse, ApiError> = run_on_app(
                    &mut self.app,
                    "POST",
                    &format!("/comments/{}/vote", comment.app.0),
                    Some(&user.token),
                    &VoteRequest { direction },
                )
                .await;
                let mock_res = self
                    .mock
                    .vote(VoteTarget::Comment(comment.mock), user.mock, direction)
                    .await;
                compare("VoteComment", app_res.map(|r| r.votes), mock_res);
            }
            FuzzOp::VoteOnMissing {
                uid,
                comment,
                direction,
            } => {
                let uid = self.user(uid).await;
                let missing = Uuid::new_v4();
                let (uri, target) = match comment {
                    true => (
                        format!("/comments/{missing}/vote"),
                        VoteTarget::Comment(CommentId(missing)),
                    ),
                    false => (
                        format!("/forum/{missing}/vote"),
                        VoteTarget::Post(PostId(missing)),
                    ),
                };
                let user = &self.users[uid];
                let app_res: Result<VoteResponse, ApiError> = run_on_app(
                    &mut self.app,
                    "POST",
                    &uri,
                    Some(&user.token),
                    &VoteRequest { direction },
                )
                .await;
                let mock_res = self.mock.vote(target, user.mock, direction).await;
                compare("VoteOnMissing", app_res.map(|r| r.votes), mock_res);
            }
            FuzzOp::TopPosts => {
                let app_res: Result<Vec<Post>, ApiError> =
                    run_on_app(&mut self.app, "GET", "/forum/top", None, &()).await;
                let mock_res = ranking::top_posts(&mut self.mock)
                    .await
                    .expect("ranking posts on the mock");
                compare(
                    "TopPosts",
                    app_res.map(|v| v.iter().map(post_view).collect::<Vec<_>>()),
                    Ok(mock_res.iter().map(post_view).collect()),
                );
            }
            FuzzOp::RankUsers => {
                let app_res: Result<Vec<UserRanking>, ApiError> =
                    run_on_app(&mut self.app, "GET", "/forum/ranking/users", None, &()).await;
                let mock_res = ranking::top_users(&mut self.mock)
                    .await
                    .expect("ranking users on the mock");
                // ties are broken by user id, which differs between both sides
                let totals = |v: &[UserRanking]| {
                    v.iter()
                        .map(|r| r.total_interactions)
                        .collect::<Vec<_>>()
                };
                for r in app_res.iter().flatten().chain(mock_res.iter()) {
                    assert_eq!(
                        Some(&(r.post_count, r.comment_count)),
                        self.activity.get(&r.username),
                        "wrong counts in user ranking entry {r:?}"
                    );
                }
                compare(
                    "RankUsers",
                    app_res.map(|v| totals(&v)),
                    Ok(totals(&mock_res)),
                );
            }
            FuzzOp::RankCategories => {
                let app_res: Result<Vec<CategoryRanking>, ApiError> = run_on_app(
                    &mut self.app,
                    "GET",
                    "/forum/ranking/categories",
                    None,
                    &(),
                )
                .await;
                let mock_res = ranking::top_categories(&mut self.mock)
                    .await
                    .expect("ranking categories on the mock");
                compare(
                    "RankCategories",
                    app_res.map(|v| v.iter().map(category_view).collect::<Vec<_>>()),
                    Ok(mock_res.iter().map(category_view).collect()),
                );
            }
        }
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool);
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
    }
);

async fn register(app: &mut Router, name: &str) -> String {
    let creds = Credentials::new(String::from(name), format!("{name} password"));
    let resp: AuthResponse = run_on_app(app, "POST", "/auth/register", None, &creds)
        .await
        .expect("registering user");
    resp.token
}

async fn write_post(app: &mut Router, token: &str, title: &str) -> Post {
    let data = NewPost {
        title: String::from(title),
        content: String::from("content"),
        category: String::from("news"),
        file: None,
    };
    run_on_app(app, "POST", "/forum", Some(token), &data)
        .await
        .expect("writing post")
}

async fn vote_on(
    app: &mut Router,
    uri: &str,
    token: &str,
    direction: VoteDirection,
) -> Result<i64, ApiError> {
    run_on_app::<_, VoteResponse>(app, "POST", uri, Some(token), &VoteRequest { direction })
        .await
        .map(|r| r.votes)
}

do_sqlx_test!(up_down_sequence_on_postgres, |pool| async move {
    let mut app = app(pool, test_keys(), HeaderValue::from_static(ORIGIN));
    let alice = register(&mut app, "alice").await;
    let bob = register(&mut app, "bob").await;
    let post = write_post(&mut app, &alice, "hello").await;
    let uri = format!("/forum/{}/vote", post.id.0);

    assert_eq!(vote_on(&mut app, &uri, &bob, VoteDirection::Up).await, Ok(1));
    assert_eq!(
        vote_on(&mut app, &uri, &bob, VoteDirection::Up).await,
        Err(ApiError::DuplicateVote(VoteDirection::Up))
    );
    assert_eq!(vote_on(&mut app, &uri, &bob, VoteDirection::Down).await, Ok(-1));
    assert_eq!(vote_on(&mut app, &uri, &alice, VoteDirection::Down).await, Ok(-2));

    let fetched: Post = run_on_app(&mut app, "GET", &format!("/forum/{}", post.id.0), None, &())
        .await
        .expect("fetching post");
    assert_eq!(fetched.votes, -2);

    let missing = format!("/forum/{}/vote", Uuid::new_v4());
    let res = vote_on(&mut app, &missing, &bob, VoteDirection::Up).await;
    assert!(matches!(res, Err(ApiError::PostNotFound(_))), "got {res:?}");
});

do_sqlx_test!(comment_preview_on_postgres, |pool| async move {
    let mut app = app(pool, test_keys(), HeaderValue::from_static(ORIGIN));
    let alice = register(&mut app, "alice").await;
    let post = write_post(&mut app, &alice, "hello").await;
    let uri = format!("/forum/{}/comments", post.id.0);
    for i in 0..5 {
        let data = NewComment {
            content: format!("comment {i}"),
        };
        let _: Comment = run_on_app(&mut app, "POST", &uri, Some(&alice), &data)
            .await
            .expect("writing comment");
    }

    let preview: Vec<Comment> = run_on_app(&mut app, "GET", &uri, None, &())
        .await
        .expect("listing comments");
    let contents = preview.iter().map(|c| c.content.as_str()).collect::<Vec<_>>();
    assert_eq!(contents, ["comment 4", "comment 3", "comment 2"]);

    let all: Vec<Comment> = run_on_app(&mut app, "GET", &format!("{uri}?all=true"), None, &())
        .await
        .expect("listing all comments");
    assert_eq!(all.len(), 5);

    let missing = PostId(Uuid::new_v4());
    let data = NewComment {
        content: String::from("lost"),
    };
    let res: Result<Comment, ApiError> = run_on_app(
        &mut app,
        "POST",
        &format!("/forum/{}/comments", missing.0),
        Some(&alice),
        &data,
    )
    .await;
    assert_eq!(res.map(|c| c.id), Err(ApiError::PostNotFound(missing)));
});

do_sqlx_test!(writes_by_vanished_users_are_unauthorized, |pool| async move {
    let keys = test_keys();
    let mut app = app(pool, keys.clone(), HeaderValue::from_static(ORIGIN));
    let alice = register(&mut app, "alice").await;
    let post = write_post(&mut app, &alice, "hello").await;
    let comment: Comment = run_on_app(
        &mut app,
        "POST",
        &format!("/forum/{}/comments", post.id.0),
        Some(&alice),
        &NewComment {
            content: String::from("first"),
        },
    )
    .await
    .expect("writing comment");

    // signed with the right secret, for a user that has no row
    let ghost = keys
        .issue(UserId(Uuid::new_v4()))
        .expect("issuing token");

    let data = NewPost {
        title: String::from("t"),
        content: String::from("c"),
        category: String::from("news"),
        file: None,
    };
    let res: Result<Post, ApiError> =
        run_on_app(&mut app, "POST", "/forum", Some(&ghost), &data).await;
    assert_eq!(res.map(|p| p.id), Err(ApiError::Unauthorized));

    let res: Result<Comment, ApiError> = run_on_app(
        &mut app,
        "POST",
        &format!("/forum/{}/comments", post.id.0),
        Some(&ghost),
        &NewComment {
            content: String::from("boo"),
        },
    )
    .await;
    assert_eq!(res.map(|c| c.id), Err(ApiError::Unauthorized));

    for uri in [
        format!("/forum/{}/vote", post.id.0),
        format!("/comments/{}/vote", comment.id.0),
    ] {
        let res = vote_on(&mut app, &uri, &ghost, VoteDirection::Up).await;
        assert_eq!(res, Err(ApiError::Unauthorized));
    }

    let fetched: Post = run_on_app(&mut app, "GET", &format!("/forum/{}", post.id.0), None, &())
        .await
        .expect("fetching post");
    assert_eq!(fetched.votes, 0);
    let ranked: Vec<UserRanking> =
        run_on_app(&mut app, "GET", "/forum/ranking/users", None, &())
            .await
            .expect("ranking users");
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].username, "alice");
    assert_eq!((ranked[0].post_count, ranked[0].comment_count), (1, 1));
});
