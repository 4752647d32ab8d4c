use std::ops::{Deref, DerefMut};

use anyhow::Context;
use axum::{
    async_trait,
    body::HttpBody,
    extract::{FromRequest, FromRequestParts},
    http::{self, request, Request},
    BoxError, Json,
};
use agora_api::UserId;

use crate::{token::TokenKeys, Error};

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub db: PgPool,
    pub keys: TokenKeys,
}

#[derive(Clone)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    pub fn new(pool: sqlx::PgPool) -> PgPool {
        PgPool(pool)
    }

    pub async fn acquire(&self) -> Result<PgConn, Error> {
        Ok(PgConn(
            self.0.acquire().await.context("acquiring db connection")?,
        ))
    }
}

pub struct PgConn(sqlx::pool::PoolConnection<sqlx::Postgres>);

#[async_trait]
impl FromRequestParts<AppState> for PgConn {
    type Rejection = Error;

    async fn from_request_parts(
        _req: &mut request::Parts,
        state: &AppState,
    ) -> Result<PgConn, Error> {
        state.db.acquire().await
    }
}

impl Deref for PgConn {
    type Target = sqlx::PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PgConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Raw bearer token, not yet verified
pub struct PreAuth(pub String);

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        match req.headers.get(http::header::AUTHORIZATION) {
            None => Err(Error::unauthorized()),
            Some(auth) => {
                let auth = auth.to_str().map_err(|_| Error::unauthorized())?;
                let mut auth = auth.split(' ');
                if !auth
                    .next()
                    .ok_or(Error::unauthorized())?
                    .eq_ignore_ascii_case("bearer")
                {
                    return Err(Error::unauthorized());
                }
                let token = auth.next().ok_or(Error::unauthorized())?;
                if token.is_empty() || auth.next().is_some() {
                    return Err(Error::unauthorized());
                }
                Ok(PreAuth(String::from(token)))
            }
        }
    }
}

/// Identity of the caller, resolved from a valid bearer token
pub struct Auth(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &AppState) -> Result<Auth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        Ok(Auth(state.keys.verify(&token)?))
    }
}

/// `Json` whose rejections are reported like every other client error
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, B, T> FromRequest<S, B> for JsonBody<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
    B: HttpBody + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Rejection = Error;

    async fn from_request(req: Request<B>, state: &S) -> Result<JsonBody<T>, Error> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(data)) => Ok(JsonBody(data)),
            Err(rejection) => Err(Error::invalid_body(rejection.body_text())),
        }
    }
}
