use anyhow::Context;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};

use agora_api::{UserId, Uuid};

use crate::Error;

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct Claims {
    sub: Uuid,
    iat: i64,
    exp: i64,
}

/// Signs and checks the bearer tokens handed out at register/login
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl TokenKeys {
    pub fn new(secret: &str, lifetime: Duration) -> TokenKeys {
        TokenKeys {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            lifetime,
        }
    }

    pub fn issue(&self, user: UserId) -> anyhow::Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.0,
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .with_context(|| format!("signing token for {user:?}"))
    }

    pub fn verify(&self, token: &str) -> Result<UserId, Error> {
        match jsonwebtoken::decode::<Claims>(token, &self.decoding, &Validation::default()) {
            Ok(data) => Ok(UserId(data.claims.sub)),
            Err(err) => {
                tracing::debug!(?err, "rejecting bearer token");
                Err(Error::unauthorized())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_api::Error as ApiError;

    fn is_unauthorized(res: Result<UserId, Error>) -> bool {
        matches!(res, Err(Error::Api(ApiError::Unauthorized)))
    }

    #[test]
    fn issued_token_resolves_to_user() {
        let keys = TokenKeys::new("secret", Duration::hours(1));
        let user = UserId(Uuid::new_v4());
        let tok = keys.issue(user).unwrap();
        assert_eq!(keys.verify(&tok).unwrap(), user);
    }

    #[test]
    fn foreign_or_expired_tokens_are_rejected() {
        let keys = TokenKeys::new("secret", Duration::hours(1));
        let user = UserId(Uuid::new_v4());

        let other = TokenKeys::new("other secret", Duration::hours(1));
        assert!(is_unauthorized(keys.verify(&other.issue(user).unwrap())));

        // well past the default 60s leeway
        let expired = TokenKeys::new("secret", Duration::hours(-1));
        assert!(is_unauthorized(keys.verify(&expired.issue(user).unwrap())));

        assert!(is_unauthorized(keys.verify("")));
        assert!(is_unauthorized(keys.verify("a.b.c")));
    }
}
