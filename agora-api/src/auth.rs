use crate::Error;

pub const BCRYPT_COST: u32 = 10;

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Credentials {
        Credentials { username, password }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_field("username", &self.username)?;
        crate::validate_field("password", &self.password)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub username: String,
}
