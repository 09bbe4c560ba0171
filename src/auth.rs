use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::observability::AUTH_FAILURES_TOTAL;

/// Shared-password authentication. The login name is the user's id, so
/// anything that isn't a ULID is turned away before the password check.
#[derive(Debug)]
pub struct PeerlinkAuthSource {
    password: String,
}

impl PeerlinkAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for PeerlinkAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if Ulid::from_string(user).is_err() {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!(user, "rejected login: not a user id");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("login {user:?} is not a user id"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
