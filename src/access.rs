//! Identity as handed to the engine by the authentication layer.
//!
//! The engine never authenticates. Callers resolve a session to a
//! [`Principal`] and gate operations by role here; ownership checks
//! (slot tutor, booking student) happen inside the engine transaction.

use ulid::Ulid;

use crate::model::{Role, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub id: Ulid,
    pub role: Role,
}

impl Principal {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn require(&self, role: Role) -> Result<(), AccessError> {
        if self.role == role {
            Ok(())
        } else {
            Err(AccessError::RoleRequired(role))
        }
    }
}

impl From<&User> for Principal {
    fn from(user: &User) -> Self {
        Self::new(user.id, user.role)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("session user is not a valid id: {0}")]
    BadIdentity(String),
    #[error("unknown user: {0}")]
    UnknownUser(Ulid),
    #[error("{} role required", .0.as_str())]
    RoleRequired(Role),
    #[error("cannot register {0} from another login")]
    ForeignIdentity(Ulid),
}
