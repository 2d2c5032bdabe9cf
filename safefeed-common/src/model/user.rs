use crate::{
    model::{Id, auth::PasswordHash},
    util::char_len,
};
use serde::{
    Deserialize, Deserializer, Serialize,
    de::{Error, Unexpected},
};
use std::fmt::{Display, Formatter};
use thiserror::Error;

pub const USER_HANDLE_MAX_LEN: usize = 50;

/// Punctuation allowed in handles besides letters and digits.
const USER_HANDLE_EXTRA_CHARS: &[char] = &['@', '.', '+', '-', '_'];

/// Handles that collide with static `/users/...` routes.
pub const RESERVED_USER_HANDLES: &[&str] = &["search"];

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct UserMarker;

#[derive(Clone, Eq, PartialEq, Debug, Default, Hash, Deserialize, Serialize)]
pub struct User {
    pub id: Id<UserMarker>,
    pub handle: UserHandle,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct CreateUser {
    pub handle: UserHandle,
    pub password_hash: PasswordHash,
}

/// Login name. Unique among users, compared exactly.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Serialize)]
#[serde(transparent)]
pub struct UserHandle(String);

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error("The user handle is invalid: {0:?}")]
pub struct InvalidUserHandleError(String);

impl UserHandle {
    pub fn new(handle: String) -> Result<Self, InvalidUserHandleError> {
        let valid_chars = handle
            .chars()
            .all(|c| c.is_alphanumeric() || USER_HANDLE_EXTRA_CHARS.contains(&c));

        let reserved = RESERVED_USER_HANDLES.contains(&handle.as_str());

        if !handle.is_empty()
            && valid_chars
            && !reserved
            && char_len(&handle) <= USER_HANDLE_MAX_LEN
        {
            Ok(UserHandle(handle))
        } else {
            Err(InvalidUserHandleError(handle))
        }
    }

    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Display for UserHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserHandle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = String::deserialize(deserializer)?;
        UserHandle::new(inner)
            .map_err(|err| Error::invalid_value(Unexpected::Str(&err.0), &"UserHandle"))
    }
}

#[cfg(test)]
mod tests {
    use crate::model::user::{USER_HANDLE_MAX_LEN, UserHandle};

    #[test]
    fn handle_validation() {
        for valid in ["alice", "bob.smith", "a+b@c-d_e", "ünïcödé", "x"] {
            assert!(UserHandle::new(valid.to_owned()).is_ok(), "{valid}");
        }
        for invalid in ["", "with space", "semi;colon", "tab\t", "slash/", "search"] {
            assert!(UserHandle::new(invalid.to_owned()).is_err(), "{invalid}");
        }

        assert!(UserHandle::new("a".repeat(USER_HANDLE_MAX_LEN)).is_ok());
        assert!(UserHandle::new("a".repeat(USER_HANDLE_MAX_LEN + 1)).is_err());
    }

    #[test]
    fn handle_deserialization_validates() {
        assert!(serde_json::from_str::<UserHandle>("\"carol\"").is_ok());
        assert!(serde_json::from_str::<UserHandle>("\"no spaces allowed\"").is_err());
    }
}
