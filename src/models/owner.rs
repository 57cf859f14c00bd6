use serde::{Deserialize, Serialize};

/// Identity of the producer that owns a session, or of the viewer that
/// caused a terminal spawn. The subject is the identity provider's opaque
/// user id; the username is display-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub subject: String,
    pub username: String,
}

impl Owner {
    pub fn new(subject: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            username: username.into(),
        }
    }
}
