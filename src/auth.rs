//! Authentication schemes for HELLO/LOGON.

use crate::value::{Dict, Value};

/// A credential set sent to the server during authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// No authentication.
    None,
    /// Username and password.
    Basic { username: String, password: String },
    /// Bearer token (OIDC and friends).
    Bearer { token: String },
    /// Base64-encoded Kerberos ticket.
    Kerberos { ticket: String },
}

impl Auth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    pub fn kerberos(ticket: impl Into<String>) -> Self {
        Self::Kerberos {
            ticket: ticket.into(),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic { .. } => "basic",
            Self::Bearer { .. } => "bearer",
            Self::Kerberos { .. } => "kerberos",
        }
    }

    /// The credential map carried in the HELLO/LOGON payload.
    pub fn to_token(&self) -> Dict {
        let mut token = Dict::from([("scheme".to_string(), Value::from(self.scheme()))]);
        match self {
            Self::None => {}
            Self::Basic { username, password } => {
                token.insert("principal".to_string(), Value::from(username.as_str()));
                token.insert("credentials".to_string(), Value::from(password.as_str()));
            }
            Self::Bearer { token: bearer } => {
                token.insert("credentials".to_string(), Value::from(bearer.as_str()));
            }
            Self::Kerberos { ticket } => {
                token.insert("principal".to_string(), Value::from(""));
                token.insert("credentials".to_string(), Value::from(ticket.as_str()));
            }
        }
        token
    }

    /// An identity string for the connection-reuse gate. Two requests with the
    /// same fingerprint authenticate as the same effective principal; any
    /// difference forces a fresh connection.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::None => "none".to_string(),
            Self::Basic { username, password } => format!("basic:{username}:{password}"),
            Self::Bearer { token } => format!("bearer:{token}"),
            Self::Kerberos { ticket } => format!("kerberos:{ticket}"),
        }
    }
}
