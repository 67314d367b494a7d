//! Terminal account records loaded from the accounts file.

use serde::{Deserialize, Serialize};

/// Role of an account in trade copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    #[default]
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

/// Credentials and terminal location for one trading account.
#[derive(Clone, Serialize, Deserialize)]
pub struct Account {
    /// Broker account number
    pub login: u64,

    /// Trading password
    pub password: String,

    /// Path to the terminal executable serving this account
    pub path: String,

    /// Broker trade server name
    pub server: String,

    /// Leader or follower (queue-only account files may omit it)
    #[serde(default)]
    pub role: Role,
}

impl Account {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn is_follower(&self) -> bool {
        self.role == Role::Follower
    }
}

// Keeps passwords out of logs and `accounts` output.
impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("login", &self.login)
            .field("password", &"***")
            .field("path", &self.path)
            .field("server", &self.server)
            .field("role", &self.role)
            .finish()
    }
}
