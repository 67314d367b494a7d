//! Account book: the accounts file and trade routing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::models::{Account, PendingTrade};

/// Accounts the worker trades on.
#[derive(Debug, Clone, Default)]
pub struct AccountBook {
    accounts: Vec<Account>,
    source: Option<PathBuf>,
}

impl AccountBook {
    /// Load a JSON array of accounts.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let accounts = read_accounts(path)?;

        info!(
            path = %path.display(),
            accounts = accounts.len(),
            leaders = accounts.iter().filter(|a| a.is_leader()).count(),
            "Loaded accounts"
        );

        Ok(Self {
            accounts,
            source: Some(path.to_path_buf()),
        })
    }

    #[cfg(test)]
    pub fn from_accounts(accounts: Vec<Account>) -> Self {
        Self {
            accounts,
            source: None,
        }
    }

    /// Re-read the file this book was loaded from. A book built in memory
    /// is left as is.
    pub fn reload(&mut self) -> Result<()> {
        if let Some(path) = &self.source {
            self.accounts = read_accounts(path)?;
        }
        Ok(())
    }

    pub fn all(&self) -> &[Account] {
        &self.accounts
    }

    pub fn leaders(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter().filter(|a| a.is_leader())
    }

    pub fn followers(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter().filter(|a| a.is_follower())
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Accounts a queued trade is replayed on.
    ///
    /// An `account_login` pins the trade to that account. Otherwise a
    /// `leader_login` sends it to that leader plus every follower, and a
    /// trade with neither goes to every account.
    pub fn targets_for(&self, trade: &PendingTrade) -> Vec<&Account> {
        if let Some(login) = trade.account_login {
            return self.accounts.iter().filter(|a| a.login == login).collect();
        }

        match trade.leader_login {
            Some(leader) => self
                .accounts
                .iter()
                .filter(|a| a.login == leader || a.is_follower())
                .collect(),
            None => self.accounts.iter().collect(),
        }
    }
}

fn read_accounts(path: &Path) -> Result<Vec<Account>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read accounts file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse accounts file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use rust_decimal_macros::dec;

    fn account(login: u64, role: Role) -> Account {
        Account {
            login,
            password: "pw".to_string(),
            path: "terminal64.exe".to_string(),
            server: "Demo".to_string(),
            role,
        }
    }

    fn trade(leader: Option<u64>, account: Option<u64>) -> PendingTrade {
        PendingTrade {
            trade_id: "t1".to_string(),
            instrument: "EURUSD".to_string(),
            quantity: dec!(0.1),
            side: "buy".to_string(),
            sl: 0.0,
            tp: 0.0,
            leader_login: leader,
            account_login: account,
        }
    }

    fn book() -> AccountBook {
        AccountBook::from_accounts(vec![
            account(1, Role::Leader),
            account(2, Role::Leader),
            account(10, Role::Follower),
            account(11, Role::Follower),
        ])
    }

    fn logins(accounts: Vec<&Account>) -> Vec<u64> {
        accounts.iter().map(|a| a.login).collect()
    }

    #[test]
    fn test_unrouted_trade_goes_everywhere() {
        let book = book();
        assert_eq!(logins(book.targets_for(&trade(None, None))), vec![1, 2, 10, 11]);
    }

    #[test]
    fn test_leader_trade_goes_to_leader_and_followers() {
        let book = book();
        assert_eq!(logins(book.targets_for(&trade(Some(2), None))), vec![2, 10, 11]);
    }

    #[test]
    fn test_account_login_pins_single_account() {
        let book = book();
        assert_eq!(logins(book.targets_for(&trade(Some(2), Some(11)))), vec![11]);
        assert!(book.targets_for(&trade(None, Some(99))).is_empty());
    }

    #[test]
    fn test_load_and_reload() {
        let path = std::env::temp_dir().join(format!("tradeq-accounts-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{"login": 1, "password": "a", "path": "p", "server": "s", "role": "leader"}]"#,
        )
        .unwrap();

        let mut book = AccountBook::load(&path).unwrap();
        assert_eq!(book.leaders().count(), 1);

        std::fs::write(
            &path,
            r#"[{"login": 1, "password": "a", "path": "p", "server": "s", "role": "leader"},
                {"login": 2, "password": "b", "path": "p", "server": "s", "role": "follower"}]"#,
        )
        .unwrap();
        book.reload().unwrap();
        assert_eq!(book.len(), 2);
        assert_eq!(book.followers().count(), 1);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AccountBook::load("/nonexistent/accounts.json").is_err());
    }
}
