// Credential checking for the authentication step.
//
// Where usernames and passwords actually live (a database, a file, an
// external directory) is outside the server's concern; sessions only see a
// `CredentialStore`. `StaticCredentials` is the in-memory store used by the
// binary (users from flags or the config file) and by tests.

use std::collections::BTreeMap;

use crate::config::UserEntry;

pub trait CredentialStore: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    users: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        self.insert(username, password);
        self
    }

    pub fn insert(&mut self, username: &str, password: &str) {
        self.users.insert(username.into(), password.into());
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Parse a `name:password` pair as given to `--user`.
    pub fn parse_entry(entry: &str) -> Option<(String, String)> {
        let (name, password) = entry.split_once(':')?;
        if name.is_empty() {
            return None;
        }
        Some((name.into(), password.into()))
    }
}

impl FromIterator<UserEntry> for StaticCredentials {
    fn from_iter<I: IntoIterator<Item = UserEntry>>(iter: I) -> Self {
        Self {
            users: iter
                .into_iter()
                .map(|u| (u.username, u.password))
                .collect(),
        }
    }
}

impl CredentialStore for StaticCredentials {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.users.get(username).is_some_and(|p| p == password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_known_users_only() {
        let store = StaticCredentials::new().with_user("sensor1", "hunter2");
        assert!(store.verify("sensor1", "hunter2"));
        assert!(!store.verify("sensor1", "hunter3"));
        assert!(!store.verify("sensor2", "hunter2"));
    }

    #[test]
    fn parses_user_flags() {
        assert_eq!(
            StaticCredentials::parse_entry("mgr:a:b"),
            Some(("mgr".into(), "a:b".into()))
        );
        assert_eq!(StaticCredentials::parse_entry("nopassword"), None);
        assert_eq!(StaticCredentials::parse_entry(":pw"), None);
    }
}
