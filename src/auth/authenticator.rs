//! Credential Checking

use std::collections::HashMap;

use crate::config::AuthConfig;

/// Decides whether a user/password pair may open a session
#[derive(Debug, Clone)]
pub enum Authenticator {
    /// Fixed username to password mapping
    Credentials(HashMap<String, String>),
    /// Authentication disabled: only an empty user and password pass
    NoAuth,
}

impl Authenticator {
    /// Build from configuration. Disabled auth yields [`Authenticator::NoAuth`].
    pub fn from_config(config: &AuthConfig) -> Self {
        if !config.enabled {
            return Authenticator::NoAuth;
        }
        Authenticator::Credentials(
            config
                .users
                .iter()
                .map(|u| (u.username.clone(), u.password.clone()))
                .collect(),
        )
    }

    /// Single user convenience constructor. An empty user means no auth.
    pub fn single(user: &str, password: &str) -> Self {
        if user.is_empty() {
            return Authenticator::NoAuth;
        }
        let mut users = HashMap::new();
        users.insert(user.to_string(), password.to_string());
        Authenticator::Credentials(users)
    }

    pub fn valid(&self, user: &str, password: &str) -> bool {
        match self {
            Authenticator::Credentials(users) => {
                users.get(user).map(|p| p == password).unwrap_or(false)
            }
            Authenticator::NoAuth => user.is_empty() && password.is_empty(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Authenticator::Credentials(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;

    #[test]
    fn test_from_config_disabled() {
        let auth = Authenticator::from_config(&AuthConfig::default());
        assert!(!auth.is_enabled());
        assert!(auth.valid("", ""));
    }

    #[test]
    fn test_from_config_users() {
        let config = AuthConfig {
            enabled: true,
            users: vec![
                UserConfig {
                    username: "alice".to_string(),
                    password: "a".to_string(),
                },
                UserConfig {
                    username: "bob".to_string(),
                    password: "b".to_string(),
                },
            ],
        };
        let auth = Authenticator::from_config(&config);
        assert!(auth.valid("alice", "a"));
        assert!(auth.valid("bob", "b"));
        assert!(!auth.valid("alice", "b"));
        assert!(!auth.valid("", ""));
    }

    #[test]
    fn test_single_with_empty_user_is_no_auth() {
        assert!(matches!(Authenticator::single("", "x"), Authenticator::NoAuth));
    }
}
