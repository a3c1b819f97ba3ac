//! Credential-aware tokenisation.
//!
//! `TokenisedString` holds a raw value and a masked form so narration and
//! persistence always read from the masked side while execution reads from
//! the raw side. Stored action sequences carry `${username}`/`${password}`
//! tokens that are detokenised just-in-time at replay.

use std::collections::HashMap;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::config::NoemaConfig;
use crate::narration::MASK_PLACEHOLDER;

pub const USERNAME_TOKEN: &str = "${username}";
pub const PASSWORD_TOKEN: &str = "${password}";

/// A secret with a raw side and a masked side. `Display`, `Debug`, and
/// `Serialize` all read the masked side; only `raw()` exposes the value.
#[derive(Clone)]
pub struct TokenisedString {
    raw: String,
}

impl TokenisedString {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn masked(&self) -> &'static str {
        MASK_PLACEHOLDER
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl fmt::Display for TokenisedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.masked())
    }
}

impl fmt::Debug for TokenisedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenisedString({})", self.masked())
    }
}

impl Serialize for TokenisedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.masked())
    }
}

/// Test credentials for the site under test.
#[derive(Clone, Default)]
pub struct TestCredentials {
    username: Option<TokenisedString>,
    password: Option<TokenisedString>,
    extra: HashMap<String, TokenisedString>,
}

impl TestCredentials {
    pub fn from_config(config: &NoemaConfig) -> Self {
        Self {
            username: config
                .test_username
                .as_ref()
                .filter(|v| !v.is_empty())
                .map(TokenisedString::new),
            password: config
                .test_password
                .as_ref()
                .filter(|v| !v.is_empty())
                .map(TokenisedString::new),
            extra: config
                .test_credentials_extra
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (k.clone(), TokenisedString::new(v)))
                .collect(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some() || self.password.is_some() || !self.extra.is_empty()
    }

    pub fn raw_username(&self) -> Option<&str> {
        self.username.as_ref().map(TokenisedString::raw)
    }

    pub fn raw_password(&self) -> Option<&str> {
        self.password.as_ref().map(TokenisedString::raw)
    }

    /// Replace `${username}`/`${password}` tokens with raw values.
    pub fn detokenise(&self, template: &str) -> String {
        let mut value = template.to_string();
        if let Some(username) = &self.username {
            value = value.replace(USERNAME_TOKEN, username.raw());
        }
        if let Some(password) = &self.password {
            value = value.replace(PASSWORD_TOKEN, password.raw());
        }
        value
    }

    /// Replace raw credential values with tokens, for storage.
    pub fn tokenise(&self, value: &str) -> String {
        let mut tokenised = value.to_string();
        if let Some(password) = &self.password {
            if !password.is_empty() {
                tokenised = tokenised.replace(password.raw(), PASSWORD_TOKEN);
            }
        }
        if let Some(username) = &self.username {
            if !username.is_empty() {
                tokenised = tokenised.replace(username.raw(), USERNAME_TOKEN);
            }
        }
        tokenised
    }

    /// Replace raw credential values with the mask placeholder, for
    /// narration and persisted action inputs.
    pub fn mask(&self, value: &str) -> String {
        let mut masked = value.to_string();
        if let Some(password) = &self.password {
            if !password.is_empty() {
                masked = masked.replace(password.raw(), MASK_PLACEHOLDER);
            }
        }
        if let Some(username) = &self.username {
            if !username.is_empty() {
                masked = masked.replace(username.raw(), MASK_PLACEHOLDER);
            }
        }
        for secret in self.extra.values() {
            if !secret.is_empty() {
                masked = masked.replace(secret.raw(), MASK_PLACEHOLDER);
            }
        }
        masked
    }

    /// True when the value references either credential, raw or tokenised.
    pub fn mentions_credentials(&self, value: &str) -> bool {
        if value.contains(USERNAME_TOKEN) || value.contains(PASSWORD_TOKEN) {
            return true;
        }
        self.username
            .as_ref()
            .is_some_and(|u| !u.is_empty() && value.contains(u.raw()))
            || self
                .password
                .as_ref()
                .is_some_and(|p| !p.is_empty() && value.contains(p.raw()))
    }

    /// Prompt block for the decision LLM. This is the only place raw
    /// values are intentionally surfaced.
    pub fn prompt_block(&self) -> Option<String> {
        if !self.is_configured() {
            return None;
        }
        let mut lines = vec!["Test credentials for this site:".to_string()];
        if let Some(username) = &self.username {
            lines.push(format!("  username: {}", username.raw()));
        }
        if let Some(password) = &self.password {
            lines.push(format!("  password: {}", password.raw()));
        }
        Some(lines.join("\n"))
    }
}

impl fmt::Debug for TestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCredentials")
            .field("username", &self.username)
            .field("password", &self.password)
            .field("extra_keys", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> TestCredentials {
        let mut config = NoemaConfig::default();
        config.test_username = Some("standard_user".into());
        config.test_password = Some("secret_sauce".into());
        TestCredentials::from_config(&config)
    }

    #[test]
    fn tokenise_and_detokenise_round_trip() {
        let creds = credentials();
        let tokenised = creds.tokenise("secret_sauce");
        assert_eq!(tokenised, PASSWORD_TOKEN);
        assert_eq!(creds.detokenise(&tokenised), "secret_sauce");
    }

    #[test]
    fn display_and_debug_never_leak() {
        let secret = TokenisedString::new("hunter2");
        assert!(!format!("{secret}").contains("hunter2"));
        assert!(!format!("{secret:?}").contains("hunter2"));
        assert!(!serde_json::to_string(&secret).unwrap().contains("hunter2"));
        assert_eq!(secret.raw(), "hunter2");
    }

    #[test]
    fn mask_replaces_all_credentials() {
        let creds = credentials();
        let masked = creds.mask("typed standard_user then secret_sauce");
        assert!(!masked.contains("standard_user"));
        assert!(!masked.contains("secret_sauce"));
    }

    #[test]
    fn mentions_credentials_detects_tokens_and_raw() {
        let creds = credentials();
        assert!(creds.mentions_credentials("${username}"));
        assert!(creds.mentions_credentials("secret_sauce"));
        assert!(!creds.mentions_credentials("add-to-cart"));
    }
}
