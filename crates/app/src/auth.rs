use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// Gateway token check for the action endpoint. An empty token list disables
/// the check, which is only appropriate for local development.
pub struct TokenChecker {
    tokens: Vec<String>,
}

impl TokenChecker {
    pub fn new(config: &AuthConfig) -> Self {
        if config.tokens.is_empty() {
            warn!("no gateway tokens configured; action authentication is disabled");
        }
        Self {
            tokens: config.tokens.clone(),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn check(&self, token: Option<&str>) -> bool {
        if self.tokens.is_empty() {
            return true;
        }
        token.is_some_and(|candidate| self.tokens.iter().any(|known| known == candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_list_disables_the_check() {
        let checker = TokenChecker::new(&AuthConfig::default());
        assert!(!checker.enabled());
        assert!(checker.check(None));
        assert!(checker.check(Some("anything")));
    }

    #[test]
    fn configured_tokens_require_an_exact_match() {
        let checker = TokenChecker::new(&AuthConfig {
            tokens: vec!["secret-a".into(), "secret-b".into()],
        });
        assert!(checker.enabled());
        assert!(checker.check(Some("secret-a")));
        assert!(checker.check(Some("secret-b")));
        assert!(!checker.check(Some("secret-c")));
        assert!(!checker.check(Some("")));
        assert!(!checker.check(None));
    }
}
