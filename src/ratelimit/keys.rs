//! Store key derivation for a limiter token.

/// Suffix of the distributed mutex key.
const LOCK_SUFFIX: &str = "lock";
/// Suffix of the admission window key.
const WINDOW_SUFFIX: &str = "window";

/// The store keys owned by one token.
///
/// Keys have the shape `{namespace}:{token length}:{token}:{suffix}`. The
/// length prefix keeps derivation injective even when tokens contain the
/// delimiter, and the suffixes keep the lock and window keys apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKeys {
    /// The token these keys were derived from
    pub token: String,
    /// Key of the distributed mutex
    pub lock: String,
    /// Key of the admission window list
    pub window: String,
}

impl TokenKeys {
    pub fn derive(namespace: &str, token: &str) -> Self {
        let base = format!("{}:{}:{}", namespace, token.len(), token);
        Self {
            token: token.to_string(),
            lock: format!("{}:{}", base, LOCK_SUFFIX),
            window: format!("{}:{}", base, WINDOW_SUFFIX),
        }
    }
}

impl std::fmt::Display for TokenKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token)
    }
}
