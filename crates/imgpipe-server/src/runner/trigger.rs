use serde::{Deserialize, Serialize};
use std::path::Path;

/// What woke a runner up
///
/// Both variants end in the same claim path; duplicated or out-of-order
/// events are harmless because the claim decides who works on a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// An object-store notification naming one key
    Event { key: String },
    /// A scan of every key under a prefix
    Poll { prefix: String },
}

impl Trigger {
    pub fn event(key: impl Into<String>) -> Self {
        Self::Event { key: key.into() }
    }

    pub fn poll(prefix: impl Into<String>) -> Self {
        Self::Poll {
            prefix: prefix.into(),
        }
    }

    /// Key prefix the trigger covers
    pub fn prefix(&self) -> &str {
        match self {
            Trigger::Event { key } => key,
            Trigger::Poll { prefix } => prefix,
        }
    }
}

/// Case-insensitive extension filter; an empty allow-list accepts everything
pub fn has_allowed_extension(key: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            allowed
                .iter()
                .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_filter() {
        let allowed = vec![".jpg".to_string(), "png".to_string(), ".jpeg".to_string()];
        assert!(has_allowed_extension("drone/a.JPG", &allowed));
        assert!(has_allowed_extension("b.png", &allowed));
        assert!(!has_allowed_extension("notes.txt", &allowed));
        assert!(!has_allowed_extension("no_extension", &allowed));
        assert!(has_allowed_extension("notes.txt", &[]));
    }

    #[test]
    fn test_trigger_json() {
        let trigger: Trigger = serde_json::from_str(r#"{"type":"event","key":"a.jpg"}"#).unwrap();
        assert_eq!(trigger, Trigger::event("a.jpg"));
        assert_eq!(Trigger::poll("drone/").prefix(), "drone/");
    }
}
