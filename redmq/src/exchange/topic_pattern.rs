//! Topic patterns
//!
//! Topics are dot-separated tokens (`order.eu.created`). A binding pattern
//! uses the same tokens plus two wildcards: `*` matches exactly one token
//! and `#` matches zero or more tokens.

use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

const TOKEN: &str = "[a-z0-9_-]+";

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^{}$", TOKEN)).expect("static token pattern is valid"));

/// A compiled binding pattern
#[derive(Debug, Clone)]
pub struct TopicPattern {
    pattern: String,
    matcher: Regex,
}

impl TopicPattern {
    /// Validate and compile a pattern
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return Err(Error::InvalidTopic("pattern cannot be empty".into()));
        }

        let tokens: Vec<&str> = pattern.split('.').collect();
        for (i, token) in tokens.iter().enumerate() {
            match *token {
                "*" => {}
                "#" if i > 0 && tokens[i - 1] == "#" => {
                    return Err(Error::InvalidTopic(format!(
                        "'{}' repeats the # wildcard",
                        pattern
                    )))
                }
                "#" => {}
                literal if TOKEN_RE.is_match(literal) => {}
                _ => {
                    return Err(Error::InvalidTopic(format!(
                        "'{}' has an invalid token '{}'",
                        pattern, token
                    )))
                }
            }
        }

        let matcher = Regex::new(&compile(&tokens))
            .map_err(|e| Error::InvalidTopic(format!("'{}': {}", pattern, e)))?;
        Ok(Self { pattern, matcher })
    }

    /// Whether `topic` matches the pattern
    pub fn matches(&self, topic: &str) -> bool {
        self.matcher.is_match(topic)
    }

    /// Normalized pattern text
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Validate and lowercase a published topic
    ///
    /// Topics carry no wildcards.
    pub fn normalize_topic(topic: &str) -> Result<String> {
        let topic = topic.trim().to_lowercase();
        if topic.is_empty() || !topic.split('.').all(|t| TOKEN_RE.is_match(t)) {
            return Err(Error::InvalidTopic(format!("invalid topic '{}'", topic)));
        }
        Ok(topic)
    }

    /// Check that `topic` is a valid published topic
    pub fn validate_topic(topic: &str) -> Result<()> {
        Self::normalize_topic(topic).map(|_| ())
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

impl PartialEq for TopicPattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for TopicPattern {}

fn compile(tokens: &[&str]) -> String {
    let mut re = String::from("^");
    let leading_hash = tokens.first() == Some(&"#");

    for (i, token) in tokens.iter().enumerate() {
        if *token == "#" {
            if tokens.len() == 1 {
                re.push_str(&format!("{t}(?:\\.{t})*", t = TOKEN));
            } else if i == 0 {
                // absorbs its own trailing dot
                re.push_str(&format!("(?:{}\\.)*", TOKEN));
            } else {
                re.push_str(&format!("(?:\\.{})*", TOKEN));
            }
            continue;
        }

        if i > 0 && !(i == 1 && leading_hash) {
            re.push_str("\\.");
        }
        if *token == "*" {
            re.push_str(TOKEN);
        } else {
            re.push_str(&regex::escape(token));
        }
    }

    re.push('$');
    re
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, topic: &str) -> bool {
        TopicPattern::parse(pattern).unwrap().matches(topic)
    }

    #[test]
    fn test_literal() {
        assert!(matches("order.created", "order.created"));
        assert!(!matches("order.created", "order.created.eu"));
        assert!(!matches("order.created", "order"));
    }

    #[test]
    fn test_star_matches_one_token() {
        assert!(matches("order.*", "order.created"));
        assert!(!matches("order.*", "order"));
        assert!(!matches("order.*", "order.created.eu"));
        assert!(matches("*.created", "invoice.created"));
    }

    #[test]
    fn test_hash_matches_zero_or_more_tokens() {
        assert!(matches("order.#", "order"));
        assert!(matches("order.#", "order.created.eu"));
        assert!(matches("#.created", "created"));
        assert!(matches("#.created", "order.eu.created"));
        assert!(matches("order.#.done", "order.done"));
        assert!(matches("order.#.done", "order.a.b.done"));
        assert!(!matches("order.#.done", "order.a.b"));
        assert!(matches("#", "anything.at.all"));
    }

    #[test]
    fn test_dots_are_literal() {
        assert!(!matches("order.created", "orderxcreated"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("order..created").is_err());
        assert!(TopicPattern::parse("order.#.#").is_err());
        assert!(TopicPattern::parse("order.cre*ted").is_err());
        assert!(TopicPattern::parse("order:created").is_err());
    }

    #[test]
    fn test_normalize_topic() {
        assert_eq!(TopicPattern::normalize_topic("Order.Created").unwrap(), "order.created");
        assert!(TopicPattern::normalize_topic("order.*").is_err());
        assert!(TopicPattern::normalize_topic("order.").is_err());
    }
}
