//! MQTT topic filters and their matching rules.
//!
//! * `+` matches exactly one topic level (possibly empty),
//! * `#` matches the remaining levels, including none (`a/#` matches `a`),
//!   and must be the last level of the filter,
//! * wildcards must occupy a whole level.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("empty topic filter")]
    Empty,
    #[error("`#` must be the last level of the filter `{0}`")]
    MisplacedMultiLevel(String),
    #[error("wildcards must occupy a whole level in `{0}`")]
    PartialWildcard(String),
}

/// A topic filter compiled for matching.
#[derive(Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pattern: String,
    levels: Vec<Level>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    /// `+`
    Single,
    /// `#`
    Multi,
}

impl TopicFilter {
    pub fn new(pattern: &str) -> Result<Self, TopicError> {
        if pattern.is_empty() {
            return Err(TopicError::Empty);
        }
        let count = pattern.split('/').count();
        let levels = pattern
            .split('/')
            .enumerate()
            .map(|(i, level)| match level {
                "#" if i + 1 == count => Ok(Level::Multi),
                "#" => Err(TopicError::MisplacedMultiLevel(pattern.into())),
                "+" => Ok(Level::Single),
                l if l.contains(|c| c == '+' || c == '#') => {
                    Err(TopicError::PartialWildcard(pattern.into()))
                }
                l => Ok(Level::Literal(l.into())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TopicFilter {
            pattern: pattern.into(),
            levels,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn has_wildcards(&self) -> bool {
        self.levels.iter().any(|l| !matches!(l, Level::Literal(_)))
    }

    /// Check a concrete topic (no wildcards) against the filter.
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Multi => return true,
                Level::Single => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Level::Literal(expected) => match levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }
        levels.next().is_none()
    }
}

impl fmt::Debug for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TopicFilter").field(&self.pattern).finish()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, topic: &str) -> bool {
        TopicFilter::new(pattern).unwrap().matches(topic)
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(matches("a/#", "a/b/c"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(matches("#", "a/b/c"));
        assert!(matches("#", "a"));
    }

    #[test]
    fn literal_matching() {
        assert!(matches("root/in", "root/in"));
        assert!(!matches("root/in", "root/out"));
        assert!(!matches("root/in", "root/in/x"));
        assert!(!matches("root/in/x", "root/in"));
    }

    #[test]
    fn multi_level_matches_parent() {
        assert!(matches("a/#", "a"));
        assert!(!matches("a/#", "b"));
    }

    #[test]
    fn single_level_needs_a_level() {
        assert!(matches("root/+/in", "root/12/in"));
        assert!(!matches("root/+/in", "root/in"));
        assert!(matches("+", ""));
    }

    #[test]
    fn invalid_filters() {
        assert_eq!(TopicFilter::new(""), Err(TopicError::Empty));
        assert!(matches!(
            TopicFilter::new("a/#/c"),
            Err(TopicError::MisplacedMultiLevel(_))
        ));
        assert!(matches!(
            TopicFilter::new("a/b+"),
            Err(TopicError::PartialWildcard(_))
        ));
    }

    #[test]
    fn wildcard_detection() {
        assert!(TopicFilter::new("a/+/in").unwrap().has_wildcards());
        assert!(!TopicFilter::new("a/in").unwrap().has_wildcards());
    }
}
