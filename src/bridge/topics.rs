//! Topic layout of the bridge.
//!
//! | mode        | broker -> device       | device -> broker        |
//! |-------------|------------------------|-------------------------|
//! | multiplexed | `<root>/<channel>/in`  | `<root>/<channel>/out`  |
//! | single      | `<root>/in`            | `<root>/out`            |
//!
//! `<root>/available` carries the retained presence of the bridge.

use thiserror::Error;

use crate::protocol::FrameMode;

/// An inbound topic that does not follow the layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed topic '{topic}'")]
pub struct MalformedTopic {
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    root: String,
    mode: FrameMode,
}

impl TopicScheme {
    pub fn new(root: impl Into<String>, mode: FrameMode) -> Self {
        TopicScheme {
            root: root.into(),
            mode,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Filter matching every topic the device listens to.
    pub fn inbound_filter(&self) -> String {
        match self.mode {
            FrameMode::Multiplexed => format!("{}/+/in", self.root),
            FrameMode::Single => format!("{}/in", self.root),
        }
    }

    /// Topic on which frames of `channel_id` are published.
    pub fn outbound(&self, channel_id: Option<u16>) -> String {
        match channel_id {
            Some(id) => format!("{}/{}/out", self.root, id),
            None => format!("{}/out", self.root),
        }
    }

    pub fn availability(&self) -> String {
        format!("{}/available", self.root)
    }

    /// Channel addressed by an inbound topic; `None` in single mode.
    pub fn parse_inbound(&self, topic: &str) -> Result<Option<u16>, MalformedTopic> {
        let malformed = || MalformedTopic {
            topic: topic.into(),
        };
        let rest = topic
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(malformed)?;

        match self.mode {
            FrameMode::Multiplexed => {
                let channel = rest.strip_suffix("/in").ok_or_else(malformed)?;
                // Plain decimal only: no sign, no blanks
                if channel.is_empty() || !channel.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed());
                }
                channel.parse::<u16>().map(Some).map_err(|_| malformed())
            }
            FrameMode::Single if rest == "in" => Ok(None),
            FrameMode::Single => Err(malformed()),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
