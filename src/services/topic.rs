use rand_core::{OsRng, RngCore};

use crate::config::{MessengerConfig, TOPIC_PLACEHOLDER};
use crate::error::{MessengerError, Result};

/// Any hint containing this marker gets a fresh random subtopic.
pub const EPHEMERAL_MARKER: &str = "random";

const TOPIC_SEPARATOR: char = '/';

pub fn random_hex_string(byte_len: usize) -> String {
    let mut raw = vec![0u8; byte_len];
    OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

fn fill_template(template: &str, subtopic: &str) -> String {
    template.replacen(TOPIC_PLACEHOLDER, subtopic, 1)
}

/// Maps a topic hint onto a concrete network topic.
///
/// Precedence is fixed: empty hint, then ephemeral marker, then relative
/// name, then fully-qualified path used verbatim. A fully-qualified hint
/// that contains the marker is still treated as ephemeral.
pub fn resolve_topic(
    hint: &str,
    template: &str,
    default_subtopic: &str,
    ephemeral_bytes: usize,
) -> String {
    if hint.is_empty() {
        fill_template(template, default_subtopic)
    } else if hint.contains(EPHEMERAL_MARKER) {
        fill_template(template, &random_hex_string(ephemeral_bytes))
    } else if !hint.starts_with(TOPIC_SEPARATOR) {
        fill_template(template, hint)
    } else {
        hint.to_string()
    }
}

/// Resolver bound to the messenger configuration. Missing template
/// settings surface as configuration errors instead of malformed topics.
#[derive(Debug, Clone)]
pub struct TopicResolver {
    template: Option<String>,
    default_subtopic: Option<String>,
    ephemeral_bytes: usize,
}

impl TopicResolver {
    pub fn new(config: &MessengerConfig) -> Self {
        Self {
            template: config.content_topic.clone().filter(|t| !t.is_empty()),
            default_subtopic: config.topic.clone().filter(|t| !t.is_empty()),
            ephemeral_bytes: config.ephemeral_bytes,
        }
    }

    pub fn default_topic(&self) -> Result<String> {
        self.resolve("")
    }

    pub fn resolve(&self, hint: &str) -> Result<String> {
        let fully_qualified =
            hint.starts_with(TOPIC_SEPARATOR) && !hint.contains(EPHEMERAL_MARKER);
        if fully_qualified {
            return Ok(hint.to_string());
        }
        let template = self.template.as_deref().ok_or_else(|| {
            MessengerError::Config("content topic template is not configured".to_string())
        })?;
        let default_subtopic = match (hint.is_empty(), self.default_subtopic.as_deref()) {
            (true, None) => {
                return Err(MessengerError::Config(
                    "subscription not configured: default topic is missing".to_string(),
                ))
            }
            (_, subtopic) => subtopic.unwrap_or_default(),
        };
        Ok(resolve_topic(
            hint,
            template,
            default_subtopic,
            self.ephemeral_bytes,
        ))
    }
}
