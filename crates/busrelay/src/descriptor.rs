// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic payload descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the payload schema of a topic.
///
/// Produced by the local bus's type system and carried verbatim through the
/// control channel. The relay never interprets payload bytes; two
/// descriptors describe the same wire format when their `schema_hash`
/// values match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageDescriptor {
    topic: String,
    schema_hash: String,
    type_name: String,
    schema_def: String,
}

impl MessageDescriptor {
    pub fn new(
        topic: impl Into<String>,
        schema_hash: impl Into<String>,
        type_name: impl Into<String>,
        schema_def: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            schema_hash: schema_hash.into(),
            type_name: type_name.into(),
            schema_def: schema_def.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn schema_hash(&self) -> &str {
        &self.schema_hash
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn schema_def(&self) -> &str {
        &self.schema_def
    }

    /// Same schema identifier, regardless of topic or definition text.
    pub fn is_compatible(&self, other: &MessageDescriptor) -> bool {
        self.schema_hash == other.schema_hash
    }

    /// Same schema, bound to another topic.
    pub fn for_topic(&self, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for MessageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} {}]", self.topic, self.type_name, self.schema_hash)
    }
}
