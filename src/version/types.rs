use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One immutable version record of a policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub policy_id: String,
    pub version_id: String,
    /// Page-index document this version points at.
    pub document_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Version {
    pub fn new(policy_id: &str, version_id: &str, document_id: &str) -> Self {
        Self {
            policy_id: policy_id.to_string(),
            version_id: version_id.to_string(),
            document_id: document_id.to_string(),
            created_at: Utc::now(),
            created_by: String::new(),
            description: String::new(),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn created_by(mut self, who: &str) -> Self {
        self.created_by = who.to_string();
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.description = text.to_string();
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }
}
