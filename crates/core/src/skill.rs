//! Skill collaborator contracts.
//!
//! The core never inspects skill internals. It sees two things: a read-only
//! registry (what skills exist, grouped by domain) and an executor
//! (run one skill with JSON params). Concrete skills — email, calendar,
//! files — live outside this workspace.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SkillError;
use crate::message::ConversationId;

/// A skill definition, as surfaced to the orchestrator LLM via `get_skill`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDefinition {
    /// Skill name within its domain (e.g., "send")
    pub name: String,

    /// Domain grouping (e.g., "email")
    pub domain: String,

    /// Description of what the skill does
    pub description: String,

    /// Free-form tags used by keyword search
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// JSON Schema describing the skill's parameters
    pub parameters: serde_json::Value,
}

impl SkillDefinition {
    /// The fully-qualified `domain.skill` name used in scopes and tool calls.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.domain, self.name)
    }
}

/// The result of a skill execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillResult {
    /// Whether the skill executed successfully
    pub success: bool,

    /// The output content, fed back to the LLM as a tool result
    pub content: String,

    /// Optional structured metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SkillResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Who is asking for a skill execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// The owning conversation
    pub conversation_id: ConversationId,

    /// Set when a sub-agent (rather than the engine) is executing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Executes skills by qualified name. At-least-once semantics: the caller
/// assumes skills are idempotent.
#[async_trait]
pub trait SkillExecutor: Send + Sync {
    async fn execute(
        &self,
        skill: &str,
        params: serde_json::Value,
        context: &ExecutionContext,
    ) -> Result<SkillResult, SkillError>;
}

/// Read-only lookup over the installed skills, consumed by the dispatch
/// protocol. Lookups are synchronous; the registry is expected to be an
/// in-memory index.
pub trait SkillRegistry: Send + Sync {
    /// All known domain names.
    fn domains(&self) -> Vec<String>;

    /// All skills in one domain.
    fn skills_in(&self, domain: &str) -> Vec<SkillDefinition>;

    /// One skill by domain and name.
    fn get(&self, domain: &str, skill: &str) -> Option<SkillDefinition>;

    /// Keyword search across name, description, and tags.
    fn search(&self, query: &str) -> Vec<SkillDefinition>;

    /// Whether a fully-qualified `domain.skill` name exists.
    fn contains(&self, qualified_name: &str) -> bool {
        match qualified_name.split_once('.') {
            Some((domain, skill)) => self.get(domain, skill).is_some(),
            None => false,
        }
    }
}

/// Vec-backed registry. The reference implementation used by tests and by
/// deployments that register their skill index at startup.
#[derive(Default)]
pub struct StaticSkillRegistry {
    skills: Vec<SkillDefinition>,
}

impl StaticSkillRegistry {
    pub fn new(skills: Vec<SkillDefinition>) -> Self {
        Self { skills }
    }

    /// Convenience constructor from `(domain, name, description)` triples.
    pub fn from_triples<'a>(triples: impl IntoIterator<Item = (&'a str, &'a str, &'a str)>) -> Self {
        Self::new(
            triples
                .into_iter()
                .map(|(domain, name, description)| SkillDefinition {
                    name: name.into(),
                    domain: domain.into(),
                    description: description.into(),
                    tags: vec![],
                    parameters: serde_json::json!({ "type": "object", "properties": {} }),
                })
                .collect(),
        )
    }
}

impl SkillRegistry for StaticSkillRegistry {
    fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.skills.iter().map(|s| s.domain.clone()).collect();
        domains.sort();
        domains.dedup();
        domains
    }

    fn skills_in(&self, domain: &str) -> Vec<SkillDefinition> {
        self.skills
            .iter()
            .filter(|s| s.domain == domain)
            .cloned()
            .collect()
    }

    fn get(&self, domain: &str, skill: &str) -> Option<SkillDefinition> {
        self.skills
            .iter()
            .find(|s| s.domain == domain && s.name == skill)
            .cloned()
    }

    fn search(&self, query: &str) -> Vec<SkillDefinition> {
        let query = query.to_lowercase();
        self.skills
            .iter()
            .filter(|s| {
                s.name.to_lowercase().contains(&query)
                    || s.description.to_lowercase().contains(&query)
                    || s.tags.iter().any(|t| t.to_lowercase().contains(&query))
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StaticSkillRegistry {
        StaticSkillRegistry::from_triples([
            ("email", "send", "Send an email"),
            ("email", "read", "Read recent emails"),
            ("calendar", "list", "List calendar events"),
        ])
    }

    #[test]
    fn qualified_name_joins_domain_and_skill() {
        let def = registry().get("email", "send").unwrap();
        assert_eq!(def.qualified_name(), "email.send");
    }

    #[test]
    fn contains_parses_qualified_names() {
        let reg = registry();
        assert!(reg.contains("email.send"));
        assert!(!reg.contains("email.delete"));
        assert!(!reg.contains("send"));
    }

    #[test]
    fn domains_are_sorted_and_deduped() {
        assert_eq!(registry().domains(), vec!["calendar", "email"]);
    }

    #[test]
    fn search_matches_descriptions() {
        let results = registry().search("calendar");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].qualified_name(), "calendar.list");
    }

    #[test]
    fn skill_result_constructors() {
        assert!(SkillResult::ok("done").success);
        assert!(!SkillResult::error("boom").success);
    }
}
