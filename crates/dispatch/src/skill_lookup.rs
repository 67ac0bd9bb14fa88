//! The `get_skill` handler — progressive disclosure over the skill registry.
//!
//! The orchestrator LLM starts with no knowledge of the installed skills and
//! drills down: domains → domain index → one definition. Unknown names come
//! back as structured "not found" payloads with suggestions, never an error.

use serde_json::{Value, json};

use hivemind_core::skill::SkillRegistry;

use crate::protocol::GetSkillArgs;

/// Handle one `get_skill` call. Always returns a JSON payload suitable for
/// a tool result; lookup failures are data, not errors.
pub fn get_skill(registry: &dyn SkillRegistry, args: &GetSkillArgs) -> Value {
    if let Some(query) = args.search.as_deref() {
        return search(registry, query);
    }

    match (args.domain.as_deref(), args.skill.as_deref()) {
        (None, None) => list_domains(registry),
        (Some(domain), None) => domain_index(registry, domain),
        (domain, Some(skill)) => lookup_skill(registry, domain, skill),
    }
}

fn list_domains(registry: &dyn SkillRegistry) -> Value {
    let domains: Vec<Value> = registry
        .domains()
        .into_iter()
        .map(|d| {
            let count = registry.skills_in(&d).len();
            json!({ "domain": d, "skills": count })
        })
        .collect();
    json!({ "domains": domains })
}

fn domain_index(registry: &dyn SkillRegistry, domain: &str) -> Value {
    let skills = registry.skills_in(domain);
    if skills.is_empty() {
        return not_found(
            format!("Unknown domain: {domain}"),
            domain_suggestions(registry, domain),
        );
    }
    let index: Vec<Value> = skills
        .iter()
        .map(|s| json!({ "name": s.qualified_name(), "description": s.description }))
        .collect();
    json!({ "domain": domain, "skills": index })
}

fn lookup_skill(registry: &dyn SkillRegistry, domain: Option<&str>, skill: &str) -> Value {
    // Accept both get_skill(skill="email.send") and
    // get_skill(domain="email", skill="send").
    let (domain, name) = match (domain, skill.split_once('.')) {
        (_, Some((d, n))) => (d, n),
        (Some(d), None) => (d, skill),
        (None, None) => {
            return not_found(
                format!("Skill '{skill}' needs a domain: use 'domain.skill'"),
                vec![],
            );
        }
    };

    if name == "all" {
        let skills = registry.skills_in(domain);
        if skills.is_empty() {
            return not_found(
                format!("Unknown domain: {domain}"),
                domain_suggestions(registry, domain),
            );
        }
        return json!({ "domain": domain, "skills": skills });
    }

    match registry.get(domain, name) {
        Some(def) => json!({ "skill": def }),
        None => {
            let mut suggestions = skill_suggestions(registry, domain, name);
            if suggestions.is_empty() {
                suggestions = domain_suggestions(registry, domain);
            }
            not_found(format!("Unknown skill: {domain}.{name}"), suggestions)
        }
    }
}

fn search(registry: &dyn SkillRegistry, query: &str) -> Value {
    let results = registry.search(query);
    if results.is_empty() {
        return json!({
            "search": query,
            "matches": [],
            "hint": "No matches. Call get_skill with no arguments to list all domains."
        });
    }
    let matches: Vec<Value> = results
        .iter()
        .map(|s| json!({ "name": s.qualified_name(), "description": s.description }))
        .collect();
    json!({ "search": query, "matches": matches })
}

fn not_found(message: String, suggestions: Vec<String>) -> Value {
    json!({ "error": "not_found", "message": message, "suggestions": suggestions })
}

/// Domains sharing a prefix or substring with the unknown name.
fn domain_suggestions(registry: &dyn SkillRegistry, unknown: &str) -> Vec<String> {
    let unknown = unknown.to_lowercase();
    registry
        .domains()
        .into_iter()
        .filter(|d| {
            let d = d.to_lowercase();
            d.contains(&unknown) || unknown.contains(&d)
        })
        .collect()
}

/// Skills in the same domain sharing a prefix or substring with the unknown
/// name.
fn skill_suggestions(registry: &dyn SkillRegistry, domain: &str, unknown: &str) -> Vec<String> {
    let unknown = unknown.to_lowercase();
    registry
        .skills_in(domain)
        .iter()
        .filter(|s| {
            let name = s.name.to_lowercase();
            name.contains(&unknown) || unknown.contains(&name)
        })
        .map(|s| s.qualified_name())
        .collect()
}
