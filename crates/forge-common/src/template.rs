//! Phase template supplied by the surrounding template system.

use serde::{Deserialize, Serialize};

/// Version tag carried in `schema` of a phase template document.
pub const PHASE_TEMPLATE_SCHEMA: &str = "forge-phases-v1";

/// Ordered list of phases every task goes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTemplate {
    pub schema: String,
    pub phases: Vec<TemplatePhase>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplatePhase {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(rename = "iconId", default, skip_serializing_if = "Option::is_none")]
    pub icon_id: Option<String>,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub checks: Vec<PhaseCheck>,
}

/// A post-phase check: either a bare shell command or a described command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseCheck {
    Command(String),
    Described {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default)]
        command: String,
        #[serde(rename = "timeoutSec", default, skip_serializing_if = "Option::is_none")]
        timeout_sec: Option<u64>,
    },
}

impl PhaseTemplate {
    pub fn phase(&self, id: &str) -> Option<&TemplatePhase> {
        self.phases.iter().find(|phase| phase.id == id)
    }

    pub fn phase_ids(&self) -> Vec<&str> {
        self.phases.iter().map(|phase| phase.id.as_str()).collect()
    }
}

impl TemplatePhase {
    /// Display title, falling back to the id.
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_template_with_mixed_checks() {
        let raw = r#"{
            "schema": "forge-phases-v1",
            "phases": [{
                "id": "implementation",
                "title": "Implementation",
                "order": 1,
                "iconId": "hammer",
                "goal": "Make it work",
                "description": "Write the code",
                "checks": [
                    "cargo test",
                    {"id": "lint", "command": "cargo clippy", "timeoutSec": 30}
                ]
            }]
        }"#;

        let template: PhaseTemplate = serde_json::from_str(raw).unwrap();
        assert_eq!(template.schema, PHASE_TEMPLATE_SCHEMA);
        let phase = template.phase("implementation").unwrap();
        assert_eq!(phase.icon_id.as_deref(), Some("hammer"));
        assert_eq!(phase.checks.len(), 2);
        assert_eq!(phase.checks[0], PhaseCheck::Command("cargo test".to_string()));
        match &phase.checks[1] {
            PhaseCheck::Described {
                id, timeout_sec, ..
            } => {
                assert_eq!(id.as_deref(), Some("lint"));
                assert_eq!(*timeout_sec, Some(30));
            }
            other => panic!("unexpected check {:?}", other),
        }
    }

    #[test]
    fn test_display_title_falls_back_to_id() {
        let phase = TemplatePhase {
            id: "review".to_string(),
            title: " ".to_string(),
            order: None,
            icon_id: None,
            goal: String::new(),
            description: String::new(),
            checks: vec![],
        };
        assert_eq!(phase.display_title(), "review");
    }
}
