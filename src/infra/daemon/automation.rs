// src/infra/daemon/automation.rs — JSON automation file (rules and tasks)
//
// Each entry is parsed on its own so one malformed rule does not reject the
// rest of the file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use crate::core::actions::NewActionRule;
use crate::core::guard::GuardRule;
use crate::core::scheduler::NewTask;

#[derive(Debug, Default)]
pub struct Automation {
    pub guard_rules: Vec<GuardRule>,
    pub action_rules: Vec<NewActionRule>,
    pub tasks: Vec<NewTask>,
    /// Entries that failed to parse.
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct InstallSummary {
    pub guard_rules: usize,
    pub action_rules: usize,
    pub tasks: usize,
    pub errors: Vec<String>,
}

pub fn load_automation(path: &Path) -> anyhow::Result<Automation> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
    parse_automation(&content)
}

pub fn parse_automation(json: &str) -> anyhow::Result<Automation> {
    let root: serde_json::Value = serde_json::from_str(json)?;
    let Some(root) = root.as_object() else {
        anyhow::bail!("automation file must be a JSON object");
    };

    let mut errors = Vec::new();
    let guard_rules = entries(root.get("guard_rules"), "guard rule", &mut errors);
    let action_rules = entries(root.get("action_rules"), "action rule", &mut errors);
    let tasks = entries(root.get("tasks"), "task", &mut errors);
    Ok(Automation {
        guard_rules,
        action_rules,
        tasks,
        errors,
    })
}

fn entries<T: DeserializeOwned>(
    section: Option<&serde_json::Value>,
    what: &str,
    errors: &mut Vec<String>,
) -> Vec<T> {
    let Some(items) = section.and_then(|s| s.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| match serde_json::from_value(item.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                errors.push(format!("{what} #{i}: {e}"));
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::actions::TriggerType;

    #[test]
    fn test_bad_entries_collected() {
        let a = parse_automation(
            r#"{
                "guard_rules": [
                    {"id": "r1", "user_id": "u1", "action": "block",
                     "conditions": [{"field": "model", "operator": "eq", "value": "o1"}]}
                ],
                "action_rules": [
                    {"name": "ok", "trigger": "anomaly_detected", "actions": [{"type": "reset_spend"}]},
                    {"name": "bad", "trigger": "solar_flare", "actions": [{"type": "reset_spend"}]},
                    {"name": "worse", "trigger": "manual", "actions": [{"type": "launch"}]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(a.guard_rules.len(), 1);
        assert_eq!(a.action_rules.len(), 1);
        assert_eq!(a.action_rules[0].trigger, TriggerType::AnomalyDetected);
        assert_eq!(a.errors.len(), 2);
        assert!(a.errors[0].starts_with("action rule #1"));
        assert!(a.tasks.is_empty());
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(parse_automation("[]").is_err());
        assert!(parse_automation("not json").is_err());
    }
}
