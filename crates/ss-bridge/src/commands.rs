use serde::{Deserialize, Serialize};

/// Which repository an ad-hoc analysis request points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnalyzeTarget {
    ById { repo_id: String },
    ByName { owner: String, name: String },
}

/// Control commands the facade hands to the daemon. Status queries never
/// go through here; handlers read the store directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// Initialize the scheduler: seed the next tick and run a first cycle.
    Init,
    /// Manually triggered limited discovery scan.
    Scan { force: bool },
    /// Full discovery + planning pass.
    ComprehensiveScan { force: bool, min_repos: Option<u32> },
    /// Ad-hoc analysis of one repository.
    Analyze { target: AnalyzeTarget, force: bool },
    /// Start a named batch over explicit repositories.
    StartBatch {
        batch_id: String,
        repositories: Vec<String>,
    },
    /// Stop the currently running batch. Idempotent.
    StopBatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_target_parses_both_shapes() {
        let by_id: AnalyzeTarget = serde_json::from_str(r#"{"repo_id": "42"}"#).unwrap();
        assert_eq!(by_id, AnalyzeTarget::ById { repo_id: "42".into() });

        let by_name: AnalyzeTarget =
            serde_json::from_str(r#"{"owner": "acme", "name": "proj"}"#).unwrap();
        assert_eq!(
            by_name,
            AnalyzeTarget::ByName {
                owner: "acme".into(),
                name: "proj".into()
            }
        );

        assert!(serde_json::from_str::<AnalyzeTarget>(r#"{"other": 1}"#).is_err());
    }
}
