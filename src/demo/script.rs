use std::{collections::HashSet, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConsoleError;

const DEFAULT_GRACE_MS: u64 = 1500;

/// Side-effect a step asks the host to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum DemoAction {
    SelectPnr { pnr: String },
    RunEvaluation,
    SetHumanReview { enabled: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DemoStepKind {
    /// Narration only.
    #[default]
    Narrate,
    Highlight {
        target: String,
        #[serde(default)]
        scroll: bool,
    },
    Act {
        action: DemoAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Hold until the agent run finishes, then wait `grace_ms` more.
    WaitExternal {
        #[serde(default = "default_grace_ms")]
        grace_ms: u64,
    },
}

fn default_grace_ms() -> u64 {
    DEFAULT_GRACE_MS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoStep {
    pub id: String,
    pub narration: String,
    #[serde(default)]
    pub kind: DemoStepKind,
    #[serde(default)]
    pub delay_before_ms: u64,
}

impl DemoStep {
    pub fn narrate(id: impl Into<String>, narration: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            narration: narration.into(),
            kind: DemoStepKind::Narrate,
            delay_before_ms: 0,
        }
    }

    pub fn highlight(id: impl Into<String>, target: impl Into<String>, narration: impl Into<String>) -> Self {
        Self {
            kind: DemoStepKind::Highlight {
                target: target.into(),
                scroll: true,
            },
            ..Self::narrate(id, narration)
        }
    }

    pub fn act(id: impl Into<String>, action: DemoAction, narration: impl Into<String>) -> Self {
        Self {
            kind: DemoStepKind::Act {
                action,
                target: None,
            },
            ..Self::narrate(id, narration)
        }
    }

    pub fn wait_external(id: impl Into<String>, narration: impl Into<String>) -> Self {
        Self {
            kind: DemoStepKind::WaitExternal {
                grace_ms: DEFAULT_GRACE_MS,
            },
            ..Self::narrate(id, narration)
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        let new_target = target.into();
        match &mut self.kind {
            DemoStepKind::Act { target, .. } => *target = Some(new_target),
            DemoStepKind::Highlight { target, .. } => *target = new_target,
            _ => {}
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_before_ms = delay.as_millis() as u64;
        self
    }

    pub fn delay_before(&self) -> Duration {
        Duration::from_millis(self.delay_before_ms)
    }

    pub fn word_count(&self) -> usize {
        self.narration.split_whitespace().count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoScript {
    pub steps: Vec<DemoStep>,
}

impl DemoScript {
    pub fn new(steps: Vec<DemoStep>) -> Result<Self, ConsoleError> {
        let script = Self { steps };
        script.validate()?;
        Ok(script)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConsoleError> {
        let script: Self = serde_yaml::from_str(content)?;
        script.validate()?;
        Ok(script)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConsoleError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConsoleError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn validate(&self) -> Result<(), ConsoleError> {
        if self.steps.is_empty() {
            return Err(ConsoleError::InvalidConfig("demo script has no steps".into()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(ConsoleError::InvalidConfig(format!(
                    "duplicate demo step id `{}`",
                    step.id
                )));
            }
        }
        Ok(())
    }

    /// The stock walkthrough: one straight offer, then the same record with
    /// human review switched on.
    pub fn default_script() -> Self {
        Self {
            steps: vec![
                DemoStep::narrate(
                    "intro",
                    "This console shows how the tailored offers agent decides whether to send a passenger an upgrade offer.",
                ),
                DemoStep::highlight(
                    "pnr-list",
                    "pnr-list",
                    "Each row is a reservation the agent can evaluate.",
                ),
                DemoStep::act(
                    "select-pnr",
                    DemoAction::SelectPnr {
                        pnr: "ABC123".into(),
                    },
                    "We will start with a Gold member flying to Chicago next week.",
                )
                .with_target("pnr-ABC123"),
                DemoStep::highlight(
                    "customer-card",
                    "customer-card",
                    "The customer card merges loyalty history, the flight, and the model scores.",
                ),
                DemoStep::act(
                    "run-evaluation",
                    DemoAction::RunEvaluation,
                    "Now we ask the agent for a decision.",
                )
                .with_target("run-button"),
                DemoStep::wait_external(
                    "await-decision",
                    "The planner lists the checks, workers run them, and the solver combines the results.",
                ),
                DemoStep::highlight(
                    "planner-panel",
                    "planner-panel",
                    "The plan breaks the decision into eligibility, inventory, and price sensitivity checks.",
                ),
                DemoStep::highlight(
                    "worker-panel",
                    "worker-panel",
                    "Every worker result carries its own recommendation.",
                ),
                DemoStep::highlight(
                    "decision-card",
                    "decision-card",
                    "The solver picked a business upgrade, with its price, channel, and expected value.",
                ),
                DemoStep::act(
                    "enable-review",
                    DemoAction::SetHumanReview { enabled: true },
                    "For high value offers we can require a human to sign off.",
                )
                .with_target("review-toggle"),
                DemoStep::act(
                    "rerun-evaluation",
                    DemoAction::RunEvaluation,
                    "Running the same reservation again.",
                ),
                DemoStep::wait_external(
                    "await-review",
                    "This time the decision stops short of the customer.",
                ),
                DemoStep::highlight(
                    "approval-card",
                    "approval-card",
                    "A reviewer can approve it as proposed or reject it outright.",
                ),
                DemoStep::narrate(
                    "outro",
                    "That is the whole loop: plan, execute, synthesize, and a human where it matters.",
                ),
            ],
        }
    }
}

impl Default for DemoScript {
    fn default() -> Self {
        Self::default_script()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_script_is_valid() {
        let script = DemoScript::default_script();
        script.validate().expect("stock script should validate");
        assert!(script
            .steps
            .iter()
            .any(|step| matches!(step.kind, DemoStepKind::WaitExternal { .. })));
    }

    #[test]
    fn yaml_uses_tagged_kinds() {
        let script = DemoScript::from_yaml_str(
            r#"
steps:
  - id: hello
    narration: Welcome aboard.
  - id: pick
    narration: Choosing a record.
    kind:
      type: act
      action:
        name: select_pnr
        pnr: XYZ789
      target: pnr-XYZ789
  - id: wait
    narration: Waiting for the agent.
    kind:
      type: wait_external
    delay_before_ms: 250
"#,
        )
        .expect("script should parse");

        assert_eq!(script.steps[0].kind, DemoStepKind::Narrate);
        assert_eq!(
            script.steps[1].kind,
            DemoStepKind::Act {
                action: DemoAction::SelectPnr {
                    pnr: "XYZ789".into()
                },
                target: Some("pnr-XYZ789".into()),
            }
        );
        assert_eq!(
            script.steps[2].kind,
            DemoStepKind::WaitExternal { grace_ms: 1500 }
        );
        assert_eq!(script.steps[2].delay_before(), Duration::from_millis(250));
    }

    #[test]
    fn default_script_survives_yaml() {
        let script = DemoScript::default_script();
        let yaml = script.to_yaml_string().unwrap();
        assert_eq!(DemoScript::from_yaml_str(&yaml).unwrap(), script);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let error = DemoScript::new(vec![
            DemoStep::narrate("a", "one"),
            DemoStep::narrate("a", "two"),
        ])
        .unwrap_err();
        assert!(matches!(error, ConsoleError::InvalidConfig(_)));
    }
}
