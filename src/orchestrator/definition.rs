//! Orchestration definitions and their validation
//!
//! Definitions are authored elsewhere and may be loaded from YAML templates.
//! The engine only reads them and never mutates them.

use crate::error::{Error, Result};
use crate::orchestrator::transform::InputTransform;
use crate::types::DefinitionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Maximum number of agents in any definition
pub const MAX_AGENTS: usize = 10;
/// Maximum definition name length, in characters
pub const MAX_NAME_CHARS: usize = 100;
/// Maximum description length, in characters
pub const MAX_DESCRIPTION_CHARS: usize = 500;
/// Maximum consensus question length, in characters
pub const MAX_QUESTION_CHARS: usize = 500;
/// Accepted consensus threshold range
pub const THRESHOLD_RANGE: std::ops::RangeInclusive<f64> = 0.5..=1.0;

fn default_consensus_threshold() -> f64 {
    0.66
}

fn default_invocation() -> String {
    "default".to_string()
}

fn default_active() -> bool {
    true
}

/// Execution topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    /// Independent concurrent calls
    Parallel,
    /// Sequential, data-dependent calls
    Chain,
    /// Identical question to all agents, scored agreement
    Consensus,
}

impl OrchestrationMode {
    /// Stable lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Chain => "chain",
            Self::Consensus => "consensus",
        }
    }

    /// Smallest agent count this mode accepts
    pub fn min_agents(&self) -> usize {
        match self {
            Self::Consensus => 2,
            Self::Parallel | Self::Chain => 1,
        }
    }
}

impl fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an agent's input comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentInput<'a> {
    /// Fixed text
    Literal(&'a str),
    /// Expression over the previous chain step's result
    Transform(&'a str),
    /// Nothing configured
    Inherit,
}

/// Reference to an agent within a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReference {
    /// Agent identifier understood by the invoker
    pub agent_key: String,
    /// Invocation mode tag, forwarded to the invoker
    #[serde(default = "default_invocation")]
    pub invocation: String,
    /// Literal input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Input-transform expression (chain only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

impl AgentReference {
    /// Reference an agent by key
    pub fn new(agent_key: impl Into<String>) -> Self {
        Self {
            agent_key: agent_key.into(),
            invocation: default_invocation(),
            input: None,
            transform: None,
        }
    }

    /// Set a literal input
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Set an input-transform expression
    pub fn with_transform(mut self, expression: impl Into<String>) -> Self {
        self.transform = Some(expression.into());
        self
    }

    /// Set the invocation mode tag
    pub fn with_invocation(mut self, invocation: impl Into<String>) -> Self {
        self.invocation = invocation.into();
        self
    }

    /// Resolved input source
    pub fn input_source(&self) -> AgentInput<'_> {
        match (&self.input, &self.transform) {
            (_, Some(expression)) => AgentInput::Transform(expression),
            (Some(literal), None) => AgentInput::Literal(literal),
            (None, None) => AgentInput::Inherit,
        }
    }
}

/// A reusable, named orchestration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationDefinition {
    /// Saved definition ID, `None` for ad-hoc definitions
    #[serde(default)]
    pub id: Option<DefinitionId>,
    /// Display name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Topology
    pub mode: OrchestrationMode,
    /// Ordered agent references
    pub agents: Vec<AgentReference>,
    /// Question posed to every agent (consensus only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    /// Minimum agreement to declare consensus (consensus only)
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    /// Input of the first step (chain only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_input: Option<String>,
    /// Inactive definitions cannot be executed
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl OrchestrationDefinition {
    fn new(name: impl Into<String>, mode: OrchestrationMode, agents: Vec<AgentReference>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            mode,
            agents,
            question: None,
            consensus_threshold: default_consensus_threshold(),
            initial_input: None,
            is_active: true,
        }
    }

    /// Create a parallel definition
    pub fn parallel(name: impl Into<String>, agents: Vec<AgentReference>) -> Self {
        Self::new(name, OrchestrationMode::Parallel, agents)
    }

    /// Create a chain definition
    pub fn chain(
        name: impl Into<String>,
        initial_input: impl Into<String>,
        agents: Vec<AgentReference>,
    ) -> Self {
        let mut definition = Self::new(name, OrchestrationMode::Chain, agents);
        definition.initial_input = Some(initial_input.into());
        definition
    }

    /// Create a consensus definition
    pub fn consensus(
        name: impl Into<String>,
        question: impl Into<String>,
        threshold: f64,
        agents: Vec<AgentReference>,
    ) -> Self {
        let mut definition = Self::new(name, OrchestrationMode::Consensus, agents);
        definition.question = Some(question.into());
        definition.consensus_threshold = threshold;
        definition
    }

    /// Set the saved definition ID
    pub fn with_id(mut self, id: DefinitionId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the definition active or inactive
    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    /// Load a definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("Failed to parse definition YAML: {}", e)))
    }

    /// Load a definition from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Check every structural invariant required for execution
    pub fn validate(&self) -> Result<()> {
        if !self.is_active {
            return Err(Error::validation(format!(
                "definition '{}' is inactive",
                self.name
            )));
        }

        if self.name.trim().is_empty() {
            return Err(Error::validation("name must not be empty"));
        }
        check_length("name", &self.name, MAX_NAME_CHARS)?;
        check_length("description", &self.description, MAX_DESCRIPTION_CHARS)?;

        let count = self.agents.len();
        let min = self.mode.min_agents();
        if !(min..=MAX_AGENTS).contains(&count) {
            return Err(Error::validation(format!(
                "{} mode requires between {} and {} agents, got {}",
                self.mode, min, MAX_AGENTS, count
            )));
        }

        for (index, agent) in self.agents.iter().enumerate() {
            self.validate_agent(index, agent)?;
        }

        match self.mode {
            OrchestrationMode::Consensus => {
                let question = self
                    .question
                    .as_deref()
                    .filter(|q| !q.trim().is_empty())
                    .ok_or_else(|| Error::validation("consensus mode requires a question"))?;
                check_length("question", question, MAX_QUESTION_CHARS)?;

                if !THRESHOLD_RANGE.contains(&self.consensus_threshold) {
                    return Err(Error::validation(format!(
                        "consensus threshold must be within [0.5, 1.0], got {}",
                        self.consensus_threshold
                    )));
                }
            }
            OrchestrationMode::Chain => {
                if self.initial_input.is_none() {
                    return Err(Error::validation("chain mode requires an initial input"));
                }
            }
            OrchestrationMode::Parallel => {}
        }

        Ok(())
    }

    fn validate_agent(&self, index: usize, agent: &AgentReference) -> Result<()> {
        if agent.agent_key.trim().is_empty() {
            return Err(Error::validation(format!(
                "agent at position {} has an empty key",
                index
            )));
        }

        if agent.input.is_some() && agent.transform.is_some() {
            return Err(Error::validation(format!(
                "agent '{}' sets both a literal input and a transform",
                agent.agent_key
            )));
        }

        if let Some(expression) = &agent.transform {
            if self.mode != OrchestrationMode::Chain {
                return Err(Error::validation(format!(
                    "agent '{}' uses an input transform, which only chain mode supports",
                    agent.agent_key
                )));
            }
            InputTransform::parse(expression).map_err(|e| {
                Error::validation(format!(
                    "agent '{}' has an invalid transform: {}",
                    agent.agent_key, e
                ))
            })?;
        }

        if self.mode == OrchestrationMode::Chain
            && index == 0
            && (agent.input.is_some() || agent.transform.is_some())
        {
            return Err(Error::validation(format!(
                "agent '{}' is the first chain step and always receives the initial input",
                agent.agent_key
            )));
        }

        Ok(())
    }
}

fn check_length(field: &str, value: &str, max: usize) -> Result<()> {
    let chars = value.chars().count();
    if chars > max {
        return Err(Error::validation(format!(
            "{} must be at most {} characters, got {}",
            field, max, chars
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents(n: usize) -> Vec<AgentReference> {
        (0..n)
            .map(|i| AgentReference::new(format!("agent-{}", i)).with_input("hi"))
            .collect()
    }

    fn assert_invalid(definition: &OrchestrationDefinition, needle: &str) {
        match definition.validate() {
            Err(Error::Validation(msg)) => assert!(msg.contains(needle), "unexpected message: {}", msg),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_count_bounds() {
        assert!(OrchestrationDefinition::parallel("p", agents(1)).validate().is_ok());
        assert!(OrchestrationDefinition::parallel("p", agents(10)).validate().is_ok());
        assert_invalid(&OrchestrationDefinition::parallel("p", agents(0)), "between 1 and 10");
        assert_invalid(&OrchestrationDefinition::parallel("p", agents(11)), "got 11");

        assert_invalid(
            &OrchestrationDefinition::consensus("c", "ok?", 0.6, agents(1)),
            "between 2 and 10",
        );
        assert!(OrchestrationDefinition::consensus("c", "ok?", 0.6, agents(2))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_threshold_range_is_inclusive() {
        assert!(OrchestrationDefinition::consensus("c", "q", 0.5, agents(2)).validate().is_ok());
        assert!(OrchestrationDefinition::consensus("c", "q", 1.0, agents(2)).validate().is_ok());
        assert_invalid(&OrchestrationDefinition::consensus("c", "q", 0.49, agents(2)), "threshold");
        assert_invalid(&OrchestrationDefinition::consensus("c", "q", 1.01, agents(2)), "threshold");
        assert_invalid(&OrchestrationDefinition::consensus("c", "q", f64::NAN, agents(2)), "threshold");
    }

    #[test]
    fn test_text_length_limits() {
        let long_name = "n".repeat(101);
        assert_invalid(&OrchestrationDefinition::parallel(long_name, agents(1)), "name");

        let description = "d".repeat(501);
        assert_invalid(
            &OrchestrationDefinition::parallel("p", agents(1)).with_description(description),
            "description",
        );

        let question = "q".repeat(501);
        assert_invalid(
            &OrchestrationDefinition::consensus("c", question, 0.6, agents(2)),
            "question",
        );

        // Characters, not bytes
        let accented = "é".repeat(100);
        assert!(OrchestrationDefinition::parallel(accented, agents(1)).validate().is_ok());
    }

    #[test]
    fn test_inactive_definition_rejected() {
        let definition = OrchestrationDefinition::parallel("p", agents(1)).with_active(false);
        assert_invalid(&definition, "inactive");
    }

    #[test]
    fn test_transform_only_in_chain() {
        let parallel = OrchestrationDefinition::parallel(
            "p",
            vec![AgentReference::new("a").with_transform("{{ previous }}")],
        );
        assert_invalid(&parallel, "only chain mode");

        let chain = OrchestrationDefinition::chain(
            "c",
            "start",
            vec![
                AgentReference::new("a"),
                AgentReference::new("b").with_transform("Summarize: {{ previous }}"),
            ],
        );
        assert!(chain.validate().is_ok());

        let broken = OrchestrationDefinition::chain(
            "c",
            "start",
            vec![AgentReference::new("a").with_transform("{{ previous")],
        );
        assert_invalid(&broken, "invalid transform");
    }

    #[test]
    fn test_first_chain_step_takes_no_input() {
        let literal = OrchestrationDefinition::chain(
            "c",
            "start",
            vec![AgentReference::new("a").with_input("ignored"), AgentReference::new("b")],
        );
        assert_invalid(&literal, "first chain step");

        let transform = OrchestrationDefinition::chain(
            "c",
            "start",
            vec![AgentReference::new("a").with_transform("{{ initial }}")],
        );
        assert_invalid(&transform, "first chain step");
    }

    #[test]
    fn test_chain_requires_initial_input() {
        let mut chain = OrchestrationDefinition::chain("c", "start", agents(2));
        chain.initial_input = None;
        assert_invalid(&chain, "initial input");
    }

    #[test]
    fn test_input_source_resolution() {
        assert_eq!(AgentReference::new("a").input_source(), AgentInput::Inherit);
        assert_eq!(
            AgentReference::new("a").with_input("x").input_source(),
            AgentInput::Literal("x")
        );
        assert_eq!(
            AgentReference::new("a").with_transform("{{ previous }}").input_source(),
            AgentInput::Transform("{{ previous }}")
        );
    }

    #[test]
    fn test_parse_consensus_yaml() {
        let yaml = r#"
name: "Release approval"
mode: consensus
question: "Should we ship build 42?"
consensus_threshold: 0.75
agents:
  - agent_key: "reviewer-a"
  - agent_key: "reviewer-b"
    invocation: "streaming"
  - agent_key: "reviewer-c"
"#;
        let definition = OrchestrationDefinition::from_yaml(yaml).unwrap();
        assert_eq!(definition.mode, OrchestrationMode::Consensus);
        assert_eq!(definition.agents.len(), 3);
        assert_eq!(definition.agents[0].invocation, "default");
        assert_eq!(definition.agents[1].invocation, "streaming");
        assert!(definition.is_active);
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_parse_chain_yaml() {
        let yaml = r#"
name: "Draft and review"
mode: chain
initial_input: "Write a release note"
agents:
  - agent_key: "writer"
  - agent_key: "editor"
    transform: "Tighten this draft: {{ previous }}"
"#;
        let definition = OrchestrationDefinition::from_yaml(yaml).unwrap();
        assert_eq!(definition.mode, OrchestrationMode::Chain);
        assert_eq!(definition.initial_input.as_deref(), Some("Write a release note"));
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_unknown_mode_is_config_error() {
        let yaml = "name: x\nmode: debate\nagents: []\n";
        assert!(matches!(
            OrchestrationDefinition::from_yaml(yaml),
            Err(Error::Config(_))
        ));
    }
}
