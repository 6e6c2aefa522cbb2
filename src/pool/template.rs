//! Agent templates
//!
//! A template is a named blueprint the pool engine instantiates members
//! from: type, default capabilities, configuration defaults and execution
//! environment. Lookups are by name and fail with a typed error for unknown
//! templates rather than silently substituting a default.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::agents::{AgentConfig, AgentType};
use crate::error::{OrchestratorError, Result};

/// Configuration defaults a template applies to its members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Autonomy level in [0,1]
    pub autonomy_level: f64,

    /// Whether members may learn from completed work
    pub learning_enabled: bool,

    /// Heartbeat cadence expected from members
    pub heartbeat_interval: Duration,

    /// Permission tags granted to members
    pub permissions: Vec<String>,

    /// Concurrency bound applied to members
    pub max_concurrent_tasks: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            autonomy_level: 0.8,
            learning_enabled: true,
            heartbeat_interval: Duration::from_millis(10_000),
            permissions: Vec::new(),
            max_concurrent_tasks: 3,
        }
    }
}

/// Execution environment a template applies to its members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateEnvironment {
    /// Program spawned for each member
    pub runtime: String,

    /// Runtime version constraint, if any
    pub version: Option<String>,

    /// Root for member working directories
    pub working_directory: PathBuf,

    /// Scratch space root
    pub temp_directory: PathBuf,

    /// Log output root
    pub log_directory: PathBuf,

    /// Tool names available to members
    pub tools: Vec<String>,
}

impl Default for TemplateEnvironment {
    fn default() -> Self {
        Self {
            runtime: String::from("agent-worker"),
            version: None,
            working_directory: PathBuf::from("./agents"),
            temp_directory: std::env::temp_dir(),
            log_directory: PathBuf::from("./logs"),
            tools: Vec::new(),
        }
    }
}

/// Named blueprint for pool members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Lookup name
    pub name: String,

    /// Type of the agents instantiated from this template
    pub agent_type: AgentType,

    /// Capability tags granted to members
    pub capabilities: Vec<String>,

    /// Configuration defaults
    pub config: TemplateConfig,

    /// Execution environment
    pub environment: TemplateEnvironment,

    /// Optional script run as the member process instead of the bare runtime
    pub startup_script: Option<PathBuf>,
}

impl Template {
    /// Blueprint for one agent type, named after its tag
    pub fn for_type(agent_type: AgentType) -> Self {
        Self {
            name: agent_type.as_str().to_string(),
            agent_type,
            capabilities: default_capabilities(agent_type),
            config: TemplateConfig::default(),
            environment: TemplateEnvironment::default(),
            startup_script: None,
        }
    }

    /// Materialise the spawn configuration for one member
    pub fn agent_config(&self, member_name: String) -> AgentConfig {
        let mut args = Vec::new();
        if let Some(script) = &self.startup_script {
            args.push(script.display().to_string());
        }
        AgentConfig {
            id: None,
            name: member_name,
            agent_type: self.agent_type,
            specialization: None,
            capabilities: self.capabilities.clone(),
            system_prompt: None,
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            priority: 5,
            max_memory_bytes: None,
            task_timeout_ms: 300_000,
            working_directory: None,
            environment: HashMap::new(),
            command: self.environment.runtime.clone(),
            args,
        }
    }
}

fn default_capabilities(agent_type: AgentType) -> Vec<String> {
    let tags: &[&str] = match agent_type {
        AgentType::Backend => &["api", "services"],
        AgentType::Frontend => &["ui", "interaction"],
        AgentType::Researcher => &["research", "analysis"],
        AgentType::Developer => &["coding", "refactoring"],
        AgentType::Tester => &["testing", "validation"],
        AgentType::Reviewer => &["review", "quality"],
        AgentType::Architect => &["design", "planning"],
        AgentType::General => &[],
    };
    tags.iter().map(|t| t.to_string()).collect()
}

/// Name-keyed template store
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, Template>>,
}

impl TemplateRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-seeded with one template per agent type
    pub fn with_builtins() -> Self {
        let mut templates = HashMap::new();
        for agent_type in [
            AgentType::Backend,
            AgentType::Frontend,
            AgentType::Researcher,
            AgentType::Developer,
            AgentType::Tester,
            AgentType::Reviewer,
            AgentType::Architect,
            AgentType::General,
        ] {
            let template = Template::for_type(agent_type);
            templates.insert(template.name.clone(), template);
        }
        Self {
            templates: RwLock::new(templates),
        }
    }

    /// Insert or replace a template
    pub async fn register(&self, template: Template) {
        self.templates
            .write()
            .await
            .insert(template.name.clone(), template);
    }

    /// Look a template up by name
    pub async fn get(&self, name: &str) -> Result<Template> {
        self.templates
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "template",
                id: name.to_string(),
            })
    }

    /// Registered template names
    pub async fn names(&self) -> Vec<String> {
        self.templates.read().await.keys().cloned().collect()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
