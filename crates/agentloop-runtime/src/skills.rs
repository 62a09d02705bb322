//! Skills: packaged instructions under `<source>/<skill>/SKILL.md`.
//!
//! Only the YAML frontmatter (name, description) is loaded up front and
//! listed in the system prompt. The body is read through the backend when
//! the model calls `read_skill`.

use std::collections::BTreeMap;
use std::sync::Arc;

use agentloop_core::backend::Backend;
use agentloop_core::error::BackendError;
use agentloop_core::tools::{Tool, ToolBox, ToolContext, ToolOutput, ToolParameterSchema, ToolSchema};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::middleware::{AgentMiddleware, ModelContext, ModelDirective};
use crate::prompts::SKILLS_SYSTEM_PROMPT;

pub const SKILL_FILE_NAME: &str = "SKILL.md";
pub const MAX_SKILL_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const MAX_SKILL_NAME_LENGTH: usize = 64;
pub const MAX_SKILL_DESCRIPTION_LENGTH: usize = 1024;

lazy_static! {
    static ref SKILL_NAME: Regex = Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillScope {
    User,
    Project,
}

/// A directory of skills. Sources are scanned in order and a later source
/// overrides an earlier skill with the same name.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillSource {
    pub path: String,
    pub scope: SkillScope,
}

impl SkillSource {
    pub fn user(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            scope: SkillScope::User,
        }
    }

    pub fn project(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            scope: SkillScope::Project,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillMetadata {
    pub name: String,
    pub description: String,
    /// Backend path of the SKILL.md file.
    pub path: String,
    pub scope: SkillScope,
    pub license: Option<String>,
    pub allowed_tools: Vec<String>,
}

#[derive(Deserialize)]
struct Frontmatter {
    name: Option<String>,
    description: Option<String>,
    license: Option<String>,
    #[serde(rename = "allowed-tools")]
    allowed_tools: Option<serde_yaml::Value>,
}

/// Split `---`-delimited frontmatter from the body.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

/// Check the naming rules. Violations are reported but do not reject the skill.
pub fn validate_skill_name(name: &str, directory: &str) -> Result<(), String> {
    if name.is_empty() || name.chars().count() > MAX_SKILL_NAME_LENGTH {
        return Err(format!(
            "name must be 1-{MAX_SKILL_NAME_LENGTH} characters, got {}",
            name.chars().count()
        ));
    }
    if !SKILL_NAME.is_match(name) {
        return Err("name must be lowercase alphanumerics separated by single hyphens".into());
    }
    if name != directory {
        return Err(format!("name '{name}' does not match directory '{directory}'"));
    }
    Ok(())
}

/// Parse a SKILL.md file. Returns `None` (after logging) when the file has
/// no usable frontmatter.
pub fn parse_skill_metadata(
    content: &str,
    path: &str,
    directory: &str,
    scope: SkillScope,
) -> Option<SkillMetadata> {
    let Some((yaml, _)) = split_frontmatter(content) else {
        tracing::warn!(path, "skipping skill without YAML frontmatter");
        return None;
    };
    let frontmatter: Frontmatter = match serde_yaml::from_str(yaml) {
        Ok(frontmatter) => frontmatter,
        Err(err) => {
            tracing::warn!(path, error = %err, "skipping skill with invalid frontmatter");
            return None;
        }
    };
    let (Some(name), Some(description)) = (frontmatter.name, frontmatter.description) else {
        tracing::warn!(path, "skipping skill missing name or description");
        return None;
    };
    let name = name.trim().to_string();
    let description = description.trim();

    if let Err(reason) = validate_skill_name(&name, directory) {
        tracing::warn!(path, %reason, "skill name does not follow the naming rules");
    }

    let description: String = if description.chars().count() > MAX_SKILL_DESCRIPTION_LENGTH {
        tracing::warn!(path, "skill description truncated");
        description.chars().take(MAX_SKILL_DESCRIPTION_LENGTH).collect()
    } else {
        description.to_string()
    };

    let allowed_tools = match frontmatter.allowed_tools {
        Some(serde_yaml::Value::String(tools)) => {
            tools.split_whitespace().map(str::to_string).collect()
        }
        Some(serde_yaml::Value::Sequence(tools)) => tools
            .into_iter()
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    Some(SkillMetadata {
        name,
        description,
        path: path.to_string(),
        scope,
        license: frontmatter.license,
        allowed_tools,
    })
}

/// Skill metadata by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkillIndex {
    skills: BTreeMap<String, SkillMetadata>,
}

impl SkillIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later entries override earlier ones with the same name.
    pub fn from_skills(skills: impl IntoIterator<Item = SkillMetadata>) -> Self {
        let mut index = Self::new();
        for skill in skills {
            index.insert(skill);
        }
        index
    }

    pub fn insert(&mut self, skill: SkillMetadata) {
        if let Some(previous) = self.skills.insert(skill.name.clone(), skill) {
            tracing::debug!(name = %previous.name, path = %previous.path, "skill overridden");
        }
    }

    /// Scan `sources` in order through `backend`.
    ///
    /// A missing source directory contributes nothing. Unreadable or invalid
    /// skills are skipped with a warning.
    pub async fn scan(backend: &dyn Backend, sources: &[SkillSource]) -> Result<Self, BackendError> {
        let mut index = Self::new();
        for source in sources {
            for entry in backend.list(&source.path).await? {
                if !entry.is_dir {
                    continue;
                }
                let dir = entry.path.trim_end_matches('/');
                let directory = dir.rsplit('/').next().unwrap_or(dir);
                let file = format!("{dir}/{SKILL_FILE_NAME}");
                if let Some(skill) = load_skill(backend, &file, directory, source.scope).await {
                    index.insert(skill);
                }
            }
        }
        tracing::debug!(count = index.len(), "skills scanned");
        Ok(index)
    }

    pub fn get(&self, name: &str) -> Option<&SkillMetadata> {
        self.skills.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.skills.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SkillMetadata> {
        self.skills.values()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Prompt listing: one line per skill, sorted by name.
    pub fn render(&self) -> String {
        if self.skills.is_empty() {
            return "(No skills available)".to_string();
        }
        self.skills
            .values()
            .map(|s| {
                let scope = match s.scope {
                    SkillScope::User => "user",
                    SkillScope::Project => "project",
                };
                format!("- **{}** ({scope}): {}", s.name, s.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Full instructions of a skill: the file content after the frontmatter.
    pub async fn body(&self, name: &str, backend: &dyn Backend) -> anyhow::Result<String> {
        let skill = self.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "Skill '{name}' not found. Available skills: {}",
                self.names().join(", ")
            )
        })?;
        let content = backend.read_to_string(&skill.path).await?;
        let body = split_frontmatter(&content)
            .map(|(_, body)| body)
            .unwrap_or(&content);
        Ok(body.trim().to_string())
    }
}

async fn load_skill(
    backend: &dyn Backend,
    file: &str,
    directory: &str,
    scope: SkillScope,
) -> Option<SkillMetadata> {
    let bytes = match backend.read(file).await {
        Ok(bytes) => bytes,
        Err(err) if err.is_not_found() => return None,
        Err(err) => {
            tracing::warn!(path = file, error = %err, "skipping unreadable skill");
            return None;
        }
    };
    if bytes.len() as u64 > MAX_SKILL_FILE_SIZE {
        tracing::warn!(path = file, bytes = bytes.len(), "skipping oversized skill file");
        return None;
    }
    parse_skill_metadata(&String::from_utf8_lossy(&bytes), file, directory, scope)
}

pub struct ReadSkillTool {
    index: Arc<SkillIndex>,
    backend: Arc<dyn Backend>,
}

impl ReadSkillTool {
    pub fn new(index: Arc<SkillIndex>, backend: Arc<dyn Backend>) -> Self {
        Self { index, backend }
    }
}

#[derive(Deserialize)]
struct ReadSkillArgs {
    name: String,
}

#[async_trait]
impl Tool for ReadSkillTool {
    fn schema(&self) -> ToolSchema {
        let names: Vec<Value> = self.index.names().into_iter().map(Value::String).collect();
        ToolSchema::new(
            "read_skill",
            "Load the full instructions of a skill listed in the system prompt",
            ToolParameterSchema::object(
                "read_skill parameters",
                BTreeMap::from([(
                    "name".to_string(),
                    ToolParameterSchema::string("Skill name").with_enum(names),
                )]),
                vec!["name".to_string()],
            ),
        )
    }

    async fn execute(&self, args: Value, _ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        let args: ReadSkillArgs = serde_json::from_value(args)?;
        let body = self.index.body(&args.name, self.backend.as_ref()).await?;
        Ok(ToolOutput::text(body))
    }
}

/// Lists skills in the prompt and registers `read_skill`. Skills are read
/// through their own backend, which may differ from the agent's.
pub struct SkillsMiddleware {
    index: Arc<SkillIndex>,
    tool: ToolBox,
}

impl SkillsMiddleware {
    pub fn new(index: Arc<SkillIndex>, backend: Arc<dyn Backend>) -> Self {
        let tool: ToolBox = Arc::new(ReadSkillTool::new(index.clone(), backend));
        Self { index, tool }
    }
}

#[async_trait]
impl AgentMiddleware for SkillsMiddleware {
    fn id(&self) -> &str {
        "skills"
    }

    fn tools(&self) -> Vec<ToolBox> {
        vec![self.tool.clone()]
    }

    async fn before_model(&self, ctx: &mut ModelContext<'_>) -> anyhow::Result<ModelDirective> {
        ctx.request.append_prompt(SKILLS_SYSTEM_PROMPT);
        ctx.request.append_prompt(&self.index.render());
        Ok(ModelDirective::Continue)
    }
}
