//! 技能加载器
//!
//! 从 skills 目录加载 `<id>/skill.toml` 并缓存。skill.toml 除元数据外还声明工具约束与步骤，
//! 供 SkillPlanProvider 构建 StructuredPlan。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;

use super::{PlanError, Step, StructuredPlan, ToolConstraints};

/// 步骤声明（id 缺省时按顺序编号）
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub id: Option<u32>,
    pub description: String,
    #[serde(default = "default_expect")]
    pub expect: String,
}

fn default_expect() -> String {
    "success".to_string()
}

/// 技能元数据（skill.toml 的 [skill] 段）
#[derive(Debug, Clone, Deserialize)]
pub struct SkillMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub forbidden_tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SkillToml {
    skill: SkillMeta,
    #[serde(default)]
    steps: Vec<StepSpec>,
}

/// 完整技能数据
#[derive(Debug, Clone)]
pub struct Skill {
    pub meta: SkillMeta,
    pub steps: Vec<StepSpec>,
    /// capability.md（可选），拼入 system prompt
    pub capability: String,
    pub dir: PathBuf,
}

impl Skill {
    pub fn summary(&self) -> String {
        format!("[{}] {}: {}", self.meta.id, self.meta.name, self.meta.description)
    }

    /// 由技能声明构建计划；步骤 id 必须唯一
    pub fn to_plan(&self) -> Result<StructuredPlan, PlanError> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for (i, spec) in self.steps.iter().enumerate() {
            let id = spec.id.unwrap_or(i as u32 + 1);
            if steps.iter().any(|s: &Step| s.id == id) {
                return Err(PlanError::InvalidSkill {
                    skill: self.meta.id.clone(),
                    reason: format!("duplicate step id {id}"),
                });
            }
            steps.push(Step::new(id, spec.description.clone(), spec.expect.clone()));
        }
        Ok(StructuredPlan::new(
            self.meta.id.clone(),
            ToolConstraints::new(
                self.meta.allowed_tools.iter().cloned(),
                self.meta.forbidden_tools.iter().cloned(),
            ),
            steps,
        ))
    }
}

/// 技能缓存
pub type SkillCache = Arc<RwLock<HashMap<String, Skill>>>;

/// 技能加载器
pub struct SkillLoader {
    skills_dir: PathBuf,
    cache: SkillCache,
}

impl SkillLoader {
    pub fn new(skills_dir: impl AsRef<Path>) -> Self {
        Self {
            skills_dir: skills_dir.as_ref().to_path_buf(),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 从默认位置创建
    pub fn from_default() -> Self {
        let dirs = [PathBuf::from("config/skills"), PathBuf::from("../config/skills")];
        let skills_dir = dirs
            .into_iter()
            .find(|d| d.exists())
            .unwrap_or_else(|| PathBuf::from("config/skills"));
        Self::new(skills_dir)
    }

    pub fn skills_dir(&self) -> &Path {
        &self.skills_dir
    }

    /// 加载所有技能并缓存；单个技能解析失败只记录警告
    pub async fn load_all(&self) -> Result<Vec<Skill>, PlanError> {
        let mut skills = Vec::new();

        if !self.skills_dir.exists() {
            return Ok(skills);
        }

        let entries =
            std::fs::read_dir(&self.skills_dir).map_err(|e| PlanError::Load(e.to_string()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || !path.join("skill.toml").exists() {
                continue;
            }
            match self.load_skill(&path) {
                Ok(skill) => skills.push(skill),
                Err(e) => tracing::warn!(dir = %path.display(), error = %e, "skipping invalid skill"),
            }
        }

        let mut cache = self.cache.write().await;
        for skill in &skills {
            cache.insert(skill.meta.id.clone(), skill.clone());
        }

        tracing::info!("Loaded {} skills", skills.len());
        Ok(skills)
    }

    fn load_skill(&self, dir: &Path) -> Result<Skill, PlanError> {
        let name = dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let invalid = |reason: String| PlanError::InvalidSkill {
            skill: name.clone(),
            reason,
        };
        let toml_content =
            std::fs::read_to_string(dir.join("skill.toml")).map_err(|e| invalid(e.to_string()))?;
        let data: SkillToml = toml::from_str(&toml_content).map_err(|e| invalid(e.to_string()))?;
        let capability = std::fs::read_to_string(dir.join("capability.md")).unwrap_or_default();

        Ok(Skill {
            meta: data.skill,
            steps: data.steps,
            capability,
            dir: dir.to_path_buf(),
        })
    }

    /// 根据 ID 获取技能；缓存未命中时尝试从 `<skills_dir>/<id>` 直接加载
    pub async fn get(&self, id: &str) -> Result<Skill, PlanError> {
        if let Some(skill) = self.cache.read().await.get(id).cloned() {
            return Ok(skill);
        }
        let dir = self.skills_dir.join(id);
        if !dir.join("skill.toml").exists() {
            return Err(PlanError::UnknownSkill(id.to_string()));
        }
        let skill = self.load_skill(&dir)?;
        self.cache.write().await.insert(skill.meta.id.clone(), skill.clone());
        Ok(skill)
    }

    pub async fn list_summaries(&self) -> Vec<String> {
        let cache = self.cache.read().await;
        let mut out: Vec<String> = cache.values().map(|s| s.summary()).collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, id: &str, body: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("skill.toml"), body).unwrap();
    }

    const CONFIG_SKILL: &str = r#"
[skill]
id = "write-config"
name = "Write config"
description = "Create a configuration file"
allowed_tools = ["read_file", "write_file"]
forbidden_tools = ["run_in_terminal"]

[[steps]]
description = "Write the config file"
expect = "file exists"

[[steps]]
description = "Read it back"
expect = "output contains [app]"
"#;

    #[tokio::test]
    async fn test_load_and_build_plan() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "write-config", CONFIG_SKILL);
        let loader = SkillLoader::new(tmp.path());
        let skills = loader.load_all().await.unwrap();
        assert_eq!(skills.len(), 1);

        let plan = loader.get("write-config").await.unwrap().to_plan().unwrap();
        assert_eq!(plan.skill_binding, "write-config");
        assert!(plan.tool_constraints.allowed.contains("write_file"));
        assert!(plan.tool_constraints.forbidden.contains("run_in_terminal"));
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].id, 2);
        assert_eq!(plan.steps[0].expect, "file exists");
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_skills() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "broken", "this is not toml = [");
        let loader = SkillLoader::new(tmp.path());
        assert!(loader.load_all().await.unwrap().is_empty());
        assert!(matches!(loader.get("missing").await, Err(PlanError::UnknownSkill(_))));
        assert!(matches!(loader.get("broken").await, Err(PlanError::InvalidSkill { .. })));
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let skill = Skill {
            meta: SkillMeta {
                id: "dup".into(),
                name: "Dup".into(),
                description: String::new(),
                tags: vec![],
                allowed_tools: vec![],
                forbidden_tools: vec![],
            },
            steps: vec![
                StepSpec { id: Some(1), description: "a".into(), expect: "success".into() },
                StepSpec { id: Some(1), description: "b".into(), expect: "success".into() },
            ],
            capability: String::new(),
            dir: PathBuf::from("."),
        };
        assert!(matches!(skill.to_plan(), Err(PlanError::InvalidSkill { .. })));
    }
}
