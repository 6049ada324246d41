//! 提示词模板：人设 / 业务规则文本 + 按阶段的引导语
//!
//! 优先读 `<dir>/persona.md` 与 `<dir>/stages/<stage>.md`，缺失时用内置默认（编译进二进制的 config/prompts）。
//! 文本中的 `{clinic_name}` 等占位符用 [clinic] 段替换。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::stage::Stage;
use crate::config::ClinicSection;

const BUILTIN_PERSONA: &str = include_str!("../../config/prompts/persona.md");
const BUILTIN_GREETING: &str = include_str!("../../config/prompts/stages/greeting.md");
const BUILTIN_INFO_COLLECTION: &str = include_str!("../../config/prompts/stages/info_collection.md");
const BUILTIN_SCHEDULING: &str = include_str!("../../config/prompts/stages/scheduling.md");
const BUILTIN_CONFIRMATION: &str = include_str!("../../config/prompts/stages/confirmation.md");
const BUILTIN_FOLLOW_UP: &str = include_str!("../../config/prompts/stages/follow_up.md");

/// 阶段未配置引导语时的统一默认
const DEFAULT_GUIDANCE: &str = "Responda de forma cordial e ajude o paciente no que for preciso.";

fn builtin_guidance(stage: Stage) -> &'static str {
    match stage {
        Stage::Greeting => BUILTIN_GREETING,
        Stage::InfoCollection => BUILTIN_INFO_COLLECTION,
        Stage::Scheduling => BUILTIN_SCHEDULING,
        Stage::Confirmation => BUILTIN_CONFIRMATION,
        Stage::FollowUp => BUILTIN_FOLLOW_UP,
    }
}

/// 静态模板源：按阶段名查引导语
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    persona: String,
    stages: HashMap<Stage, String>,
}

impl PromptTemplates {
    /// 直接给定文本（未出现在 stages 里的阶段使用默认引导语）
    pub fn new(persona: impl Into<String>, stages: HashMap<Stage, String>) -> Self {
        Self {
            persona: persona.into(),
            stages,
        }
    }

    /// 内置模板
    pub fn builtin(clinic: &ClinicSection) -> Self {
        let stages = Stage::ALL
            .into_iter()
            .map(|stage| (stage, fill(builtin_guidance(stage), clinic)))
            .collect();
        Self::new(fill(BUILTIN_PERSONA, clinic), stages)
    }

    /// 从目录加载，缺失的文件逐个回落到内置模板
    pub fn load(dir: Option<&Path>, clinic: &ClinicSection) -> Self {
        let dir = dir.map(Path::to_path_buf).or_else(|| {
            ["config/prompts", "../config/prompts"]
                .into_iter()
                .map(PathBuf::from)
                .find(|p| p.is_dir())
        });
        let Some(dir) = dir else {
            tracing::debug!("No prompts directory found, using built-in templates");
            return Self::builtin(clinic);
        };

        let persona = read_template(&dir.join("persona.md")).unwrap_or_else(|| BUILTIN_PERSONA.to_string());
        let stages = Stage::ALL
            .into_iter()
            .map(|stage| {
                let path = dir.join("stages").join(format!("{}.md", stage));
                let text = read_template(&path).unwrap_or_else(|| builtin_guidance(stage).to_string());
                (stage, fill(&text, clinic))
            })
            .collect();

        tracing::info!(dir = %dir.display(), "Prompt templates loaded");
        Self::new(fill(&persona, clinic), stages)
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn stage_guidance(&self, stage: Stage) -> &str {
        self.stages
            .get(&stage)
            .map(String::as_str)
            .unwrap_or(DEFAULT_GUIDANCE)
    }
}

fn read_template(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .filter(|text| !text.trim().is_empty())
}

fn fill(text: &str, clinic: &ClinicSection) -> String {
    text.replace("{clinic_name}", &clinic.name)
        .replace("{clinic_address}", &clinic.address)
        .replace("{clinic_hours}", &clinic.hours)
        .replace("{clinic_phone}", &clinic.phone)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_substitutes_clinic_fields() {
        let clinic = ClinicSection {
            name: "Clínica Teste".into(),
            phone: "(21) 1234-5678".into(),
            ..ClinicSection::default()
        };
        let templates = PromptTemplates::builtin(&clinic);
        assert!(templates.persona().contains("Clínica Teste"));
        assert!(templates.persona().contains("(21) 1234-5678"));
        assert!(!templates.persona().contains("{clinic_name}"));
        assert!(templates.stage_guidance(Stage::Scheduling).contains("agendamento"));
    }

    #[test]
    fn test_load_overrides_individual_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("stages")).unwrap();
        std::fs::write(dir.path().join("persona.md"), "Persona da {clinic_name}").unwrap();
        std::fs::write(dir.path().join("stages/greeting.md"), "Diga oi").unwrap();

        let templates = PromptTemplates::load(Some(dir.path()), &ClinicSection::default());
        assert_eq!(templates.persona(), "Persona da Clínica Odontológica Sorriso");
        assert_eq!(templates.stage_guidance(Stage::Greeting), "Diga oi");
        assert!(templates
            .stage_guidance(Stage::Confirmation)
            .contains("Confirme todos os detalhes"));
    }

    #[test]
    fn test_unmapped_stage_uses_default_guidance() {
        let templates = PromptTemplates::new("p", HashMap::new());
        assert_eq!(templates.stage_guidance(Stage::FollowUp), DEFAULT_GUIDANCE);
    }
}
