use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

// Built-in prompts are embedded at compile time so a bare binary works.
const TRANSLATE_TEMPLATE: &str = include_str!("../templates/translate.txt");
const ANALYSE_TEMPLATE: &str = include_str!("../templates/analyse.txt");

const TRANSLATE_FILE: &str = "translate.txt";
const ANALYSE_FILE: &str = "analyse.txt";

/// System prompts for the translation and analysis services
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    pub translate: String,
    pub analyse: String,
}

impl PromptTemplates {
    pub fn builtin() -> Self {
        Self {
            translate: TRANSLATE_TEMPLATE.to_string(),
            analyse: ANALYSE_TEMPLATE.to_string(),
        }
    }

    /// Read both templates from `directory`, or fall back to the built-in
    /// ones when no directory is configured.
    pub fn load(directory: Option<&Path>) -> Result<Self> {
        let Some(dir) = directory else {
            return Ok(Self::builtin());
        };

        let read = |name: &str| -> Result<String> {
            let path = dir.join(name);
            std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to load template: {}", path.display()))
        };

        let templates = Self {
            translate: read(TRANSLATE_FILE)?,
            analyse: read(ANALYSE_FILE)?,
        };
        info!("Loaded prompt templates from {}", dir.display());
        Ok(templates)
    }
}

/// Substitute every `{{%key%}}` placeholder with its value.
pub fn render(template: &str, params: &[(&str, &str)]) -> String {
    params
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{{%{}%}}}}", key), value)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_all_occurrences() {
        let out = render(
            "Translate to {{%lang%}}. Only {{%lang%}}! {{%unknown%}}",
            &[("lang", "English")],
        );
        assert_eq!(out, "Translate to English. Only English! {{%unknown%}}");
    }

    #[test]
    fn test_builtin_templates_have_expected_placeholders() {
        let templates = PromptTemplates::builtin();
        assert!(templates.translate.contains("{{%target_language%}}"));
        assert!(templates.analyse.contains("\"analysis\""));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TRANSLATE_FILE), "T {{%target_language%}}").unwrap();
        std::fs::write(dir.path().join(ANALYSE_FILE), "A").unwrap();

        let templates = PromptTemplates::load(Some(dir.path())).unwrap();
        assert_eq!(templates.translate, "T {{%target_language%}}");
        assert_eq!(templates.analyse, "A");

        assert!(PromptTemplates::load(None).unwrap().analyse.contains("analysis"));
    }

    #[test]
    fn test_missing_template_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TRANSLATE_FILE), "T").unwrap();
        let err = PromptTemplates::load(Some(dir.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("analyse.txt"));
    }
}
