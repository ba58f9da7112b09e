//! Skill registry: static instruction documents injected into the
//! system prompt.
//!
//! Two layouts are recognised under the skills directory:
//! `<dir>/<name>.md` (name = file stem) and `<dir>/<name>/SKILL.md`
//! (name = front-matter `name`, else the directory name). YAML
//! front-matter between `---` fences is optional in both.
//!
//! Skills are loaded once at startup and never change afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info, warn};

// ── Types ───────────────────────────────────────────────────

/// Front-matter fields we understand. Unknown keys are ignored so
/// skills written for other tools still load.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkillMeta {
    #[serde(default, alias = "id")]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: Option<String>,
    /// Markdown body, trimmed.
    pub instructions: String,
    pub path: PathBuf,
}

// ── Registry ────────────────────────────────────────────────

/// Immutable, name-ordered set of skills.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Skill>,
}

impl SkillRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scan `dir`. A missing directory yields an empty registry.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let mut reg = Self::default();
        if !dir.is_dir() {
            debug!(path = %dir.display(), "no skills directory");
            return Ok(reg);
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("reading skills dir {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for path in entries {
            let (file, fallback_name) = if path.is_dir() {
                let skill_md = path.join("SKILL.md");
                if !skill_md.is_file() {
                    debug!(path = %path.display(), "skipping directory without SKILL.md");
                    continue;
                }
                (skill_md, file_name(&path))
            } else if path.extension().is_some_and(|e| e == "md") {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (path.clone(), stem)
            } else {
                continue;
            };

            match load_skill(&file, &fallback_name) {
                Ok(Some(skill)) => reg.insert(skill),
                Ok(None) => debug!(path = %file.display(), "skipping empty skill"),
                Err(e) => warn!(path = %file.display(), error = %e, "failed to load skill"),
            }
        }

        info!(count = reg.len(), path = %dir.display(), "skills loaded");
        Ok(reg)
    }

    /// Add a skill; the first one registered under a name wins.
    pub fn insert(&mut self, skill: Skill) {
        if self.skills.contains_key(&skill.name) {
            warn!(skill = %skill.name, path = %skill.path.display(), "duplicate skill name, keeping first");
            return;
        }
        self.skills.insert(skill.name.clone(), skill);
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Skills in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Skill> {
        self.skills.values()
    }

    // ── Prompt injection ────────────────────────────────────

    /// Render every skill as one block, in name order:
    /// ```text
    /// <available_skills>
    /// <skill>
    /// <name>NAME</name>
    /// <instructions>
    /// BODY
    /// </instructions>
    /// </skill>
    /// </available_skills>
    /// ```
    /// Empty string when no skills are loaded.
    pub fn prompt_block(&self) -> String {
        if self.skills.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = self
            .iter()
            .map(|s| {
                format!(
                    "<skill>\n<name>{}</name>\n<instructions>\n{}\n</instructions>\n</skill>",
                    s.name, s.instructions
                )
            })
            .collect();
        format!("<available_skills>\n{}\n</available_skills>", parts.join("\n"))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn load_skill(file: &Path, fallback_name: &str) -> anyhow::Result<Option<Skill>> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let (front, body) = split_front_matter(&content);
    let meta: SkillMeta = match front {
        Some(yaml) if !yaml.trim().is_empty() => serde_yaml::from_str(yaml)
            .with_context(|| format!("parsing front-matter in {}", file.display()))?,
        _ => SkillMeta::default(),
    };

    let instructions = body.trim().to_string();
    if instructions.is_empty() {
        return Ok(None);
    }
    let name = meta
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| fallback_name.to_string());
    if name.is_empty() {
        anyhow::bail!("skill has no name");
    }
    Ok(Some(Skill {
        name,
        description: meta.description,
        instructions,
        path: file.to_path_buf(),
    }))
}

// ── Front-matter parser ──────────────────────────────────────

/// Split `---\nYAML\n---\nBODY` into `(Some(yaml), body)`.
///
/// Documents without a complete front-matter block return `(None, content)`.
pub fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let trimmed = content.trim_start();
    let Some(after_open) = trimmed.strip_prefix("---") else {
        return (None, content);
    };
    let after_open = after_open
        .strip_prefix("\r\n")
        .or_else(|| after_open.strip_prefix('\n'))
        .unwrap_or(after_open);
    match after_open.find("\n---") {
        Some(close) => {
            let yaml = &after_open[..close];
            let rest = &after_open[close + 4..];
            let body = rest
                .strip_prefix("\r\n")
                .or_else(|| rest.strip_prefix('\n'))
                .unwrap_or(rest);
            (Some(yaml), body)
        }
        None => (None, content),
    }
}
