//! Profile registry: the catalog of agent launch configurations.
//!
//! Raw definitions are normalized once into an immutable [`ProfileRegistry`]. Entries that
//! cannot be launched (no base command, malformed env, unknown executor) are dropped with a
//! warning instead of failing the whole table. A broken variant only takes itself out.

use std::{collections::HashMap, fmt, fs, io, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use ts_rs::TS;

use crate::{
    command::{CmdOverrides, CommandConfig, apply_overrides},
    executors::{
        BaseCodingAgent, CodingAgent, ExecutorError, LaunchParameters,
        StandardCodingAgentExecutor,
    },
};

const DEFAULT_PROFILES: &str = include_str!("../default_profiles.json");

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),
    #[error("Unknown variant `{variant}` for profile `{profile}`")]
    UnknownVariant { profile: String, variant: String },
    #[error("Profile definitions are not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Profile label plus optional variant label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
pub struct ExecutorProfileId {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ExecutorProfileId {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            variant: None,
        }
    }

    pub fn with_variant(label: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            variant: Some(variant.into()),
        }
    }
}

impl fmt::Display for ExecutorProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}:{}", self.label, variant),
            None => write!(f, "{}", self.label),
        }
    }
}

#[derive(Deserialize)]
struct RawProfiles {
    #[serde(default)]
    profiles: Vec<RawProfile>,
}

/// Shapes are checked per entry during normalization, so fields stay untyped here.
#[derive(Deserialize)]
struct RawProfile {
    #[serde(default)]
    label: String,
    #[serde(default)]
    executor: Value,
    #[serde(default)]
    command: Value,
    #[serde(default)]
    variants: HashMap<String, Value>,
    #[serde(default)]
    builder: Option<Value>,
}

/// A normalized profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileConfig {
    pub label: String,
    pub executor: BaseCodingAgent,
    pub command: CommandConfig,
    pub variants: HashMap<String, CommandConfig>,
    /// Agent-specific parameter builder. `None` means the generic launch.
    pub builder: Option<CodingAgent>,
}

/// A profile with its variant applied, ready to build launch parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProfile {
    pub id: ExecutorProfileId,
    pub executor: BaseCodingAgent,
    pub command: CommandConfig,
    pub builder: Option<CodingAgent>,
}

impl ResolvedProfile {
    pub fn initial(&self, prompt: &str) -> Result<LaunchParameters, ExecutorError> {
        match &self.builder {
            Some(agent) => agent.build_initial(&self.command, prompt),
            None => LaunchParameters::generic(&self.command, prompt),
        }
    }

    /// `native_session_id` is already decoded from its composite form.
    pub fn follow_up(
        &self,
        native_session_id: &str,
        prompt: &str,
    ) -> Result<LaunchParameters, ExecutorError> {
        match &self.builder {
            Some(agent) => agent.build_follow_up(&self.command, native_session_id, prompt),
            None => Err(ExecutorError::FollowUpNotSupported(format!(
                "profile `{}` has no parameter builder",
                self.id.label
            ))),
        }
    }
}

fn normalize_command(value: Value) -> Option<CommandConfig> {
    let command: CommandConfig = serde_json::from_value(value).ok()?;
    (!command.base.trim().is_empty()).then_some(command)
}

fn normalize_variant(base: &CommandConfig, value: Value) -> Option<CommandConfig> {
    let overrides: CmdOverrides = serde_json::from_value(value).ok()?;
    if overrides
        .base_command_override
        .as_deref()
        .is_some_and(|b| b.trim().is_empty())
    {
        return None;
    }
    apply_overrides(base.clone(), &overrides).ok()
}

fn normalize_profile(raw: RawProfile) -> Option<ProfileConfig> {
    let label = raw.label.trim().to_string();
    if label.is_empty() {
        tracing::warn!("Dropping profile without a label");
        return None;
    }
    let Ok(executor) = serde_json::from_value::<BaseCodingAgent>(raw.executor) else {
        tracing::warn!(profile = %label, "Dropping profile with unknown executor");
        return None;
    };
    let Some(command) = normalize_command(raw.command) else {
        tracing::warn!(profile = %label, "Dropping profile with missing base command or malformed env");
        return None;
    };
    let builder = match raw.builder {
        None | Some(Value::Null) => None,
        Some(value) => match serde_json::from_value::<CodingAgent>(value) {
            Ok(agent) if BaseCodingAgent::from(&agent) == executor => Some(agent),
            _ => {
                tracing::warn!(profile = %label, "Dropping profile with invalid builder");
                return None;
            }
        },
    };

    let variants = raw
        .variants
        .into_iter()
        .filter_map(|(name, value)| match normalize_variant(&command, value) {
            Some(config) => Some((name, config)),
            None => {
                tracing::warn!(profile = %label, variant = %name, "Dropping invalid variant");
                None
            }
        })
        .collect();

    Some(ProfileConfig {
        label,
        executor,
        command,
        variants,
        builder,
    })
}

/// Immutable after construction; share it behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileRegistry {
    profiles: HashMap<String, ProfileConfig>,
}

impl ProfileRegistry {
    pub fn from_json(raw: &str) -> Result<Self, ProfileError> {
        let parsed: RawProfiles = serde_json::from_str(raw)?;
        let mut registry = Self::default();
        for profile in parsed.profiles.into_iter().filter_map(normalize_profile) {
            registry.profiles.insert(profile.label.clone(), profile);
        }
        Ok(registry)
    }

    /// The embedded default table.
    pub fn builtin() -> Self {
        Self::from_json(DEFAULT_PROFILES).unwrap_or_else(|err| {
            tracing::error!("Built-in profile table is invalid: {err}");
            Self::default()
        })
    }

    /// Overlay user definitions; a user profile replaces the built-in with the same label.
    pub fn merge(mut self, overrides: ProfileRegistry) -> Self {
        self.profiles.extend(overrides.profiles);
        self
    }

    /// Built-ins merged with the user file at `path`, when one exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ProfileError> {
        let builtin = Self::builtin();
        let Some(path) = path else {
            return Ok(builtin);
        };
        match fs::read_to_string(path) {
            Ok(raw) => Ok(builtin.merge(Self::from_json(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No user profile file");
                Ok(builtin)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, label: &str) -> Option<&ProfileConfig> {
        self.profiles.get(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Command for `label`. An unknown variant falls back to the base command.
    pub fn get_command(&self, label: &str, variant: Option<&str>) -> Option<CommandConfig> {
        let profile = self.profiles.get(label)?;
        Some(
            variant
                .and_then(|v| profile.variants.get(v))
                .unwrap_or(&profile.command)
                .clone(),
        )
    }

    /// Strict lookup used when launching: an unknown variant is an error.
    pub fn resolve(&self, id: &ExecutorProfileId) -> Result<ResolvedProfile, ProfileError> {
        let profile = self
            .profiles
            .get(&id.label)
            .ok_or_else(|| ProfileError::UnknownProfile(id.label.clone()))?;
        let command = match &id.variant {
            Some(variant) => profile
                .variants
                .get(variant)
                .ok_or_else(|| ProfileError::UnknownVariant {
                    profile: id.label.clone(),
                    variant: variant.clone(),
                })?
                .clone(),
            None => profile.command.clone(),
        };
        Ok(ResolvedProfile {
            id: id.clone(),
            executor: profile.executor,
            command,
            builder: profile.builder.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::session_resolver::SessionIdStrategy;

    #[test]
    fn builtin_table_has_every_agent() {
        let registry = ProfileRegistry::builtin();
        let mut labels: Vec<_> = registry.labels().collect();
        labels.sort();
        assert_eq!(labels, ["claude-code", "codex", "gemini", "opencode"]);

        let codex = registry.resolve(&ExecutorProfileId::new("codex")).unwrap();
        assert_eq!(codex.executor, BaseCodingAgent::Codex);
        let params = codex.initial("hello").unwrap();
        assert_eq!(params.command.program(), "codex");
        assert_eq!(params.command.args(), ["exec", "--json", "--skip-git-repo-check"]);
        assert_eq!(params.stdin.as_deref(), Some("hello"));
    }

    #[test]
    fn variants_extend_and_unknown_variants_fall_back() {
        let registry = ProfileRegistry::builtin();
        let plan = registry.get_command("claude-code", Some("plan")).unwrap();
        assert_eq!(plan.params.last().map(String::as_str), Some("--permission-mode=plan"));

        let high = registry.get_command("codex", Some("high")).unwrap();
        assert!(high.params.ends_with(&["-c".into(), "model_reasoning_effort=high".into()]));

        let fallback = registry.get_command("codex", Some("nope")).unwrap();
        assert_eq!(fallback, registry.get("codex").unwrap().command);
        assert!(registry.get_command("cursor", None).is_none());

        assert!(matches!(
            registry.resolve(&ExecutorProfileId::with_variant("codex", "nope")),
            Err(ProfileError::UnknownVariant { .. })
        ));
        assert!(matches!(
            registry.resolve(&ExecutorProfileId::new("cursor")),
            Err(ProfileError::UnknownProfile(_))
        ));
    }

    #[test]
    fn invalid_entries_are_dropped_individually() {
        let raw = json!({"profiles": [
            {"label": "no-base", "executor": "CODEX", "command": {"base": "  "}},
            {"label": "bad-env", "executor": "CODEX", "command": {"base": "codex", "env": {"A": 1}}},
            {"label": "bad-exec", "executor": "CURSOR", "command": {"base": "cursor"}},
            {"label": "ok", "executor": "GEMINI", "command": {"base": "gemini"},
             "variants": {
                "fine": {"env": {"GEMINI_MODEL": "flash"}},
                "broken": {"env": ["x"]}
             }}
        ]});
        let registry = ProfileRegistry::from_json(&raw.to_string()).unwrap();
        assert_eq!(registry.labels().collect::<Vec<_>>(), ["ok"]);

        let ok = registry.get("ok").unwrap();
        assert_eq!(ok.variants.len(), 1);
        assert_eq!(ok.variants["fine"].env["GEMINI_MODEL"], "flash");
        assert!(ok.builder.is_none());
    }

    #[test]
    fn generic_profile_appends_prompt_and_rejects_follow_up() {
        let raw = json!({"profiles": [
            {"label": "script", "executor": "CODEX", "command": {"base": "/bin/sh", "params": ["-c", "echo"]}}
        ]});
        let registry = ProfileRegistry::from_json(&raw.to_string()).unwrap();
        let resolved = registry.resolve(&ExecutorProfileId::new("script")).unwrap();

        let params = resolved.initial("hi").unwrap();
        assert_eq!(params.command.args(), ["-c", "echo", "hi"]);
        assert_eq!(params.resolver, None::<SessionIdStrategy>);
        assert!(matches!(
            resolved.follow_up("abc", "more"),
            Err(ExecutorError::FollowUpNotSupported(_))
        ));
    }

    #[test]
    fn user_profiles_replace_builtins_by_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        fs::write(
            &path,
            json!({"profiles": [
                {"label": "gemini", "executor": "GEMINI",
                 "command": {"base": "npx -y @google/gemini-cli", "params": ["--yolo"]},
                 "builder": {"GEMINI": {"model": "gemini-2.5-flash"}}}
            ]})
            .to_string(),
        )
        .unwrap();

        let registry = ProfileRegistry::load(Some(&path)).unwrap();
        assert_eq!(registry.labels().count(), 4);
        let gemini = registry.get_command("gemini", None).unwrap();
        assert_eq!(gemini.base, "npx -y @google/gemini-cli");

        let missing = ProfileRegistry::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(missing, ProfileRegistry::builtin());
    }
}
