use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::time::SystemTime;

use anyhow::{Result, bail};
use camino::Utf8PathBuf;
use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::dispatch::Action;

/// Raw scenario file shape as written by scenario authors.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioFile {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub default_reply: Option<String>,
    #[serde(default)]
    pub dialogs: Vec<Dialog>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dialog {
    pub action: String,
    pub reply: String,
    #[serde(default)]
    pub image: Option<Utf8PathBuf>,
}

/// Validated scenario, swapped in atomically on a successful build.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: String,
    pub version: Version,
    pub default_reply: Option<String>,
    pub dialogs: Vec<Dialog>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BuildOptions {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub skip_image: bool,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to read scenario {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid scenario YAML in {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },
    #[error("scenario validation failed: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub id: String,
    pub version: Version,
    pub dialog_count: usize,
}

impl fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scenario {} v{}: {} dialog(s)",
            self.id, self.version, self.dialog_count
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built(BuildSummary),
    /// The scenario file has not changed since the last build.
    Unchanged,
}

struct LoadedScenario {
    scenario: Scenario,
    modified: Option<SystemTime>,
}

/// A named bot bound to one scenario file on disk.
pub struct Bot {
    name: String,
    scenario_path: Utf8PathBuf,
    state: RwLock<Option<LoadedScenario>>,
}

impl Bot {
    pub fn new(name: impl Into<String>, scenario_path: Utf8PathBuf) -> Self {
        Self {
            name: name.into(),
            scenario_path,
            state: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scenario_path(&self) -> &Utf8PathBuf {
        &self.scenario_path
    }

    /// Current scenario summary, if a build has succeeded.
    pub fn summary(&self) -> Option<BuildSummary> {
        self.state.read().as_ref().map(|loaded| BuildSummary {
            id: loaded.scenario.id.clone(),
            version: loaded.scenario.version.clone(),
            dialog_count: loaded.scenario.dialogs.len(),
        })
    }

    /// Parse and validate the scenario file, replacing the active scenario on
    /// success. An unchanged file is skipped unless `force` is set.
    pub fn build(&self, options: &BuildOptions) -> Result<BuildOutcome, BuildError> {
        let modified = fs::metadata(self.scenario_path.as_std_path())
            .and_then(|meta| meta.modified())
            .ok();

        if !options.force
            && let Some(loaded) = self.state.read().as_ref()
            && loaded.modified.is_some()
            && loaded.modified == modified
        {
            return Ok(BuildOutcome::Unchanged);
        }

        let raw =
            fs::read_to_string(self.scenario_path.as_std_path()).map_err(|source| {
                BuildError::Read {
                    path: self.scenario_path.clone(),
                    source,
                }
            })?;
        let file: ScenarioFile =
            serde_yaml_bw::from_str(&raw).map_err(|source| BuildError::Parse {
                path: self.scenario_path.clone(),
                source,
            })?;
        let scenario = self.validate(file, options)?;

        let summary = BuildSummary {
            id: scenario.id.clone(),
            version: scenario.version.clone(),
            dialog_count: scenario.dialogs.len(),
        };
        info!(bot = %self.name, %summary, "scenario built");
        *self.state.write() = Some(LoadedScenario { scenario, modified });
        Ok(BuildOutcome::Built(summary))
    }

    fn validate(&self, file: ScenarioFile, options: &BuildOptions) -> Result<Scenario, BuildError> {
        if file.id.trim().is_empty() {
            return Err(BuildError::Invalid("scenario id is empty".into()));
        }
        let version = Version::parse(&file.version).map_err(|err| {
            BuildError::Invalid(format!("version {:?} is not semver: {err}", file.version))
        })?;
        if file.dialogs.is_empty() {
            return Err(BuildError::Invalid(format!(
                "scenario {} has no dialogs",
                file.id
            )));
        }

        let mut seen = HashSet::new();
        for dialog in &file.dialogs {
            if !seen.insert(dialog.action.as_str()) {
                return Err(BuildError::Invalid(format!(
                    "duplicate dialog action {:?}",
                    dialog.action
                )));
            }
        }

        if !options.skip_image {
            let base = self.scenario_path.parent().map(Utf8PathBuf::from);
            for dialog in &file.dialogs {
                if let Some(image) = &dialog.image {
                    let resolved = match &base {
                        Some(base) => base.join(image),
                        None => image.clone(),
                    };
                    if !resolved.exists() {
                        return Err(BuildError::Invalid(format!(
                            "dialog {:?} references missing image {resolved}",
                            dialog.action
                        )));
                    }
                }
            }
        }

        Ok(Scenario {
            id: file.id,
            version,
            default_reply: file.default_reply,
            dialogs: file.dialogs,
        })
    }

    /// Rebuild when the scenario file changed on disk; build when never loaded.
    pub fn check_reload(&self) -> Result<BuildOutcome, BuildError> {
        self.build(&BuildOptions::default())
    }

    /// Render the reply for an action, substituting `{attr}` placeholders from
    /// the action's attributes. Falls back to the scenario's default reply.
    pub fn reply_for(&self, action: &Action) -> Result<String> {
        let state = self.state.read();
        let Some(loaded) = state.as_ref() else {
            bail!("bot {} has no built scenario", self.name);
        };
        let scenario = &loaded.scenario;
        let template = scenario
            .dialogs
            .iter()
            .find(|dialog| dialog.action == action.name())
            .map(|dialog| dialog.reply.as_str())
            .or(scenario.default_reply.as_deref());
        let Some(template) = template else {
            bail!(
                "scenario {} has no dialog for action {:?}",
                scenario.id,
                action.name()
            );
        };
        Ok(render_template(template, action))
    }
}

fn render_template(template: &str, action: &Action) -> String {
    let mut rendered = template.to_string();
    for (key, value) in action.attrs() {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}
