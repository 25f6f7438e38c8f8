// src/runner/workspace.rs
//! Isolated per-agent workspaces
//!
//! Each agent gets a throwaway directory built from the shared templates
//! plus its group's intent file. The scoped credential is consumed here:
//! injected into the workspace MCP config and a 0600 env file, then
//! dropped. Workspaces are removed when the pair retires.

use crate::runner::agent::{AgentSpec, Credential};
use crate::utils::config::SandboxSettings;
use crate::utils::errors::{Result, RunnerError};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

const CREDENTIAL_PLACEHOLDER: &str = "SIM_API_KEY_PLACEHOLDER";
const CITY_ID_PLACEHOLDER: &str = "CITY_ID_PLACEHOLDER";

/// One agent's prepared sandbox directory
#[derive(Debug)]
pub struct Workspace {
    root: TempDir,
    env_file: PathBuf,

    /// Intent file name inside the workspace root
    pub intent_file: String,
}

impl Workspace {
    /// Build the workspace for `spec`, consuming its credential.
    pub fn prepare(
        settings: &SandboxSettings,
        spec: &AgentSpec,
        credential: Credential,
    ) -> Result<Self> {
        let root = TempDir::with_prefix(format!("intent-{}-", spec.agent_id))
            .map_err(|e| RunnerError::Sandbox(format!("workspace dir: {}", e)))?;

        copy_tree(&settings.templates_dir, root.path())
            .map_err(|e| RunnerError::Sandbox(format!("workspace templates: {}", e)))?;

        let intent_file = spec.group.intent_file().to_string();
        let intent_src = settings.intents_dir.join(&intent_file);
        fs::copy(&intent_src, root.path().join(&intent_file)).map_err(|e| {
            RunnerError::Sandbox(format!("intent file {}: {}", intent_src.display(), e))
        })?;

        inject(
            &root.path().join(".claude/mcp.json"),
            CREDENTIAL_PLACEHOLDER,
            credential.expose(),
        )?;
        inject(
            &root.path().join("CLAUDE.md"),
            CITY_ID_PLACEHOLDER,
            &spec.city_id,
        )?;

        let env_file = write_env_file(root.path(), &credential)?;

        debug!(agent_id = %spec.agent_id, path = %root.path().display(), "workspace prepared");

        // Credential dropped here; only the workspace copies remain
        Ok(Self {
            root,
            env_file,
            intent_file,
        })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }
}

/// Recursive template copy; templates are small, flat trees.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Replace `placeholder` in `path` when the file exists; templates without
/// the file simply skip the injection.
fn inject(path: &Path, placeholder: &str, value: &str) -> Result<()> {
    if !path.is_file() {
        return Ok(());
    }
    let text = fs::read_to_string(path)
        .map_err(|e| RunnerError::Sandbox(format!("read {}: {}", path.display(), e)))?;
    fs::write(path, text.replace(placeholder, value))
        .map_err(|e| RunnerError::Sandbox(format!("write {}: {}", path.display(), e)))?;
    Ok(())
}

/// Secrets go to the container through an env file, never through argv.
fn write_env_file(workspace: &Path, credential: &Credential) -> Result<PathBuf> {
    let path = workspace.join(".agent.env");
    fs::write(&path, format!("SIM_API_KEY={}\n", credential.expose()))
        .map_err(|e| RunnerError::Sandbox(format!("env file: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(|e| RunnerError::Sandbox(format!("env file mode: {}", e)))?;
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agent::Group;
    use tempfile::tempdir;

    fn settings_with_assets(assets: &Path) -> SandboxSettings {
        let templates = assets.join("templates");
        let intents = assets.join("intents");
        fs::create_dir_all(templates.join(".claude")).unwrap();
        fs::create_dir_all(&intents).unwrap();

        fs::write(
            templates.join("CLAUDE.md"),
            "Manage city CITY_ID_PLACEHOLDER.",
        )
        .unwrap();
        fs::write(
            templates.join(".claude/mcp.json"),
            r#"{"key": "SIM_API_KEY_PLACEHOLDER"}"#,
        )
        .unwrap();
        fs::write(intents.join("intent_a.txt"), "maximise the score").unwrap();
        fs::write(intents.join("intent_b.txt"), "serve the residents").unwrap();

        SandboxSettings {
            templates_dir: templates,
            intents_dir: intents,
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_injects_credential_and_city() {
        let assets = tempdir().unwrap();
        let settings = settings_with_assets(assets.path());
        let spec = AgentSpec::new(1, Group::A, "metric", "city-42");

        let ws = Workspace::prepare(&settings, &spec, Credential::new("sk-test-key".into())).unwrap();

        let claude_md = fs::read_to_string(ws.path().join("CLAUDE.md")).unwrap();
        assert!(claude_md.contains("city-42"));
        assert!(!claude_md.contains(CITY_ID_PLACEHOLDER));

        let mcp = fs::read_to_string(ws.path().join(".claude/mcp.json")).unwrap();
        assert!(mcp.contains("sk-test-key"));

        let env = fs::read_to_string(ws.env_file()).unwrap();
        assert!(env.contains("SIM_API_KEY=sk-test-key"));

        assert_eq!(ws.intent_file, "intent_a.txt");
        assert!(ws.path().join("intent_a.txt").is_file());
    }

    #[test]
    fn test_missing_intent_file_fails() {
        let assets = tempdir().unwrap();
        let settings = settings_with_assets(assets.path());
        fs::remove_file(settings.intents_dir.join("intent_b.txt")).unwrap();
        let spec = AgentSpec::new(1, Group::B, "value", "city-1");

        let err = Workspace::prepare(&settings, &spec, Credential::new("k".into())).unwrap_err();
        assert!(matches!(err, RunnerError::Sandbox(_)));
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let assets = tempdir().unwrap();
        let settings = settings_with_assets(assets.path());
        let spec = AgentSpec::new(2, Group::A, "metric", "city-7");

        let ws = Workspace::prepare(&settings, &spec, Credential::new("k".into())).unwrap();
        let path = ws.path().to_path_buf();
        assert!(path.exists());
        drop(ws);
        assert!(!path.exists());
    }
}
