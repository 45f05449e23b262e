//! # External-Command Wrappers
//!
//! Manifest-driven wrappers around command-line tools. Each `*.toml` file
//! in the wrappers directory declares a predicate, its mode/kind signature
//! and an argv template:
//!
//! ```toml
//! predicate = "asciidoc"
//! signature = "asciidoc(+opts: value, +src: file, -out: file)"
//! command = ["asciidoc", "-o", "{out}", "{src}"]
//! outputs = { out = "out.html" }
//! timeout_secs = 60
//! ```
//!
//! Invocation materialises bound `file` arguments from the blob store into
//! a per-call scratch directory, substitutes `{name}` placeholders, runs
//! the command under the deadline, registers each produced output file as
//! a new blob and binds its reference to the corresponding `-` argument.
//! Output `value` arguments are bound to the captured stdout. A non-zero
//! exit or an expiry maps to an `errors` outcome; the engine stays healthy.

use super::{parse_signature, Kind, Mode, Outcome, Signature, Wrapper};
use crate::filestore::FileStore;
use crate::term::{Literal, Subst, Term};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct Manifest {
    predicate: String,
    signature: String,
    command: Vec<String>,
    #[serde(default)]
    outputs: HashMap<String, String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// A wrapper that shells out to an external tool.
pub struct ExecWrapper {
    signature: Signature,
    command: Vec<String>,
    outputs: HashMap<String, String>,
    timeout: Duration,
    store: Arc<FileStore>,
}

impl ExecWrapper {
    fn from_manifest(manifest: Manifest, store: Arc<FileStore>) -> Result<Self, String> {
        let signature = parse_signature(&manifest.signature)?;
        if signature.name != manifest.predicate {
            return Err(format!(
                "manifest predicate {} does not match signature {}",
                manifest.predicate, signature.name
            ));
        }
        if manifest.command.is_empty() {
            return Err("empty command".into());
        }
        Ok(ExecWrapper {
            signature,
            command: manifest.command,
            outputs: manifest.outputs,
            timeout: Duration::from_secs(manifest.timeout_secs.unwrap_or(120)),
            store,
        })
    }

    /// Scratch file name for an output argument.
    fn output_name(&self, arg: &str) -> String {
        self.outputs
            .get(arg)
            .cloned()
            .unwrap_or_else(|| format!("{arg}.out"))
    }

    fn render_value(term: &Term) -> String {
        match term {
            Term::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    async fn run(&self, goal: &Literal, scratch: &Path) -> Result<Outcome, String> {
        let mut placeholders: HashMap<String, String> = HashMap::new();
        // (output variable name, arg spec name, path the tool writes)
        let mut out_files: Vec<(String, PathBuf)> = Vec::new();
        let mut out_values: Vec<String> = Vec::new();

        for (spec, arg) in self.signature.args.iter().zip(&goal.args) {
            match (spec.mode, spec.kind) {
                (Mode::Out, Kind::File) => {
                    let var = arg.as_var().ok_or("output argument not a variable")?;
                    let path = scratch.join(self.output_name(&spec.name));
                    placeholders.insert(spec.name.clone(), path.display().to_string());
                    out_files.push((var.to_string(), path));
                }
                (Mode::Out, _) => {
                    let var = arg.as_var().ok_or("output argument not a variable")?;
                    out_values.push(var.to_string());
                }
                (_, Kind::File) => {
                    let fr = arg.as_file_ref().ok_or("file argument not a reference")?;
                    let path = self
                        .store
                        .materialize(fr, scratch)
                        .map_err(|e| e.to_string())?;
                    placeholders.insert(spec.name.clone(), path.display().to_string());
                }
                (_, Kind::Files) => {
                    let mut paths = Vec::new();
                    if let Term::List(items) = arg {
                        for item in items {
                            let fr = item.as_file_ref().ok_or("files argument not references")?;
                            let path = self
                                .store
                                .materialize(fr, scratch)
                                .map_err(|e| e.to_string())?;
                            paths.push(path.display().to_string());
                        }
                    }
                    placeholders.insert(spec.name.clone(), paths.join(" "));
                }
                _ => {
                    placeholders.insert(spec.name.clone(), Self::render_value(arg));
                }
            }
        }

        let argv: Vec<String> = self
            .command
            .iter()
            .map(|part| {
                let mut rendered = part.clone();
                for (name, value) in &placeholders {
                    rendered = rendered.replace(&format!("{{{name}}}"), value);
                }
                rendered
            })
            .filter(|part| !part.is_empty())
            .collect();

        debug!(wrapper = %self.signature.name, ?argv, "invoking external tool");
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(scratch)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("failed to launch {}: {e}", argv[0])),
            Err(_) => {
                return Err(format!(
                    "{} exceeded its deadline of {:?}",
                    self.signature.name, self.timeout
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(Outcome::Errors(vec![format!(
                "{} exited with {}: {}",
                self.signature.name,
                output.status,
                stderr.trim()
            )]));
        }

        let mut binding = Subst::new();
        for (var, path) in out_files {
            let bytes = std::fs::read(&path)
                .map_err(|e| format!("tool produced no output at {}: {e}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "out".to_string());
            let fr = self.store.put(&bytes, &name).map_err(|e| e.to_string())?;
            binding.bind(var, Term::FileRef(fr));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        for var in out_values {
            binding.bind(var, Term::Str(stdout.clone()));
        }

        if binding.is_empty() {
            Ok(Outcome::Success)
        } else {
            Ok(Outcome::Substitutions(vec![binding]))
        }
    }
}

#[async_trait]
impl Wrapper for ExecWrapper {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    async fn resolve(&self, goal: &Literal) -> Outcome {
        let scratch = match self.store.scratch_dir() {
            Ok(dir) => dir,
            Err(e) => return Outcome::Errors(vec![e.to_string()]),
        };
        let outcome = match self.run(goal, &scratch).await {
            Ok(outcome) => outcome,
            Err(msg) => Outcome::Errors(vec![msg]),
        };
        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            warn!(dir = %scratch.display(), error = %e, "could not remove scratch dir");
        }
        outcome
    }
}

/// Load every `*.toml` manifest in `dir` into the registry. Malformed
/// manifests are skipped with a warning; the node still starts.
pub fn load_wrapper_dir(
    dir: &Path,
    registry: &super::WrapperRegistry,
    store: &Arc<FileStore>,
) -> std::io::Result<usize> {
    let mut loaded = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let text = std::fs::read_to_string(&path)?;
        let manifest: Manifest = match toml::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping malformed wrapper manifest");
                continue;
            }
        };
        match ExecWrapper::from_manifest(manifest, Arc::clone(store)) {
            Ok(wrapper) => {
                registry.register(Arc::new(wrapper));
                loaded += 1;
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping wrapper manifest");
            }
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrappers::WrapperRegistry;
    use tempfile::TempDir;

    fn store() -> (Arc<FileStore>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(tmp.path()).unwrap());
        (store, tmp)
    }

    #[test]
    fn test_load_wrapper_dir() {
        let (store, _keep_store) = store();
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("echo.toml"),
            r#"
predicate = "shout"
signature = "shout(+text: value, -reply: value)"
command = ["echo", "{text}"]
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let registry = WrapperRegistry::new();
        let loaded = load_wrapper_dir(dir.path(), &registry, &store).unwrap();
        assert_eq!(loaded, 1);
        assert!(registry.contains("shout"));
    }

    #[test]
    fn test_mismatched_manifest_is_skipped() {
        let (store, _keep_store) = store();
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("bad.toml"),
            r#"
predicate = "one_name"
signature = "another_name(+x: value)"
command = ["true"]
"#,
        )
        .unwrap();
        let registry = WrapperRegistry::new();
        let loaded = load_wrapper_dir(dir.path(), &registry, &store).unwrap();
        assert_eq!(loaded, 0);
    }

    #[tokio::test]
    async fn test_exec_wrapper_binds_stdout() {
        let (store, _keep_store) = store();
        let manifest = Manifest {
            predicate: "shout".into(),
            signature: "shout(+text: value, -reply: value)".into(),
            command: vec!["echo".into(), "{text}".into()],
            outputs: HashMap::new(),
            timeout_secs: Some(10),
        };
        let wrapper = ExecWrapper::from_manifest(manifest, store).unwrap();
        let goal = crate::term::parse_literal("shout(\"hello\", Reply)").unwrap();
        match wrapper.resolve(&goal).await {
            Outcome::Substitutions(substs) => {
                assert_eq!(substs.len(), 1);
                assert_eq!(substs[0].get("Reply"), Some(&Term::Str("hello".into())));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exec_wrapper_failure_is_errors_outcome() {
        let (store, _keep_store) = store();
        let manifest = Manifest {
            predicate: "fail".into(),
            signature: "fail(+x: value)".into(),
            command: vec!["false".into()],
            outputs: HashMap::new(),
            timeout_secs: Some(10),
        };
        let wrapper = ExecWrapper::from_manifest(manifest, store).unwrap();
        let goal = crate::term::parse_literal("fail(1)").unwrap();
        assert!(matches!(wrapper.resolve(&goal).await, Outcome::Errors(_)));
    }
}
