// ========================================================================================
//
//                       PROCESS-BACKED CLASSIFIER HOSTS
//
// ========================================================================================
//
// The classifier packages live outside this crate. Each family is hosted by an
// external command named in the runner configuration:
//
// - ALLSorts and TALLSorts hosts are one-shot: they are started with file
//   arguments, print one JSON document on stdout, and exit.
// - The Bridge host is a long-lived service speaking line-delimited JSON over its
//   stdin/stdout. It announces its feature list and options in a handshake line,
//   then answers one line per request until stdin is closed.
//
// A non-zero exit, a malformed document, or a protocol violation is a `RunnerError`.

use crate::adapters::bridge::{ArtifactSet, BridgeConnector, BridgeOptions, BridgeService};
use crate::adapters::flat::FlatClassifier;
use crate::adapters::hierarchical::HierarchicalClassifier;
use crate::config::CommandSpec;
use crate::graph::{self, GraphError, ObjectRef};
use crate::matrix::{FeatureMatrix, MatrixError};
use crate::native::{BridgeNative, FlatNative, HierarchicalNative};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;

/// How long a Bridge service may take to exit after its stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

const SAMPLES_FILE: &str = "samples.csv";
const MODEL_FILE: &str = "model.json";

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to start classifier host '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("IO error while talking to the classifier host: {0}")]
    Io(#[from] io::Error),
    #[error("Classifier host '{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("Classifier host produced output that could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Classifier host protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Runs a one-shot host to completion and decodes its stdout.
fn run_host<T: DeserializeOwned>(spec: &CommandSpec, args: &[OsString]) -> Result<T, RunnerError> {
    log::debug!("Running {} {:?} {:?}", spec.program, spec.args, args);
    let output = spec
        .command()
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(RunnerError::Failed {
            program: spec.program.clone(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

/// A scratch directory holding the files handed to a host.
fn scratch() -> Result<TempDir, RunnerError> {
    Ok(tempfile::Builder::new().prefix("subtyper-").tempdir()?)
}

/// ALLSorts, hosted by an external command.
///
/// The artifact is decoded at construction so the adapter can patch it; the
/// patched graph is re-encoded for the host on every prediction.
pub struct ProcessFlatClassifier {
    command: CommandSpec,
    artifact: ObjectRef,
    model_dir: PathBuf,
    workdir: TempDir,
}

impl ProcessFlatClassifier {
    pub fn open(command: CommandSpec, model: &Path, model_dir: &Path) -> Result<Self, RunnerError> {
        let artifact = graph::load_artifact(model)?;
        Ok(Self {
            command,
            artifact,
            model_dir: model_dir.to_path_buf(),
            workdir: scratch()?,
        })
    }
}

impl FlatClassifier for ProcessFlatClassifier {
    fn artifact(&self) -> &ObjectRef {
        &self.artifact
    }

    fn run_predictions(
        &mut self,
        samples: &FeatureMatrix,
        parents: bool,
    ) -> Result<FlatNative, RunnerError> {
        let samples_path = self.workdir.path().join(SAMPLES_FILE);
        let model_path = self.workdir.path().join(MODEL_FILE);
        samples.write_csv(&samples_path)?;
        graph::save_artifact(&self.artifact, &model_path)?;

        let mut args: Vec<OsString> = vec![
            "--input-csv".into(),
            samples_path.into(),
            "--model".into(),
            model_path.into(),
            "--model-dir".into(),
            self.model_dir.clone().into(),
        ];
        if parents {
            args.push("--parents".into());
        }
        run_host(&self.command, &args)
    }
}

/// TALLSorts, hosted by an external command.
pub struct ProcessHierarchicalClassifier {
    command: CommandSpec,
    model: PathBuf,
    workdir: TempDir,
}

impl ProcessHierarchicalClassifier {
    pub fn new(command: CommandSpec, model: &Path) -> Result<Self, RunnerError> {
        Ok(Self {
            command,
            model: model.to_path_buf(),
            workdir: scratch()?,
        })
    }
}

impl HierarchicalClassifier for ProcessHierarchicalClassifier {
    fn predict(&mut self, samples: &FeatureMatrix) -> Result<HierarchicalNative, RunnerError> {
        let samples_path = self.workdir.path().join(SAMPLES_FILE);
        samples.write_csv(&samples_path)?;
        let args: Vec<OsString> = vec![
            "--input-csv".into(),
            samples_path.into(),
            "--model".into(),
            self.model.clone().into(),
        ];
        run_host(&self.command, &args)
    }
}

/// Starts Bridge services as child processes.
pub struct ProcessBridgeConnector {
    command: CommandSpec,
}

impl ProcessBridgeConnector {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

fn artifact_args(artifacts: &ArtifactSet) -> Vec<OsString> {
    match artifacts {
        ArtifactSet::Bundle(bundle) => vec!["--bundle".into(), bundle.into()],
        ArtifactSet::Separate {
            checkpoint,
            metadata,
            classifier,
        } => vec![
            "--ckpt".into(),
            checkpoint.into(),
            "--meta".into(),
            metadata.into(),
            "--lr".into(),
            classifier.into(),
        ],
    }
}

#[derive(Deserialize)]
struct Handshake {
    rna_features: Vec<String>,
    #[serde(default)]
    options: BridgeOptions,
}

impl BridgeConnector for ProcessBridgeConnector {
    fn connect(
        &self,
        artifacts: &ArtifactSet,
        device: &str,
    ) -> Result<Box<dyn BridgeService>, RunnerError> {
        let mut child = self
            .command
            .command()
            .args(artifact_args(artifacts))
            .arg("--device")
            .arg(device)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, BufReader::new(stdout)),
            _ => {
                reap(&mut child);
                return Err(RunnerError::Protocol(
                    "Bridge service pipes were not available".to_string(),
                ));
            }
        };

        let mut service = ProcessBridgeService {
            program: self.command.program.clone(),
            child,
            stdin: Some(stdin),
            stdout,
            rna_features: Vec::new(),
            options: BridgeOptions::default(),
            closed: false,
        };
        // On failure the service is dropped here, which reaps the child.
        let handshake: Handshake = service.read_message()?;
        log::info!(
            "Bridge service ready with {} RNA features.",
            handshake.rna_features.len()
        );
        service.rna_features = handshake.rna_features;
        service.options = handshake.options;
        Ok(Box::new(service))
    }
}

/// One running Bridge service process.
pub struct ProcessBridgeService {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    rna_features: Vec<String>,
    options: BridgeOptions,
    closed: bool,
}

impl ProcessBridgeService {
    fn read_message<T: DeserializeOwned>(&mut self) -> Result<T, RunnerError> {
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            let status = self
                .child
                .try_wait()?
                .map_or_else(|| "no status".to_string(), |s| s.to_string());
            return Err(RunnerError::Protocol(format!(
                "Bridge service '{}' closed its output ({})",
                self.program, status
            )));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

impl BridgeService for ProcessBridgeService {
    fn predict_rna(&mut self, counts: &Path) -> Result<BridgeNative, RunnerError> {
        let request = serde_json::json!({ "predict_rna": counts.to_string_lossy() });
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RunnerError::Protocol("Bridge service is closed".to_string()))?;
        writeln!(stdin, "{request}")?;
        stdin.flush()?;
        self.read_message()
    }

    fn rna_features(&self) -> &[String] {
        &self.rna_features
    }

    fn options(&self) -> &BridgeOptions {
        &self.options
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Closing stdin is the service's signal to exit.
        drop(self.stdin.take());
        reap(&mut self.child);
    }
}

impl Drop for ProcessBridgeService {
    fn drop(&mut self) {
        self.close();
    }
}

/// Waits briefly for the child to exit, then kills it.
fn reap(child: &mut Child) {
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                log::debug!("Bridge service exited with {status}.");
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(SHUTDOWN_POLL),
            Ok(None) => break,
            Err(e) => {
                log::warn!("Could not poll Bridge service: {e}");
                break;
            }
        }
    }
    log::warn!("Bridge service did not exit after its input closed; killing it.");
    if let Err(e) = child.kill() {
        log::warn!("Failed to kill Bridge service: {e}");
    }
    let _ = child.wait();
}
