//! Runs the instrumented target against a candidate payload and collects the
//! coverage artifact it leaves behind.
//!
//! The target is a black box: it is spawned with the scratch-file path
//! substituted for a `{}` placeholder, coverage instrumentation is enabled
//! through an environment variable, and after exit it is expected to have
//! deposited an artifact named `{binary}.{pid}.sancov`. The artifact is a
//! sequence of 8-byte little-endian words whose first word is a format header
//! and whose remaining words are edge identifiers. Exit codes are ignored;
//! the artifact is the only signal the pipeline trusts, and its schema is
//! validated strictly before any content is used.

use crate::cancel::CancelToken;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum HarnessError {
    /// Shutdown became active while the target was running. Not an error;
    /// the artifact (if any) has already been discarded.
    #[error("target execution abandoned by shutdown")]
    Cancelled,

    /// The target produced no coverage artifact. It most likely crashed
    /// before flushing coverage, or the binary/flag configuration is wrong.
    /// Either way the experiment is misconfigured and must stop.
    #[error("coverage artifact missing at {0:?}")]
    MissingArtifact(PathBuf),

    /// The artifact exists but is not a whole number of 8-byte records.
    /// Malformed instrumentation output is a configuration bug, not a
    /// per-file problem.
    #[error("coverage artifact {path:?} has length {len}, not a multiple of 8")]
    MalformedArtifact { path: PathBuf, len: u64 },

    /// The target exceeded its wall-clock budget and was killed. Treated the
    /// same as a missing artifact: a hung target means the setup is wrong.
    #[error("target exceeded {0:?} and was killed")]
    Timeout(Duration),

    #[error("failed to spawn target {command:?}: {message}")]
    Spawn { command: String, message: String },

    #[error("harness I/O error: {0}")]
    Io(String),
}

impl HarnessError {
    /// Whether this failure must shut the whole run down. Everything except
    /// cooperative cancellation is process-wide fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HarnessError::Cancelled)
    }
}

/// Outcome of one target execution: the decoded edge set plus the raw
/// artifact bytes, which are persisted next to an admitted corpus entry.
#[derive(Debug, Clone)]
pub struct CoverageReport {
    pub edges: HashSet<u64>,
    pub artifact: Vec<u8>,
}

/// Executes one candidate payload on behalf of worker `worker`.
///
/// Scratch paths are partitioned by worker index, so implementations are
/// shared by reference across the pool without locking.
pub trait Harness: Send + Sync {
    fn run(
        &self,
        worker: usize,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<CoverageReport, HarnessError>;

    /// Called once when a worker exits; removes its scratch state.
    fn cleanup(&self, worker: usize) {
        let _ = worker;
    }
}

#[derive(Debug, Clone)]
pub struct SancovHarnessConfig {
    /// Target argv; every occurrence of `{}` in an argument is replaced with
    /// the scratch file path.
    pub command: Vec<String>,
    /// Name the instrumented binary uses when writing artifacts, i.e. the
    /// `{binary}` in `{binary}.{pid}.sancov`.
    pub target_binary: String,
    /// Extension for scratch files, matching what the target expects.
    pub file_format: String,
    /// Directory scratch files live in.
    pub scratch_dir: PathBuf,
    /// Wall-clock budget per execution before the child is killed.
    pub timeout: Duration,
    /// Environment variable that switches instrumentation on in the child.
    pub coverage_env: (String, String),
}

/// Harness for SanitizerCoverage-instrumented targets.
pub struct SancovHarness {
    config: SancovHarnessConfig,
}

impl SancovHarness {
    pub fn new(config: SancovHarnessConfig) -> Self {
        Self { config }
    }

    fn scratch_path(&self, worker: usize) -> PathBuf {
        self.config
            .scratch_dir
            .join(format!("test{}.{}", worker, self.config.file_format))
    }

    fn artifact_path(&self, pid: u32) -> PathBuf {
        PathBuf::from(format!("{}.{}.sancov", self.config.target_binary, pid))
    }

    fn wait_with_timeout(&self, mut child: Child) -> Result<(), HarnessError> {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(_status)) => return Ok(()),
                Ok(None) => {
                    if start.elapsed() > self.config.timeout {
                        if let Err(e) = child.kill() {
                            return Err(HarnessError::Io(format!(
                                "failed to kill timed-out target: {e}"
                            )));
                        }
                        let _ = child.wait();
                        return Err(HarnessError::Timeout(self.config.timeout));
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(HarnessError::Io(format!("error waiting for target: {e}")));
                }
            }
        }
    }
}

impl Harness for SancovHarness {
    fn run(
        &self,
        worker: usize,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<CoverageReport, HarnessError> {
        let scratch = self.scratch_path(worker);
        fs::write(&scratch, payload)
            .map_err(|e| HarnessError::Io(format!("failed to write {scratch:?}: {e}")))?;

        let scratch_str = scratch.to_string_lossy();
        let argv: Vec<String> = self
            .config
            .command
            .iter()
            .map(|arg| arg.replace("{}", &scratch_str))
            .collect();

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env(&self.config.coverage_env.0, &self.config.coverage_env.1)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|e| HarnessError::Spawn {
            command: argv.join(" "),
            message: e.to_string(),
        })?;
        let pid = child.id();
        let artifact = self.artifact_path(pid);

        // An in-flight child is allowed to finish naturally even during
        // shutdown; the cancellation check happens after the wait.
        self.wait_with_timeout(child)?;

        if cancel.is_cancelled() {
            let _ = fs::remove_file(&artifact);
            return Err(HarnessError::Cancelled);
        }

        let data =
            fs::read(&artifact).map_err(|_| HarnessError::MissingArtifact(artifact.clone()))?;
        let _ = fs::remove_file(&artifact);

        if data.len() % 8 != 0 {
            return Err(HarnessError::MalformedArtifact {
                path: artifact,
                len: data.len() as u64,
            });
        }

        let edges = decode_edges(&data);
        debug!(worker, pid, edges = edges.len(), "target execution complete");
        Ok(CoverageReport {
            edges,
            artifact: data,
        })
    }

    fn cleanup(&self, worker: usize) {
        let _ = fs::remove_file(self.scratch_path(worker));
    }
}

/// Decodes edge identifiers from a validated artifact. The first 8-byte word
/// is a format/count header and is skipped.
pub(crate) fn decode_edges(data: &[u8]) -> HashSet<u64> {
    data.chunks_exact(8)
        .skip(1)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect()
}

/// Builds artifact bytes in the on-disk schema. Shared with the session
/// tests' fake harness.
#[cfg(test)]
pub(crate) fn encode_artifact(edges: &[u64]) -> Vec<u8> {
    let mut data = Vec::with_capacity((edges.len() + 1) * 8);
    data.extend_from_slice(&(edges.len() as u64).to_le_bytes());
    for edge in edges {
        data.extend_from_slice(&edge.to_le_bytes());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh_harness(dir: &Path, script: String, timeout: Duration) -> SancovHarness {
        SancovHarness::new(SancovHarnessConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script],
            target_binary: dir.join("target_bin").to_string_lossy().into_owned(),
            file_format: "bin".to_string(),
            scratch_dir: dir.to_path_buf(),
            timeout,
            coverage_env: ("ASAN_OPTIONS".to_string(), "coverage=1".to_string()),
        })
    }

    #[test]
    fn run_collects_edges_and_returns_raw_artifact() {
        let dir = tempdir().unwrap();
        let canned = dir.path().join("canned.sancov");
        fs::write(&canned, encode_artifact(&[7, 9, 7])).unwrap();

        // The script plays the instrumented target: it copies a canned
        // artifact to the path the harness derives from its own pid.
        let prefix = dir.path().join("target_bin").to_string_lossy().into_owned();
        let script = format!("cp {} {}.$$.sancov", canned.display(), prefix);
        let harness = sh_harness(dir.path(), script, Duration::from_secs(5));

        let cancel = CancelToken::new();
        let report = harness.run(0, b"payload bytes", &cancel).unwrap();
        assert_eq!(report.edges, HashSet::from([7, 9]));
        assert_eq!(report.artifact, encode_artifact(&[7, 9, 7]));

        // Scratch file carried the payload and survives for the next
        // iteration; cleanup removes it.
        let scratch = dir.path().join("test0.bin");
        assert_eq!(fs::read(&scratch).unwrap(), b"payload bytes");
        harness.cleanup(0);
        assert!(!scratch.exists());
    }

    #[test]
    fn missing_artifact_is_fatal() {
        let dir = tempdir().unwrap();
        let harness = sh_harness(dir.path(), "true".to_string(), Duration::from_secs(5));
        let err = harness.run(0, b"x", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, HarnessError::MissingArtifact(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn artifact_with_ragged_length_is_fatal() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("target_bin").to_string_lossy().into_owned();
        let script = format!("printf 'short' > {}.$$.sancov", prefix);
        let harness = sh_harness(dir.path(), script, Duration::from_secs(5));
        let err = harness.run(0, b"x", &CancelToken::new()).unwrap_err();
        match err {
            HarnessError::MalformedArtifact { len, .. } => assert_eq!(len, 5),
            other => panic!("expected MalformedArtifact, got {other:?}"),
        }
    }

    #[test]
    fn hung_target_is_killed_and_reported() {
        let dir = tempdir().unwrap();
        let harness = sh_harness(dir.path(), "sleep 30".to_string(), Duration::from_millis(100));
        let err = harness.run(0, b"x", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, HarnessError::Timeout(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn cancellation_discards_artifact_without_fatal() {
        let dir = tempdir().unwrap();
        let canned = dir.path().join("canned.sancov");
        fs::write(&canned, encode_artifact(&[1])).unwrap();
        let prefix = dir.path().join("target_bin").to_string_lossy().into_owned();
        let script = format!("cp {} {}.$$.sancov", canned.display(), prefix);
        let harness = sh_harness(dir.path(), script, Duration::from_secs(5));

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = harness.run(0, b"x", &cancel).unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled));
        assert!(!err.is_fatal());
    }

    #[test]
    fn unknown_binary_fails_to_spawn() {
        let dir = tempdir().unwrap();
        let harness = SancovHarness::new(SancovHarnessConfig {
            command: vec!["./no_such_binary_12345".to_string(), "{}".to_string()],
            target_binary: "no_such_binary_12345".to_string(),
            file_format: "bin".to_string(),
            scratch_dir: dir.path().to_path_buf(),
            timeout: Duration::from_secs(1),
            coverage_env: ("ASAN_OPTIONS".to_string(), "coverage=1".to_string()),
        });
        let err = harness.run(0, b"x", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, HarnessError::Spawn { .. }));
    }

    #[test]
    fn decode_skips_header_word_and_collapses_duplicates() {
        let data = encode_artifact(&[0xAAAA, 0xBBBB, 0xAAAA]);
        assert_eq!(decode_edges(&data), HashSet::from([0xAAAA, 0xBBBB]));
        // Header-only artifact decodes to an empty edge set.
        assert!(decode_edges(&encode_artifact(&[])).is_empty());
    }
}
