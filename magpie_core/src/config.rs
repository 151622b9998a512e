use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

pub fn default_threads() -> usize {
    16
}
pub fn default_batch_size() -> usize {
    crate::index::DEFAULT_BATCH_SIZE
}
fn default_stats_interval_secs() -> u64 {
    30
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            batch_size: default_batch_size(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct IndexSettings {
    pub csv_path: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FetchSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retry_initial_secs")]
    pub retry_initial_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
}

fn default_base_url() -> String {
    "https://data.commoncrawl.org".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_retry_initial_secs() -> u64 {
    1
}
fn default_retry_max_secs() -> u64 {
    1024
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_initial_secs: default_retry_initial_secs(),
            retry_max_secs: default_retry_max_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    /// Target argv; `{}` in an argument is replaced with the testcase path.
    pub command: Vec<String>,
    /// Name the instrumented binary writes artifacts under.
    pub binary_name: String,
    #[serde(default = "default_target_timeout_ms")]
    pub timeout_ms: u64,
    /// `KEY=VALUE` environment assignment enabling coverage in the child.
    #[serde(default = "default_coverage_env")]
    pub coverage_env: String,
}

fn default_target_timeout_ms() -> u64 {
    30_000
}
fn default_coverage_env() -> String {
    "ASAN_OPTIONS=coverage=1".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Extension for testcase and corpus files (e.g. `pdf`, `png`).
    pub file_format: String,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("out")
}
fn default_scratch_dir() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CheckpointSettings {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Optional checkpoint to resume from.
    #[serde(default)]
    pub resume: Option<PathBuf>,
}

pub fn default_state_file() -> PathBuf {
    PathBuf::from("state.json")
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            resume: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MagpieConfig {
    #[serde(default)]
    pub run: RunSettings,
    pub index: IndexSettings,
    #[serde(default)]
    pub fetch: FetchSettings,
    pub target: TargetSettings,
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
}

impl MagpieConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: MagpieConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
