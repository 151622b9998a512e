pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod envelope;
pub mod fetch;
pub mod harness;
pub mod index;
pub mod session;
pub mod store;
pub mod universe;

pub use cancel::CancelToken;
pub use checkpoint::{Checkpoint, CheckpointError};
pub use config::MagpieConfig;
pub use envelope::{EnvelopeError, extract};
pub use fetch::{FetchClient, FetchError, HttpFetchClient, RetryPolicy};
pub use harness::{CoverageReport, Harness, HarnessError, SancovHarness, SancovHarnessConfig};
pub use index::{CsvIndexSource, IndexCursor, IndexError, IndexRecord, IndexSource, StreamPosition};
pub use session::{RunSummary, Session, SessionConfig, SessionError, StatsSnapshot};
pub use store::{CorpusStore, StoreError};
pub use universe::{Admission, CoverageUniverse};
