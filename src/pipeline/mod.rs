// Transform-and-deduplicate pipeline: fetch, normalize, dedup, load

pub mod dedup;
pub mod fetcher;
pub mod loader;
pub mod normalize;
pub mod orchestrator;

pub use dedup::{Deduplicator, ExistingKeySet};
pub use fetcher::RecordFetcher;
pub use loader::{LoadOutcome, Loader};
pub use normalize::FieldNormalizer;
pub use orchestrator::{Orchestrator, RunOptions, RunOutcome, RunReport};
