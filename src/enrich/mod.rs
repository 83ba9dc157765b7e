//! Post-ingest enrichment: title translation and summarisation.
//!
//! Providers are object-safe trait implementations selected from settings
//! at call time; the constructed instance is cached until the settings
//! tuple changes. The [`Orchestrator`] adds at-most-once semantics per
//! (article, kind) so concurrent requests coalesce onto a single outbound
//! call.

pub mod orchestrator;
pub mod summarize;
pub mod translate;

pub use orchestrator::{EnrichKind, Orchestrator};
pub use summarize::{summarize_local, SummaryLength, SummaryResult};
pub use translate::{EnrichError, Translator, TranslatorCache, TranslatorConfig};
