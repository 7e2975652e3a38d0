//! Sound analysis for visualization clients
//!
//! Played PCM is kept in a time-indexed [`RingCache`]; each client session
//! runs its own [`FrequencyAnalyzer`] over it to produce waveforms, spectra
//! and bass/mids/trebs summaries.

pub mod analysis;
pub mod cache;
pub mod output;

pub use analysis::{AnalysisParameters, FrequencyAnalyzer};
pub use cache::RingCache;
pub use output::{OutputObserver, VisualizationOutput};
