//! Keyfall: piano-roll backend.
//!
//! Serves note data reconstructed from stored MIDI files and turns uploaded
//! audio into new MIDI files through an external converter, one job at a
//! time.

pub mod converter;
pub mod error;
pub mod job_system;
pub mod store;
pub mod telemetry;
pub mod web;

pub use converter::{CommandConverter, Converter, ConverterOutput};
pub use error::{ApiError, ApiResult};
pub use job_system::{
    EngineSettings, EngineStatus, Job, JobEngine, JobOutcome, JobStatus, SubmitOutcome,
};
pub use store::{sanitize_filename, MidiStore};
pub use web::{router, AppState};
