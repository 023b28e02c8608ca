pub mod error;
mod transcript;

pub use error::SessionError;
pub use transcript::{
    JsonlTranscript, NullTranscript, TranscriptEntry, TranscriptSink, create_run_dir,
};
