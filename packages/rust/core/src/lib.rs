//! Course generation pipeline for coursesmith.
//!
//! This crate ties the normalizer, ingestion and model backend together into
//! the staged generation flow: context assembly, step execution, the course
//! artifact tree and the pipeline state machine, plus persistence and export.

pub mod artifact;
pub mod context;
pub mod executor;
pub mod export;
pub mod persist;
pub mod pipeline;
pub mod prompts;

pub use artifact::{
    Answer, AnswerState, CourseArtifact, CourseInfo, KeyPoint, LessonBody, LessonContent,
    LessonDetail, LessonOutline, Overview, Question, Quiz, QuizProgress, Section,
};
pub use context::{Context, ContextBuilder, total_lessons_needed};
pub use executor::{StageExecutor, StageReply, Step};
pub use export::{export_markdown, write_export};
pub use persist::{
    claim_run, database_path, load_latest, load_run, save_and_release, save_run,
};
pub use pipeline::{
    AttemptOutcome, DiscoveryOptions, LessonRef, Pipeline, PipelineRun, ProgressReporter,
    SilentProgress, Stage, StageAttempt,
};
