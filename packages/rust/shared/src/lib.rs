//! Shared types, error model, and configuration for coursesmith.
//!
//! This crate is the foundation depended on by all other coursesmith crates.
//! It provides:
//! - [`CourseError`], the unified error type
//! - Domain types ([`UserInput`], [`IntakeForm`], [`ReferenceMaterial`], identifiers)
//! - Configuration ([`AppConfig`], [`GenerationSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, GenerationConfig, GenerationSettings, IngestConfig, IntakeConfig,
    OpenAiConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    resolve_api_key,
};
pub use error::{CourseError, ErrorKind, Result};
pub use types::{
    AgeRange, Audience, AudienceForm, CATEGORIES, CATEGORY_OTHER, DetailId, Familiarity,
    GenerationProfile, IntakeForm, LessonId, MainContent, ReferenceMaterial, RunId, SectionId,
    StructureParams, UserInput,
};
