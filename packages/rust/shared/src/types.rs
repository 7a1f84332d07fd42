//! Core domain types for coursesmith runs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CourseError, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

entity_id!(
    /// Identifies one pipeline run.
    RunId
);
entity_id!(
    /// Identifies a generated section, independent of its title.
    SectionId
);
entity_id!(
    /// Identifies a generated lesson outline.
    LessonId
);
entity_id!(
    /// Identifies a generated lesson detail; quizzes hang off this key.
    DetailId
);

// ---------------------------------------------------------------------------
// GenerationProfile
// ---------------------------------------------------------------------------

/// Output-shape profile selected at intake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationProfile {
    /// Overview and lesson detail are requested as JSON objects.
    #[default]
    StrictStructure,
    /// Overview and lesson detail are requested as delimited Markdown.
    FreeformMarkdown,
}

impl GenerationProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrictStructure => "strict-structure",
            Self::FreeformMarkdown => "freeform-markdown",
        }
    }
}

impl std::fmt::Display for GenerationProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GenerationProfile {
    type Err = CourseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict-structure" | "strict" => Ok(Self::StrictStructure),
            "freeform-markdown" | "freeform" | "markdown" => Ok(Self::FreeformMarkdown),
            other => Err(CourseError::validation(format!(
                "unknown profile '{other}': expected 'strict-structure' or 'freeform-markdown'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

/// Category label that requires a custom label to be supplied.
pub const CATEGORY_OTHER: &str = "Other";

/// Predefined course categories offered at intake.
pub const CATEGORIES: &[&str] = &[
    "Default",
    "Mathematics",
    "Physics",
    "Chemistry",
    "Biology",
    "Computer Science",
    "Engineering",
    "Data Science",
    "Visual Arts",
    "Music",
    "Literature",
    "Creative Writing",
    "Photography",
    "Film & Media",
    "Design",
    "English",
    "Spanish",
    "Mandarin",
    "Japanese",
    "French",
    "German",
    "Arabic",
    "Business",
    "Marketing",
    "Finance",
    "Project Management",
    "Leadership",
    "Communication",
    "Entrepreneurship",
    "Philosophy",
    "Psychology",
    "History",
    "Political Science",
    "Environmental Studies",
    "Health & Wellness",
    "Personal Development",
    CATEGORY_OTHER,
];

/// Learner familiarity with the subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Familiarity {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

/// The intake form as submitted, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeForm {
    #[serde(default)]
    pub language: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// Required when `category` is "Other".
    #[serde(default)]
    pub custom_category: Option<String>,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default)]
    pub audience: AudienceForm,
    #[serde(default)]
    pub structure: StructureParams,
    #[serde(default)]
    pub main_content: String,
}

impl Default for IntakeForm {
    fn default() -> Self {
        Self {
            language: String::new(),
            category: default_category(),
            custom_category: None,
            tone: default_tone(),
            audience: AudienceForm::default(),
            structure: StructureParams::default(),
            main_content: String::new(),
        }
    }
}

fn default_category() -> String {
    "Default".into()
}
fn default_tone() -> String {
    "Professional".into()
}

/// Audience fields of the intake form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudienceForm {
    #[serde(default = "default_start_age")]
    pub start_age: u32,
    #[serde(default = "default_end_age")]
    pub end_age: u32,
    #[serde(default)]
    pub familiarity: Familiarity,
}

impl Default for AudienceForm {
    fn default() -> Self {
        Self {
            start_age: default_start_age(),
            end_age: default_end_age(),
            familiarity: Familiarity::default(),
        }
    }
}

fn default_start_age() -> u32 {
    18
}
fn default_end_age() -> u32 {
    65
}

/// Course structure parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureParams {
    /// Total course duration in hours.
    #[serde(default = "default_course_duration")]
    pub course_duration: u32,
    /// Target lesson length in minutes.
    #[serde(default = "default_lesson_length")]
    pub lesson_length: u32,
    /// Target word count per lesson.
    #[serde(default = "default_word_count")]
    pub word_count: u32,
}

impl Default for StructureParams {
    fn default() -> Self {
        Self {
            course_duration: default_course_duration(),
            lesson_length: default_lesson_length(),
            word_count: default_word_count(),
        }
    }
}

fn default_course_duration() -> u32 {
    10
}
fn default_lesson_length() -> u32 {
    45
}
fn default_word_count() -> u32 {
    500
}

/// Validated per-run configuration. Serializes to the shape handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInput {
    pub language: String,
    /// Effective category (the custom label when "Other" was chosen).
    pub category: String,
    pub tone: String,
    pub audience: Audience,
    pub structure: StructureParams,
    pub content: MainContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audience {
    pub age_range: AgeRange,
    pub familiarity: Familiarity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainContent {
    pub main_content: String,
}

impl IntakeForm {
    /// Validate the form and produce the immutable [`UserInput`].
    ///
    /// Every problem is reported at once so the user can fix the form in one pass.
    pub fn validate(
        &self,
        reference_files: usize,
        require_source_material: bool,
    ) -> Result<UserInput> {
        let mut missing = Vec::new();
        let mut invalid = Vec::new();

        let language = self.language.trim();
        if language.is_empty() {
            missing.push("language");
        }

        let category = self.category.trim();
        let custom = self
            .custom_category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let effective_category = if category.eq_ignore_ascii_case(CATEGORY_OTHER) {
            match custom {
                Some(label) => label.to_string(),
                None => {
                    missing.push("custom category");
                    String::new()
                }
            }
        } else if category.is_empty() {
            missing.push("category");
            String::new()
        } else {
            category.to_string()
        };

        if require_source_material && self.main_content.trim().is_empty() && reference_files == 0
        {
            missing.push("main content or reference material");
        }

        let AudienceForm {
            start_age,
            end_age,
            familiarity,
        } = self.audience;
        if !(5..=100).contains(&start_age) || !(5..=100).contains(&end_age) {
            invalid.push("ages must be between 5 and 100".to_string());
        } else if start_age > end_age {
            invalid.push(format!("start age {start_age} exceeds end age {end_age}"));
        }

        let s = self.structure;
        if !(1..=40).contains(&s.course_duration) {
            invalid.push("course duration must be 1-40 hours".to_string());
        }
        if !(15..=120).contains(&s.lesson_length) {
            invalid.push("lesson length must be 15-120 minutes".to_string());
        }
        if !(100..=5000).contains(&s.word_count) {
            invalid.push("word count must be 100-5000".to_string());
        }

        if !missing.is_empty() || !invalid.is_empty() {
            let mut parts = Vec::new();
            if !missing.is_empty() {
                parts.push(format!("please fill in: {}", missing.join(", ")));
            }
            parts.extend(invalid);
            return Err(CourseError::validation(parts.join("; ")));
        }

        Ok(UserInput {
            language: language.to_string(),
            category: effective_category,
            tone: self.tone.trim().to_string(),
            audience: Audience {
                age_range: AgeRange {
                    start: start_age,
                    end: end_age,
                },
                familiarity,
            },
            structure: s,
            content: MainContent {
                main_content: self.main_content.clone(),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// ReferenceMaterial
// ---------------------------------------------------------------------------

/// Ingested reference content, owned by a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMaterial {
    /// Names of the files that contributed text.
    pub sources: Vec<String>,
    /// Concatenated extracted text.
    pub raw_content: String,
    /// Located table-of-contents excerpt, if a ToC heading was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toc_excerpt: Option<String>,
    /// Leading slice of the content used to calibrate depth.
    pub content_preview: String,
    /// SHA-256 of `raw_content`.
    pub content_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_form() -> IntakeForm {
        IntakeForm {
            language: "English".into(),
            main_content: "Intro to beekeeping".into(),
            ..IntakeForm::default()
        }
    }

    #[test]
    fn ids_roundtrip() {
        let id = SectionId::new();
        let parsed: SectionId = id.to_string().parse().expect("parse SectionId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn valid_form_produces_input() {
        let input = valid_form().validate(0, true).expect("valid");
        assert_eq!(input.language, "English");
        assert_eq!(input.category, "Default");
        assert_eq!(input.structure.lesson_length, 45);
        assert_eq!(input.audience.age_range, AgeRange { start: 18, end: 65 });
    }

    #[test]
    fn empty_language_is_rejected() {
        let form = IntakeForm {
            language: "   ".into(),
            ..valid_form()
        };
        let err = form.validate(0, true).unwrap_err();
        assert!(err.to_string().contains("language"));
    }

    #[test]
    fn other_category_requires_custom_label() {
        let mut form = IntakeForm {
            category: "Other".into(),
            ..valid_form()
        };
        let err = form.validate(0, true).unwrap_err();
        assert!(err.to_string().contains("custom category"));

        form.custom_category = Some("".into());
        assert!(form.validate(0, true).is_err());

        form.custom_category = Some("Beekeeping".into());
        let input = form.validate(0, true).expect("valid");
        assert_eq!(input.category, "Beekeeping");
    }

    #[test]
    fn source_material_requirement_follows_policy() {
        let form = IntakeForm {
            main_content: String::new(),
            ..valid_form()
        };
        assert!(form.validate(0, true).is_err());
        assert!(form.validate(1, true).is_ok());
        assert!(form.validate(0, false).is_ok());
    }

    #[test]
    fn all_missing_fields_reported_together() {
        let form = IntakeForm {
            language: String::new(),
            category: "Other".into(),
            ..IntakeForm::default()
        };
        let msg = form.validate(0, true).unwrap_err().to_string();
        assert!(msg.contains("language"));
        assert!(msg.contains("custom category"));
        assert!(msg.contains("main content"));
    }

    #[test]
    fn out_of_range_structure_rejected() {
        let mut form = valid_form();
        form.structure.lesson_length = 5;
        assert!(form.validate(0, true).is_err());

        let mut form = valid_form();
        form.audience.start_age = 70;
        form.audience.end_age = 20;
        assert!(form.validate(0, true).unwrap_err().to_string().contains("exceeds"));
    }

    #[test]
    fn user_input_serializes_nested_shape() {
        let input = valid_form().validate(0, true).unwrap();
        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(value["audience"]["age_range"]["start"], 18);
        assert_eq!(value["structure"]["lesson_length"], 45);
        assert_eq!(value["content"]["main_content"], "Intro to beekeeping");
        assert_eq!(value["audience"]["familiarity"], "Beginner");
    }

    #[test]
    fn intake_form_from_toml() {
        let toml_str = r#"
language = "Spanish"
category = "Other"
custom_category = "Cocina"

[structure]
course_duration = 4
lesson_length = 30
"#;
        let form: IntakeForm = toml::from_str(toml_str).expect("parse");
        let input = form.validate(1, true).expect("valid");
        assert_eq!(input.category, "Cocina");
        assert_eq!(input.structure.word_count, 500);
        assert_eq!(input.tone, "Professional");
    }

    #[test]
    fn profile_parses_aliases() {
        assert_eq!(
            "freeform".parse::<GenerationProfile>().unwrap(),
            GenerationProfile::FreeformMarkdown
        );
        assert_eq!(
            "strict-structure".parse::<GenerationProfile>().unwrap(),
            GenerationProfile::StrictStructure
        );
        assert!("xml".parse::<GenerationProfile>().is_err());
    }
}
