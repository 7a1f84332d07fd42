//! Per-stage context assembly.
//!
//! A context is a JSON object built from layers merged in a fixed order:
//! base user input, then stage fields, then extracted structure, then the
//! custom instruction. Later layers win on key conflicts. Everything here is
//! a pure function of its inputs.

use serde::Serialize;
use serde_json::{Map, Value, json};

use coursesmith_shared::{ReferenceMaterial, UserInput};

use crate::artifact::{LessonBody, LessonOutline, Overview, Section};

/// Stage context handed to the executor. Keys serialize in sorted order.
pub type Context = Map<String, Value>;

/// Lessons a section needs: `estimated_time / lesson_length`, at least one.
pub fn total_lessons_needed(estimated_time: u32, lesson_length: u32) -> u32 {
    if lesson_length == 0 {
        return 1;
    }
    (estimated_time / lesson_length).max(1)
}

/// Layered context builder.
#[derive(Debug, Default, Clone)]
pub struct ContextBuilder {
    base: Context,
    stage: Context,
    structure: Context,
    instruction: Option<String>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base layer: the user input, flattened to its top-level keys.
    pub fn input(mut self, input: &UserInput) -> Self {
        if let Value::Object(map) = to_value(input) {
            self.base.extend(map);
        }
        self
    }

    /// Stage layer field.
    pub fn field(mut self, key: &str, value: impl Serialize) -> Self {
        self.stage.insert(key.to_string(), to_value(&value));
        self
    }

    /// Structure layer: extracted ToC and content preview, when present.
    pub fn structure(
        mut self,
        extracted: Option<&str>,
        reference: Option<&ReferenceMaterial>,
    ) -> Self {
        if let Some(toc) = extracted.filter(|t| !t.trim().is_empty()) {
            self.structure
                .insert("extracted_structure".into(), Value::String(toc.to_string()));
        }
        if let Some(reference) = reference.filter(|r| !r.content_preview.is_empty()) {
            self.structure.insert(
                "content_preview".into(),
                Value::String(reference.content_preview.clone()),
            );
        }
        self
    }

    /// Top layer: the free-text instruction, ignored when blank.
    pub fn instruction(mut self, instruction: Option<&str>) -> Self {
        self.instruction = instruction
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .map(str::to_string);
        self
    }

    pub fn build(self) -> Context {
        let mut out = self.base;
        out.extend(self.stage);
        out.extend(self.structure);
        if let Some(instruction) = self.instruction {
            out.insert("custom_instruction".into(), Value::String(instruction));
        }
        out
    }
}

fn to_value(value: &impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Stage contexts
// ---------------------------------------------------------------------------

/// Context for table-of-contents extraction.
pub fn toc_context(reference: &ReferenceMaterial) -> Context {
    let mut builder = ContextBuilder::new().field("content", &reference.content_preview);
    if let Some(excerpt) = &reference.toc_excerpt {
        builder = builder.field("toc_excerpt", excerpt);
    }
    builder.build()
}

/// Context for the course overview.
pub fn overview_context(
    input: &UserInput,
    structure: Option<&str>,
    reference: Option<&ReferenceMaterial>,
) -> Context {
    ContextBuilder::new()
        .input(input)
        .structure(structure, reference)
        .build()
}

/// Context for the section list.
pub fn sections_context(
    input: &UserInput,
    overview: &Overview,
    structure: Option<&str>,
    reference: Option<&ReferenceMaterial>,
) -> Context {
    ContextBuilder::new()
        .input(input)
        .field("course_overview", overview_value(overview))
        .structure(structure, reference)
        .build()
}

/// Context for one section's lesson outlines.
pub fn lessons_context(
    input: &UserInput,
    overview: &Overview,
    section: &Section,
    structure: Option<&str>,
    reference: Option<&ReferenceMaterial>,
) -> Context {
    ContextBuilder::new()
        .input(input)
        .field("course_overview", overview_value(overview))
        .field(
            "current_section",
            json!({
                "title": section.title,
                "description": section.description,
                "estimated_time": section.estimated_time,
            }),
        )
        .field("current_section_time", section.estimated_time)
        .field(
            "total_lessons_needed",
            total_lessons_needed(section.estimated_time, input.structure.lesson_length),
        )
        .structure(structure, reference)
        .build()
}

/// Context for one lesson's full content.
pub fn lesson_detail_context(
    input: &UserInput,
    overview: &Overview,
    section: &Section,
    lesson: &LessonOutline,
    reference: Option<&ReferenceMaterial>,
    instruction: Option<&str>,
) -> Context {
    ContextBuilder::new()
        .input(input)
        .field("course_overview", overview_value(overview))
        .field("section_title", &section.title)
        .field(
            "lesson",
            json!({
                "title": lesson.title,
                "duration": lesson.duration,
                "brief": lesson.brief,
            }),
        )
        .structure(None, reference)
        .instruction(instruction)
        .build()
}

/// Context for a lesson quiz.
pub fn quiz_context(input: &UserInput, lesson_title: &str, body: &LessonBody) -> Context {
    let builder = ContextBuilder::new()
        .field("language", &input.language)
        .field("familiarity", input.audience.familiarity)
        .field("lesson_title", lesson_title);
    match body {
        LessonBody::Structured(content) => builder
            .field(
                "key_concepts",
                content
                    .key_points
                    .iter()
                    .map(|k| k.concept.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("takeaways", &content.takeaways)
            .build(),
        LessonBody::Markdown(text) => builder.field("lesson_content", text).build(),
    }
}

fn overview_value(overview: &Overview) -> Value {
    match overview {
        Overview::Structured(info) => to_value(info),
        Overview::Prose(text) => json!({ "course_info": text }),
    }
}
