//! Prompt templates, one per generation step.
//!
//! Each template is sent verbatim, followed by the serialized stage context.
//! Strict-structure templates pin a JSON shape; freeform templates ask for
//! Markdown wrapped in `<content>` tags.

/// System instructions for the per-run assistant.
pub const ASSISTANT_INSTRUCTIONS: &str = "\
You are an expert course designer. You detect the structure of reference material, \
adapt explanations to the stated audience and familiarity level, keep the requested \
tone throughout, and break complex topics into small teachable steps. Always write in \
the language given in the context. When reference files are attached, search them \
before relying on general knowledge.";

/// Table-of-contents extraction. The reply is free text or the sentinel.
pub const TOC_EXTRACTION: &str = "\
Analyse the reference material in the context and extract its structure.

If it contains a table of contents or a clear chapter/heading hierarchy, reply with that \
outline only, one entry per line, keeping the original numbering and nesting.

If no usable structure exists, reply with exactly: NO_STRUCTURE_FOUND";

/// Course overview as a JSON object.
pub const COURSE_INFO_JSON: &str = r#"Create the course overview for the learner parameters in the context.
Everything must be written in the specified language and suit the audience's familiarity level.
If an extracted structure or content preview is present, base the course on it.

RULES:
1. course_name: at most 10 words, clear and engaging.
2. description: 50-100 words.
3. prerequisites: what learners should already know.
4. learning_outcomes: 3-5 concrete outcomes.

Reply with JSON only, in this shape:
{
    "course_name": "...",
    "description": "...",
    "prerequisites": "...",
    "learning_outcomes": ["...", "..."]
}"#;

/// Course overview as delimited Markdown.
pub const COURSE_INFO_MARKDOWN: &str = "\
Create the course overview for the learner parameters in the context.
Everything must be written in the specified language and suit the audience's familiarity level.
If an extracted structure or content preview is present, base the course on it.

Write Markdown with:
- an H1 course title of at most 10 words
- a 50-100 word description
- a Prerequisites section
- a Learning Outcomes section with 3-5 bullet points

Wrap the whole overview in <content></content> tags.";

/// Section list. Always structured.
pub const SECTION_GENERATION: &str = r#"Split the course described in the context into sections.
Everything must be written in the specified language.

RULES:
1. Section estimated_time values are minutes and must add up to the course duration
   (structure.course_duration is in hours).
2. Sections follow a clear progression from the prerequisites to the learning outcomes.
3. If an extracted structure is present, follow its chapter order.

Reply with JSON only, in this shape:
{
    "sections": [
        {
            "title": "...",
            "description": "...",
            "estimated_time": 120
        }
    ]
}"#;

/// Lesson outlines for one section. Always structured.
pub const LESSON_GENERATION: &str = r#"Create lesson outlines for the single section given in the context.
Everything must be written in the specified language.

RULES:
1. Produce exactly total_lessons_needed lessons.
2. Each lesson lasts about structure.lesson_length minutes; durations add up to
   current_section_time.
3. Each brief is 1-2 sentences describing what the lesson covers.

Reply with JSON only, in this shape:
{
    "lessons": [
        {
            "title": "...",
            "duration": 45,
            "brief": "..."
        }
    ]
}"#;

/// Full lesson content as a JSON object.
pub const LESSON_DETAIL_JSON: &str = r#"Write the full content of the lesson given in the context, using the reference material when available.
Everything must be written in the specified language and suit the audience's familiarity level.
Aim for structure.word_count words in total. Follow custom_instruction if present.

Include a clear explanation, 3-5 key concepts, practical examples and the main takeaways.

Reply with JSON only, in this shape:
{
    "lesson_content": {
        "overview": "...",
        "key_points": [
            { "concept": "...", "explanation": "..." }
        ],
        "examples": ["..."],
        "takeaways": ["..."]
    }
}"#;

/// Full lesson content as delimited Markdown.
pub const LESSON_DETAIL_MARKDOWN: &str = "\
Write the full content of the lesson given in the context, using the reference material when available.
Everything must be written in the specified language and suit the audience's familiarity level.
Aim for structure.word_count words in total. Follow custom_instruction if present.

Write Markdown starting with the lesson title as an H1, then sections for the explanation, \
key concepts, examples and takeaways.

Wrap the whole lesson in <content></content> tags.";

/// Quiz for one lesson. Always structured.
pub const QUIZ_GENERATION: &str = r#"Write a short quiz on the lesson in the context.
Everything must be written in the specified language.

RULES:
1. 2-3 multiple-choice questions and 1-2 true/false statements.
2. Match difficulty to the lesson: recall for beginners, application and reasoning for
   advanced learners.
3. "correct" is the zero-based index of the right option for multiple choice, and a
   boolean for true/false.

Reply with JSON only, in this shape:
{
    "questions": [
        {
            "type": "multi_choice",
            "question": "...",
            "options": ["...", "...", "...", "..."],
            "correct": 0,
            "explanation": "..."
        },
        {
            "type": "true_false",
            "statement": "...",
            "correct": true,
            "explanation": "..."
        }
    ]
}"#;
