//! The course artifact tree and quiz answer state.
//!
//! Entities are keyed by generated identifiers, never by titles, so two
//! lessons that share a title never collide. Only the pipeline mutates the
//! tree; the cascade helpers here keep children from outliving their parents.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use coursesmith_shared::{CourseError, DetailId, LessonId, Result, SectionId};

// ---------------------------------------------------------------------------
// Overview
// ---------------------------------------------------------------------------

/// Structured course overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseInfo {
    pub course_name: String,
    pub description: String,
    #[serde(default)]
    pub prerequisites: String,
    #[serde(default)]
    pub learning_outcomes: Vec<String>,
}

/// Course overview, structured or prose depending on the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "value", rename_all = "snake_case")]
pub enum Overview {
    Structured(CourseInfo),
    Prose(String),
}

impl Overview {
    /// Course name, or the first H1 of a prose overview.
    pub fn title(&self) -> Option<String> {
        match self {
            Self::Structured(info) => Some(info.course_name.clone()),
            Self::Prose(text) => first_heading(text),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections and lessons
// ---------------------------------------------------------------------------

/// A course section. Order in the artifact is course progression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub title: String,
    pub description: String,
    /// Minutes.
    pub estimated_time: u32,
}

impl Section {
    pub fn new(title: impl Into<String>, description: impl Into<String>, estimated_time: u32) -> Self {
        Self {
            id: SectionId::new(),
            title: title.into(),
            description: description.into(),
            estimated_time,
        }
    }
}

/// A lesson outline within a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonOutline {
    pub id: LessonId,
    pub title: String,
    /// Minutes.
    pub duration: u32,
    pub brief: String,
}

impl LessonOutline {
    pub fn new(title: impl Into<String>, duration: u32, brief: impl Into<String>) -> Self {
        Self {
            id: LessonId::new(),
            title: title.into(),
            duration,
            brief: brief.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lesson detail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub concept: String,
    pub explanation: String,
}

/// Structured lesson content.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LessonContent {
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub key_points: Vec<KeyPoint>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub takeaways: Vec<String>,
}

/// Lesson body, structured or Markdown depending on the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "value", rename_all = "snake_case")]
pub enum LessonBody {
    Structured(LessonContent),
    Markdown(String),
}

impl LessonBody {
    /// All prose in the body, for word counting.
    pub fn plain_text(&self) -> String {
        match self {
            Self::Markdown(text) => text.clone(),
            Self::Structured(content) => {
                let mut parts = vec![content.overview.clone()];
                for point in &content.key_points {
                    parts.push(point.concept.clone());
                    parts.push(point.explanation.clone());
                }
                parts.extend(content.examples.iter().cloned());
                parts.extend(content.takeaways.iter().cloned());
                parts.join("\n")
            }
        }
    }

    pub fn word_count(&self) -> usize {
        self.plain_text().split_whitespace().count()
    }
}

/// Generated content for one lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonDetail {
    pub id: DetailId,
    pub lesson_id: LessonId,
    pub body: LessonBody,
    pub word_count: usize,
    /// Free-text instruction the detail was generated with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    /// Word-count deviation warning, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

// ---------------------------------------------------------------------------
// Quiz
// ---------------------------------------------------------------------------

/// One quiz question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Question {
    #[serde(alias = "multiple_choice")]
    MultiChoice {
        question: String,
        options: Vec<String>,
        /// Zero-based index into `options`.
        correct: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
    },
    TrueFalse {
        #[serde(alias = "question")]
        statement: String,
        correct: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
    },
}

impl Question {
    pub fn prompt(&self) -> &str {
        match self {
            Self::MultiChoice { question, .. } => question,
            Self::TrueFalse { statement, .. } => statement,
        }
    }

    pub fn explanation(&self) -> Option<&str> {
        match self {
            Self::MultiChoice { explanation, .. } | Self::TrueFalse { explanation, .. } => {
                explanation.as_deref()
            }
        }
    }
}

/// A learner's answer to one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// Zero-based option index.
    Choice(usize),
    TrueFalse(bool),
}

/// Per-question answer state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerState {
    #[default]
    Unanswered,
    Correct,
    Incorrect,
}

/// Quiz progress summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuizProgress {
    pub correct: usize,
    pub answered: usize,
    pub total: usize,
}

impl QuizProgress {
    pub fn is_complete(&self) -> bool {
        self.answered == self.total
    }

    pub fn is_mastered(&self) -> bool {
        self.correct == self.total
    }
}

/// Questions for one lesson detail plus the learner's answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quiz {
    pub detail_id: DetailId,
    pub questions: Vec<Question>,
    pub answers: Vec<AnswerState>,
}

impl Quiz {
    /// Build a quiz, rejecting questions whose answer key is out of range.
    pub fn new(detail_id: DetailId, questions: Vec<Question>) -> Result<Self> {
        if questions.is_empty() {
            return Err(CourseError::validation("quiz has no questions"));
        }
        for (i, q) in questions.iter().enumerate() {
            if let Question::MultiChoice {
                options, correct, ..
            } = q
            {
                if options.is_empty() || *correct >= options.len() {
                    return Err(CourseError::validation(format!(
                        "question {} has an invalid answer key",
                        i + 1
                    )));
                }
            }
        }
        let answers = vec![AnswerState::Unanswered; questions.len()];
        Ok(Self {
            detail_id,
            questions,
            answers,
        })
    }

    /// Check `answer` against question `index` (zero-based) and record the result.
    pub fn answer(&mut self, index: usize, answer: Answer) -> Result<AnswerState> {
        let question = self.questions.get(index).ok_or_else(|| {
            CourseError::NotFound(format!("question {} (quiz has {})", index + 1, self.questions.len()))
        })?;

        let is_correct = match (question, answer) {
            (Question::MultiChoice { options, correct, .. }, Answer::Choice(choice)) => {
                if choice >= options.len() {
                    return Err(CourseError::validation(format!(
                        "choice {} is out of range (1-{})",
                        choice + 1,
                        options.len()
                    )));
                }
                choice == *correct
            }
            (Question::TrueFalse { correct, .. }, Answer::TrueFalse(value)) => value == *correct,
            (Question::MultiChoice { .. }, Answer::TrueFalse(_)) => {
                return Err(CourseError::validation(
                    "multiple-choice questions take an option number",
                ));
            }
            (Question::TrueFalse { .. }, Answer::Choice(_)) => {
                return Err(CourseError::validation(
                    "true/false questions take 'true' or 'false'",
                ));
            }
        };

        let state = if is_correct {
            AnswerState::Correct
        } else {
            AnswerState::Incorrect
        };
        self.answers[index] = state;
        Ok(state)
    }

    /// Clear every answer.
    pub fn reset(&mut self) {
        self.answers.fill(AnswerState::Unanswered);
    }

    pub fn progress(&self) -> QuizProgress {
        QuizProgress {
            correct: self
                .answers
                .iter()
                .filter(|a| **a == AnswerState::Correct)
                .count(),
            answered: self
                .answers
                .iter()
                .filter(|a| **a != AnswerState::Unanswered)
                .count(),
            total: self.questions.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// CourseArtifact
// ---------------------------------------------------------------------------

/// Accumulated generation results for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CourseArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<Overview>,
    #[serde(default)]
    pub sections: Vec<Section>,
    /// Accepted lesson outlines per section.
    #[serde(default)]
    pub lessons: BTreeMap<SectionId, Vec<LessonOutline>>,
    #[serde(default)]
    pub details: BTreeMap<LessonId, LessonDetail>,
    #[serde(default)]
    pub quizzes: BTreeMap<DetailId, Quiz>,
}

impl CourseArtifact {
    /// Replace the section list, discarding every lesson, detail and quiz.
    pub fn replace_sections(&mut self, sections: Vec<Section>) {
        self.clear_sections();
        self.sections = sections;
    }

    /// Drop sections and everything generated under them. The overview stays.
    pub fn clear_sections(&mut self) {
        self.sections.clear();
        self.lessons.clear();
        self.details.clear();
        self.quizzes.clear();
    }

    /// Drop the accepted lessons of one section, with their details and quizzes.
    pub fn remove_section_lessons(&mut self, section: SectionId) -> Vec<LessonOutline> {
        let removed = self.lessons.remove(&section).unwrap_or_default();
        self.remove_details(removed.iter().map(|l| l.id));
        removed
    }

    /// Drop details (and their quizzes) for the given lessons.
    pub fn remove_details(&mut self, lessons: impl IntoIterator<Item = LessonId>) {
        for lesson in lessons {
            if let Some(detail) = self.details.remove(&lesson) {
                self.quizzes.remove(&detail.id);
            }
        }
    }

    /// Store a detail, dropping the previous detail's quiz for the same lesson.
    pub fn insert_detail(&mut self, detail: LessonDetail) {
        if let Some(old) = self.details.insert(detail.lesson_id, detail) {
            self.quizzes.remove(&old.id);
        }
    }

    /// Accepted lessons for a section, in order.
    pub fn section_lessons(&self, id: SectionId) -> &[LessonOutline] {
        self.lessons.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn quiz_for_lesson(&self, lesson: LessonId) -> Option<&Quiz> {
        self.details
            .get(&lesson)
            .and_then(|detail| self.quizzes.get(&detail.id))
    }

    /// Total estimated course time in minutes.
    pub fn total_minutes(&self) -> u32 {
        self.sections.iter().map(|s| s.estimated_time).sum()
    }
}

/// Text of the first level-one Markdown heading.
pub fn first_heading(markdown: &str) -> Option<String> {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^#[ \t]+(.+?)[ \t#]*$").expect("valid regex"));

    H1_RE
        .captures(markdown)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail_for(lesson: &LessonOutline) -> LessonDetail {
        LessonDetail {
            id: DetailId::new(),
            lesson_id: lesson.id,
            body: LessonBody::Markdown("# Hives\n\nBees live here.".into()),
            word_count: 4,
            instruction: None,
            warning: None,
        }
    }

    fn sample_quiz() -> Quiz {
        Quiz::new(
            DetailId::new(),
            vec![
                Question::MultiChoice {
                    question: "Who lays eggs?".into(),
                    options: vec!["Drone".into(), "Queen".into(), "Worker".into()],
                    correct: 1,
                    explanation: None,
                },
                Question::TrueFalse {
                    statement: "Workers are female.".into(),
                    correct: true,
                    explanation: Some("All workers are female.".into()),
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn same_titles_do_not_collide() {
        let a = LessonOutline::new("Introduction", 45, "");
        let b = LessonOutline::new("Introduction", 45, "");
        let mut artifact = CourseArtifact::default();
        artifact.insert_detail(detail_for(&a));
        artifact.insert_detail(detail_for(&b));
        assert_eq!(artifact.details.len(), 2);
    }

    #[test]
    fn replacing_sections_cascades() {
        let mut artifact = CourseArtifact {
            overview: Some(Overview::Prose("# Bees".into())),
            ..CourseArtifact::default()
        };
        let section = Section::new("Basics", "", 90);
        let lesson = LessonOutline::new("Hives", 45, "");
        let detail = detail_for(&lesson);
        let quiz = Quiz {
            detail_id: detail.id,
            ..sample_quiz()
        };
        artifact.sections.push(section.clone());
        artifact.lessons.insert(section.id, vec![lesson]);
        artifact.quizzes.insert(detail.id, quiz);
        artifact.insert_detail(detail);

        artifact.replace_sections(vec![Section::new("Advanced", "", 60)]);

        assert_eq!(artifact.sections.len(), 1);
        assert!(artifact.lessons.is_empty());
        assert!(artifact.details.is_empty());
        assert!(artifact.quizzes.is_empty());
        assert_eq!(artifact.overview, Some(Overview::Prose("# Bees".into())));
    }

    #[test]
    fn removing_section_lessons_leaves_others() {
        let mut artifact = CourseArtifact::default();
        let s1 = Section::new("One", "", 45);
        let s2 = Section::new("Two", "", 45);
        let l1 = LessonOutline::new("A", 45, "");
        let l2 = LessonOutline::new("B", 45, "");
        artifact.insert_detail(detail_for(&l1));
        artifact.insert_detail(detail_for(&l2));
        artifact.lessons.insert(s1.id, vec![l1]);
        artifact.lessons.insert(s2.id, vec![l2.clone()]);

        let removed = artifact.remove_section_lessons(s1.id);
        assert_eq!(removed.len(), 1);
        assert_eq!(artifact.section_lessons(s2.id), &[l2.clone()]);
        assert!(artifact.details.contains_key(&l2.id));
        assert_eq!(artifact.details.len(), 1);
    }

    #[test]
    fn new_detail_drops_old_quiz() {
        let lesson = LessonOutline::new("Hives", 45, "");
        let mut artifact = CourseArtifact::default();
        let first = detail_for(&lesson);
        let first_id = first.id;
        artifact.insert_detail(first);
        artifact.quizzes.insert(
            first_id,
            Quiz {
                detail_id: first_id,
                ..sample_quiz()
            },
        );

        artifact.insert_detail(detail_for(&lesson));
        assert!(artifact.quizzes.is_empty());
        assert!(artifact.quiz_for_lesson(lesson.id).is_none());
    }

    #[test]
    fn quiz_answers_and_progress() {
        let mut quiz = sample_quiz();
        assert_eq!(quiz.progress().answered, 0);

        assert_eq!(quiz.answer(0, Answer::Choice(0)).unwrap(), AnswerState::Incorrect);
        assert_eq!(quiz.answer(1, Answer::TrueFalse(true)).unwrap(), AnswerState::Correct);
        let progress = quiz.progress();
        assert!(progress.is_complete());
        assert!(!progress.is_mastered());
        assert_eq!(progress.correct, 1);

        // Retrying overwrites the earlier answer.
        assert_eq!(quiz.answer(0, Answer::Choice(1)).unwrap(), AnswerState::Correct);
        assert!(quiz.progress().is_mastered());

        quiz.reset();
        assert_eq!(quiz.progress().answered, 0);
    }

    #[test]
    fn quiz_rejects_bad_answers() {
        let mut quiz = sample_quiz();
        assert!(quiz.answer(5, Answer::Choice(0)).is_err());
        assert!(quiz.answer(0, Answer::Choice(3)).is_err());
        assert!(quiz.answer(0, Answer::TrueFalse(true)).is_err());
        assert!(quiz.answer(1, Answer::Choice(0)).is_err());
        assert_eq!(quiz.progress().answered, 0);
    }

    #[test]
    fn quiz_rejects_out_of_range_key() {
        let questions = vec![Question::MultiChoice {
            question: "?".into(),
            options: vec!["a".into()],
            correct: 2,
            explanation: None,
        }];
        assert!(Quiz::new(DetailId::new(), questions).is_err());
        assert!(Quiz::new(DetailId::new(), vec![]).is_err());
    }

    #[test]
    fn question_accepts_aliases() {
        let q: Question = serde_json::from_str(
            r#"{"type": "multiple_choice", "question": "?", "options": ["a", "b"], "correct": 1}"#,
        )
        .unwrap();
        assert!(matches!(q, Question::MultiChoice { correct: 1, .. }));

        let q: Question =
            serde_json::from_str(r#"{"type": "true_false", "question": "Sky is blue", "correct": true}"#)
                .unwrap();
        assert_eq!(q.prompt(), "Sky is blue");
    }

    #[test]
    fn first_heading_found() {
        assert_eq!(
            first_heading("intro\n# Pollination Basics\n## More").as_deref(),
            Some("Pollination Basics")
        );
        assert!(first_heading("## Only H2").is_none());
    }

    #[test]
    fn structured_word_count_covers_all_parts() {
        let body = LessonBody::Structured(LessonContent {
            overview: "one two".into(),
            key_points: vec![KeyPoint {
                concept: "three".into(),
                explanation: "four five".into(),
            }],
            examples: vec!["six".into()],
            takeaways: vec!["seven".into()],
        });
        assert_eq!(body.word_count(), 7);
    }

    #[test]
    fn artifact_snapshot_roundtrip() {
        let mut artifact = CourseArtifact::default();
        let section = Section::new("Basics", "Start here", 90);
        artifact
            .lessons
            .insert(section.id, vec![LessonOutline::new("Hives", 45, "What a hive is")]);
        artifact.sections.push(section);

        let json = serde_json::to_string(&artifact).unwrap();
        let back: CourseArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(back, artifact);
    }
}
