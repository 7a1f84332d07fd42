//! Markdown export of a run's course artifact.

use std::fmt::Write as _;
use std::path::Path;

use tracing::{debug, instrument};

use coursesmith_shared::{CourseError, Result};

use crate::artifact::{LessonBody, Overview, Question};
use crate::pipeline::PipelineRun;

/// Render overview, sections, lessons, lesson content and quiz questions.
pub fn export_markdown(run: &PipelineRun) -> String {
    let artifact = &run.artifact;
    let mut out = String::new();

    match &artifact.overview {
        Some(Overview::Structured(info)) => {
            let _ = writeln!(out, "# {}\n", info.course_name);
            if !info.description.is_empty() {
                let _ = writeln!(out, "{}\n", info.description);
            }
            if !info.prerequisites.is_empty() {
                let _ = writeln!(out, "**Prerequisites:** {}\n", info.prerequisites);
            }
            if !info.learning_outcomes.is_empty() {
                out.push_str("## Learning Outcomes\n\n");
                for outcome in &info.learning_outcomes {
                    let _ = writeln!(out, "- {outcome}");
                }
                out.push('\n');
            }
        }
        Some(Overview::Prose(text)) => {
            let _ = writeln!(out, "{}\n", text.trim());
        }
        None => out.push_str("# Untitled course\n\n"),
    }

    if artifact.sections.is_empty() {
        return finish(out);
    }

    let _ = writeln!(
        out,
        "_{} sections, {} minutes in total._\n",
        artifact.sections.len(),
        artifact.total_minutes()
    );

    for (s_idx, section) in artifact.sections.iter().enumerate() {
        let _ = writeln!(
            out,
            "## {}. {} ({} min)\n",
            s_idx + 1,
            section.title,
            section.estimated_time
        );
        if !section.description.is_empty() {
            let _ = writeln!(out, "{}\n", section.description);
        }

        for (l_idx, lesson) in run.section_outlines(s_idx).iter().enumerate() {
            let _ = writeln!(
                out,
                "### {}.{} {} ({} min)\n",
                s_idx + 1,
                l_idx + 1,
                lesson.title,
                lesson.duration
            );
            if !lesson.brief.is_empty() {
                let _ = writeln!(out, "_{}_\n", lesson.brief);
            }

            let Some(detail) = artifact.details.get(&lesson.id) else {
                continue;
            };
            render_body(&mut out, &detail.body);

            if let Some(quiz) = artifact.quizzes.get(&detail.id) {
                out.push_str("#### Quiz\n\n");
                for (q_idx, question) in quiz.questions.iter().enumerate() {
                    render_question(&mut out, q_idx + 1, question);
                }
            }
        }
    }

    finish(out)
}

fn render_body(out: &mut String, body: &LessonBody) {
    match body {
        LessonBody::Markdown(text) => {
            // Nest the lesson's own headings below the lesson heading.
            for line in text.trim().lines() {
                if line.starts_with('#') {
                    let _ = writeln!(out, "###{line}");
                } else {
                    let _ = writeln!(out, "{line}");
                }
            }
            out.push('\n');
        }
        LessonBody::Structured(content) => {
            if !content.overview.is_empty() {
                let _ = writeln!(out, "{}\n", content.overview);
            }
            if !content.key_points.is_empty() {
                out.push_str("#### Key Concepts\n\n");
                for point in &content.key_points {
                    let _ = writeln!(out, "- **{}**: {}", point.concept, point.explanation);
                }
                out.push('\n');
            }
            if !content.examples.is_empty() {
                out.push_str("#### Examples\n\n");
                for example in &content.examples {
                    let _ = writeln!(out, "- {example}");
                }
                out.push('\n');
            }
            if !content.takeaways.is_empty() {
                out.push_str("#### Takeaways\n\n");
                for takeaway in &content.takeaways {
                    let _ = writeln!(out, "- {takeaway}");
                }
                out.push('\n');
            }
        }
    }
}

fn render_question(out: &mut String, number: usize, question: &Question) {
    match question {
        Question::MultiChoice {
            question, options, ..
        } => {
            let _ = writeln!(out, "{number}. {question}");
            for (i, option) in options.iter().enumerate() {
                let _ = writeln!(out, "   {}) {option}", option_letter(i));
            }
        }
        Question::TrueFalse { statement, .. } => {
            let _ = writeln!(out, "{number}. True or false: {statement}");
        }
    }
    out.push('\n');
}

fn option_letter(index: usize) -> char {
    u8::try_from(index)
        .ok()
        .filter(|i| *i < 26)
        .map(|i| char::from(b'a' + i))
        .unwrap_or('?')
}

fn finish(mut out: String) -> String {
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    out.push('\n');
    out
}

/// Write `content` to `path` via a temp file and rename.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn write_export(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CourseError::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "course.md".into());
    let temp = path.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&temp, content).map_err(|e| CourseError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| CourseError::io(path, e))?;

    debug!(size = content.len(), "wrote export");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{
        CourseInfo, KeyPoint, LessonContent, LessonDetail, LessonOutline, Quiz, Section,
    };
    use crate::pipeline::Stage;
    use coursesmith_shared::{DetailId, GenerationProfile};

    fn sample_run() -> PipelineRun {
        let mut run = PipelineRun::new(GenerationProfile::StrictStructure);
        run.stage = Stage::Complete;
        run.artifact.overview = Some(Overview::Structured(CourseInfo {
            course_name: "Beekeeping Basics".into(),
            description: "Learn to keep bees.".into(),
            prerequisites: "None".into(),
            learning_outcomes: vec!["Open a hive".into()],
        }));

        let section = Section::new("Hives", "Hive anatomy", 90);
        let lesson = LessonOutline::new("Frames", 45, "What frames do");
        let detail = LessonDetail {
            id: DetailId::new(),
            lesson_id: lesson.id,
            body: LessonBody::Structured(LessonContent {
                overview: "Frames hold comb.".into(),
                key_points: vec![KeyPoint {
                    concept: "Foundation".into(),
                    explanation: "Guides comb building".into(),
                }],
                examples: vec![],
                takeaways: vec!["Inspect frames weekly".into()],
            }),
            word_count: 10,
            instruction: None,
            warning: None,
        };
        let quiz = Quiz::new(
            detail.id,
            vec![
                Question::MultiChoice {
                    question: "What do frames hold?".into(),
                    options: vec!["Comb".into(), "Water".into()],
                    correct: 0,
                    explanation: None,
                },
                Question::TrueFalse {
                    statement: "Frames are optional.".into(),
                    correct: false,
                    explanation: None,
                },
            ],
        )
        .unwrap();

        run.artifact.lessons.insert(section.id, vec![lesson]);
        run.artifact.sections.push(section);
        run.artifact.quizzes.insert(detail.id, quiz);
        run.artifact.insert_detail(detail);
        run
    }

    #[test]
    fn renders_full_course() {
        let md = export_markdown(&sample_run());
        assert!(md.starts_with("# Beekeeping Basics\n"));
        assert!(md.contains("**Prerequisites:** None"));
        assert!(md.contains("## 1. Hives (90 min)"));
        assert!(md.contains("### 1.1 Frames (45 min)"));
        assert!(md.contains("- **Foundation**: Guides comb building"));
        assert!(md.contains("#### Quiz"));
        assert!(md.contains("   a) Comb"));
        assert!(md.contains("2. True or false: Frames are optional."));
        assert!(md.ends_with('\n') && !md.ends_with("\n\n"));
    }

    #[test]
    fn markdown_lessons_are_nested() {
        let mut run = sample_run();
        let section_id = run.artifact.sections[0].id;
        let lesson = run.artifact.section_lessons(section_id)[0].clone();
        let mut detail = run.artifact.details[&lesson.id].clone();
        detail.id = DetailId::new();
        detail.body = LessonBody::Markdown("# Frames\n\nBody text".into());
        run.artifact.insert_detail(detail);

        let md = export_markdown(&run);
        assert!(md.contains("#### Frames"));
        assert!(md.contains("Body text"));
        assert!(!md.contains("#### Quiz"));
    }

    #[test]
    fn empty_run_exports_placeholder() {
        let run = PipelineRun::new(GenerationProfile::StrictStructure);
        assert_eq!(export_markdown(&run), "# Untitled course\n");
    }

    #[test]
    fn write_export_replaces_file() {
        let dir = std::env::temp_dir().join(format!("cs_export_{}", uuid::Uuid::now_v7()));
        let path = dir.join("course.md");
        write_export(&path, "first\n").unwrap();
        write_export(&path, "second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
        assert!(!dir.join(".course.md.tmp").exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
