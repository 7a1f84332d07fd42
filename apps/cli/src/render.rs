//! Terminal views of runs, lessons and quizzes.

use coursesmith_core::pipeline::{LessonRef, PipelineRun, Stage};
use coursesmith_core::{
    AnswerState, LessonBody, LessonDetail, LessonOutline, Overview, Question, Quiz, QuizProgress,
};
use coursesmith_storage::RunRecord;

/// Print the run header and whatever the current stage has produced.
pub(crate) fn show(run: &PipelineRun) {
    println!();
    println!("  Run:     {}", run.id);
    println!("  Title:   {}", run.title().unwrap_or_else(|| "untitled".into()));
    println!("  Stage:   {}", run.stage);
    println!("  Profile: {}", run.profile);

    if !run.warnings.is_empty() {
        println!();
        for warning in &run.warnings {
            println!("  ! {warning}");
        }
    }

    if let Some(overview) = &run.artifact.overview {
        println!();
        overview_view(overview);
    }

    let artifact = &run.artifact;
    if !artifact.sections.is_empty() {
        println!();
        println!(
            "  Sections ({} min in total):",
            artifact.total_minutes()
        );
        for (s_idx, section) in artifact.sections.iter().enumerate() {
            let marker = match run.current_section() {
                Some(current) if run.stage == Stage::Lessons && current.id == section.id => ">",
                _ => " ",
            };
            println!(
                "  {marker} {}. {} ({} min)",
                s_idx + 1,
                section.title,
                section.estimated_time
            );

            let pending = run.stage == Stage::Lessons
                && s_idx == run.section_index
                && run.scratch.is_some();
            for (l_idx, lesson) in run.section_outlines(s_idx).iter().enumerate() {
                lesson_line(run, LessonRef { section: s_idx, lesson: l_idx }, lesson, pending);
            }
        }
    }

    println!();
    println!("  Next: {}", next_step(run));
    println!();
}

fn overview_view(overview: &Overview) {
    match overview {
        Overview::Structured(info) => {
            println!("  {}", info.course_name);
            if !info.description.is_empty() {
                println!("  {}", info.description);
            }
            if !info.prerequisites.is_empty() {
                println!("  Prerequisites: {}", info.prerequisites);
            }
            for outcome in &info.learning_outcomes {
                println!("   - {outcome}");
            }
        }
        Overview::Prose(text) => {
            for line in text.trim().lines() {
                println!("  {line}");
            }
        }
    }
}

fn lesson_line(run: &PipelineRun, at: LessonRef, lesson: &LessonOutline, pending: bool) {
    let detail = run.artifact.details.get(&lesson.id);
    let quiz = detail.and_then(|d| run.artifact.quizzes.get(&d.id));
    let mut tags = Vec::new();
    if pending {
        tags.push("pending".to_string());
    }
    if detail.is_some() {
        tags.push("content".to_string());
    }
    if let Some(quiz) = quiz {
        let progress = quiz.progress();
        tags.push(format!("quiz {}/{}", progress.correct, progress.total));
    }
    let tags = if tags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", tags.join(", "))
    };
    println!("      {at} {} ({} min){tags}", lesson.title, lesson.duration);
}

fn next_step(run: &PipelineRun) -> &'static str {
    match run.stage {
        Stage::Intake => "coursesmith new --run <ID> --input <FILE>",
        Stage::StructureDiscovery => "coursesmith generate",
        Stage::Overview | Stage::Sections => {
            "coursesmith confirm, or coursesmith regenerate / revert"
        }
        Stage::Lessons if run.scratch.is_some() => {
            "coursesmith confirm to accept this section's lessons, or coursesmith regenerate"
        }
        Stage::Lessons => "coursesmith generate",
        Stage::Complete => "coursesmith lesson <S.L>, coursesmith quiz <S.L> or coursesmith export",
    }
}

/// Print a lesson's generated content.
pub(crate) fn lesson_detail(at: LessonRef, outline: &LessonOutline, detail: &LessonDetail) {
    println!();
    println!("  {at} {} ({} min, {} words)", outline.title, outline.duration, detail.word_count);
    if let Some(instruction) = &detail.instruction {
        println!("  Instruction: {instruction}");
    }
    if let Some(warning) = &detail.warning {
        println!("  ! {warning}");
    }
    println!();

    match &detail.body {
        LessonBody::Markdown(text) => println!("{}", text.trim()),
        LessonBody::Structured(content) => {
            println!("{}", content.overview);
            if !content.key_points.is_empty() {
                println!("\nKey concepts:");
                for point in &content.key_points {
                    println!("  - {}: {}", point.concept, point.explanation);
                }
            }
            if !content.examples.is_empty() {
                println!("\nExamples:");
                for example in &content.examples {
                    println!("  - {example}");
                }
            }
            if !content.takeaways.is_empty() {
                println!("\nTakeaways:");
                for takeaway in &content.takeaways {
                    println!("  - {takeaway}");
                }
            }
        }
    }
    println!();
}

/// Print a quiz with the learner's answers so far.
pub(crate) fn quiz(at: LessonRef, quiz: &Quiz) {
    println!();
    println!("  Quiz for lesson {at}");
    println!();
    for (q_idx, (question, state)) in quiz.questions.iter().zip(&quiz.answers).enumerate() {
        let mark = match state {
            AnswerState::Unanswered => " ",
            AnswerState::Correct => "✓",
            AnswerState::Incorrect => "✗",
        };
        match question {
            Question::MultiChoice {
                question, options, ..
            } => {
                println!("  {mark} {}. {question}", q_idx + 1);
                for (o_idx, option) in options.iter().enumerate() {
                    println!("       {}) {option}", o_idx + 1);
                }
            }
            Question::TrueFalse { statement, .. } => {
                println!("  {mark} {}. True or false: {statement}", q_idx + 1);
            }
        }
    }
    println!();
    progress_line(quiz.progress());
}

/// Print the result of one answer.
pub(crate) fn answer(state: AnswerState, explanation: Option<&str>, progress: QuizProgress) {
    println!();
    match state {
        AnswerState::Correct => println!("  ✓ Correct"),
        _ => println!("  ✗ Incorrect"),
    }
    if let Some(explanation) = explanation {
        println!("  {explanation}");
    }
    progress_line(progress);
}

fn progress_line(progress: QuizProgress) {
    println!(
        "  Score: {}/{} ({} answered)",
        progress.correct, progress.total, progress.answered
    );
    if progress.is_mastered() {
        println!("  All questions answered correctly.");
    } else if progress.is_complete() {
        println!("  Quiz finished. Use `coursesmith quiz <S.L> --reset` to try again.");
    }
    println!();
}

/// Print saved runs, most recently updated first.
pub(crate) fn run_list(runs: &[RunRecord]) {
    if runs.is_empty() {
        println!("No saved runs. Start one with `coursesmith new --input <FILE>`.");
        return;
    }
    println!();
    println!("  {:<36}  {:<20}  {:<20}  TITLE", "ID", "STAGE", "UPDATED");
    for run in runs {
        println!(
            "  {:<36}  {:<20}  {:<20}  {}",
            run.id,
            run.stage,
            run.updated_at.get(..19).unwrap_or(&run.updated_at),
            run.title
        );
    }
    println!();
}
