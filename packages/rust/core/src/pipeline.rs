//! Pipeline state machine: Intake → StructureDiscovery → Overview → Sections
//! → Lessons (per-section loop) → Complete.
//!
//! A [`Pipeline`] owns one [`PipelineRun`]. Generation work snapshots the
//! inputs it needs, talks to the backend without holding the run lock, and
//! commits only on success, so a failed attempt leaves the run exactly as it
//! was. At most one generation step is in flight per pipeline.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use coursesmith_backend::{DocumentIndex, IndexId, ModelBackend, SessionId, await_index_ready};
use coursesmith_ingest::{IngestOptions, ingest};
use coursesmith_shared::{
    CourseError, DetailId, GenerationProfile, GenerationSettings, IntakeForm, ReferenceMaterial,
    Result, RunId, UserInput,
};

use crate::artifact::{
    Answer, AnswerState, CourseArtifact, LessonBody, LessonDetail, LessonOutline, Overview, Quiz,
    QuizProgress, Section, first_heading,
};
use crate::context;
use crate::executor::{StageExecutor, Step};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Pipeline stage, in fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    StructureDiscovery,
    Overview,
    Sections,
    Lessons,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::StructureDiscovery => "structure_discovery",
            Self::Overview => "overview",
            Self::Sections => "sections",
            Self::Lessons => "lessons",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = CourseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "intake" => Ok(Self::Intake),
            "structure_discovery" => Ok(Self::StructureDiscovery),
            "overview" => Ok(Self::Overview),
            "sections" => Ok(Self::Sections),
            "lessons" => Ok(Self::Lessons),
            "complete" => Ok(Self::Complete),
            other => Err(CourseError::validation(format!("unknown stage '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// One generation attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    pub step: Step,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// LessonRef
// ---------------------------------------------------------------------------

/// Position of a lesson: zero-based section and lesson indexes.
///
/// Parsed from and displayed as the 1-based `section.lesson` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LessonRef {
    pub section: usize,
    pub lesson: usize,
}

impl std::fmt::Display for LessonRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.section + 1, self.lesson + 1)
    }
}

impl std::str::FromStr for LessonRef {
    type Err = CourseError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            CourseError::validation(format!(
                "invalid lesson reference '{s}': expected SECTION.LESSON, e.g. 2.1"
            ))
        };
        let (section, lesson) = s.trim().split_once('.').ok_or_else(invalid)?;
        let section: usize = section.parse().map_err(|_| invalid())?;
        let lesson: usize = lesson.parse().map_err(|_| invalid())?;
        if section == 0 || lesson == 0 {
            return Err(invalid());
        }
        Ok(Self {
            section: section - 1,
            lesson: lesson - 1,
        })
    }
}

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

/// Everything one pipeline run owns. Serializes as a single snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub profile: GenerationProfile,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<UserInput>,
    #[serde(default)]
    pub reference_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceMaterial>,
    /// Outline extracted from the reference material.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexId>,
    #[serde(default)]
    pub artifact: CourseArtifact,
    /// Section the lesson loop is on.
    #[serde(default)]
    pub section_index: usize,
    /// Outlines for the current section awaiting confirm or regenerate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch: Option<Vec<LessonOutline>>,
    #[serde(default)]
    pub history: Vec<StageAttempt>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(profile: GenerationProfile) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            profile,
            stage: Stage::Intake,
            input: None,
            reference_files: Vec::new(),
            reference: None,
            structure: None,
            session: None,
            index: None,
            artifact: CourseArtifact::default(),
            section_index: 0,
            scratch: None,
            history: Vec::new(),
            warnings: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Display title: the overview's course name, if any.
    pub fn title(&self) -> Option<String> {
        self.artifact.overview.as_ref().and_then(Overview::title)
    }

    /// Section the lesson loop is on, while in the Lessons stage.
    pub fn current_section(&self) -> Option<&Section> {
        (self.stage == Stage::Lessons)
            .then(|| self.artifact.sections.get(self.section_index))
            .flatten()
    }

    /// Outlines visible for a section: accepted ones, or the scratch list for
    /// the current section.
    pub fn section_outlines(&self, section: usize) -> &[LessonOutline] {
        if let Some(s) = self.artifact.sections.get(section) {
            if let Some(accepted) = self.artifact.lessons.get(&s.id) {
                return accepted;
            }
        }
        match &self.scratch {
            Some(scratch) if section == self.section_index => scratch,
            _ => &[],
        }
    }

    /// Resolve a lesson position.
    pub fn lesson(&self, at: LessonRef) -> Result<(&Section, &LessonOutline)> {
        let section = self
            .artifact
            .sections
            .get(at.section)
            .ok_or_else(|| CourseError::NotFound(format!("section {}", at.section + 1)))?;
        let lesson = self
            .section_outlines(at.section)
            .get(at.lesson)
            .ok_or_else(|| CourseError::NotFound(format!("lesson {at}")))?;
        Ok((section, lesson))
    }

    /// Record an answer to question `question` (zero-based) of a lesson's quiz.
    pub fn answer_quiz(
        &mut self,
        at: LessonRef,
        question: usize,
        answer: Answer,
    ) -> Result<(AnswerState, QuizProgress)> {
        let quiz = self.quiz_mut(at)?;
        let state = quiz.answer(question, answer)?;
        let progress = quiz.progress();
        self.touch();
        Ok((state, progress))
    }

    /// Clear every answer of a lesson's quiz.
    pub fn reset_quiz(&mut self, at: LessonRef) -> Result<&Quiz> {
        self.quiz_mut(at)?.reset();
        self.touch();
        self.quiz_mut(at).map(|quiz| &*quiz)
    }

    fn quiz_mut(&mut self, at: LessonRef) -> Result<&mut Quiz> {
        let lesson_id = self.lesson(at)?.1.id;
        let detail_id = self
            .artifact
            .details
            .get(&lesson_id)
            .map(|d| d.id)
            .ok_or_else(|| CourseError::NotFound(format!("content for lesson {at}")))?;
        self.artifact
            .quizzes
            .get_mut(&detail_id)
            .ok_or_else(|| CourseError::NotFound(format!("quiz for lesson {at}")))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting generation activity.
pub trait ProgressReporter: Send + Sync {
    /// Called when a model interaction starts.
    fn phase(&self, name: &str);
    /// Called when it resolves.
    fn done(&self, name: &str, ok: bool);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn done(&self, _name: &str, _ok: bool) {}
}

fn step_label(step: Step) -> &'static str {
    match step {
        Step::TocExtraction => "Extracting table of contents",
        Step::Overview => "Generating course overview",
        Step::Sections => "Generating sections",
        Step::Lessons => "Generating lesson outlines",
        Step::LessonDetail => "Writing lesson content",
        Step::Quiz => "Writing quiz",
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Options for [`Pipeline::discover_structure`].
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    pub ingest: IngestOptions,
    /// Build a searchable document index from the reference files.
    pub build_index: bool,
}

/// Releases the in-flight flag on drop.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Inputs every generation step reads.
struct StageInputs {
    session: SessionId,
    input: UserInput,
    profile: GenerationProfile,
    reference: Option<ReferenceMaterial>,
    structure: Option<String>,
}

/// Drives one [`PipelineRun`] through its stages.
pub struct Pipeline {
    run: Mutex<PipelineRun>,
    in_flight: AtomicBool,
    executor: StageExecutor,
    index: Option<Arc<dyn DocumentIndex>>,
    settings: GenerationSettings,
    progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    /// Start a fresh run with the configured profile.
    pub fn new(backend: Arc<dyn ModelBackend>, settings: GenerationSettings) -> Self {
        Self::resume(PipelineRun::new(settings.profile), backend, settings)
    }

    /// Continue an existing run.
    pub fn resume(
        run: PipelineRun,
        backend: Arc<dyn ModelBackend>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            run: Mutex::new(run),
            in_flight: AtomicBool::new(false),
            executor: StageExecutor::new(backend, &settings),
            index: None,
            settings,
            progress: Arc::new(SilentProgress),
        }
    }

    pub fn with_index(mut self, index: Arc<dyn DocumentIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// A copy of the current run state.
    pub fn snapshot(&self) -> PipelineRun {
        self.lock().clone()
    }

    pub fn id(&self) -> RunId {
        self.lock().id
    }

    pub fn stage(&self) -> Stage {
        self.lock().stage
    }

    /// Stop waiting on the in-flight step. The step fails with `Cancelled`
    /// and the run is left as it was before the step started.
    pub fn cancel(&self) {
        self.executor.cancel();
    }

    fn lock(&self) -> MutexGuard<'_, PipelineRun> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self, action: &str) -> Result<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| CourseError::StageInFlight {
                stage: format!("{action} ({})", self.stage()),
            })?;
        Ok(InFlight(&self.in_flight))
    }

    fn inputs(&self, action: &str) -> Result<StageInputs> {
        let run = self.lock();
        let (Some(session), Some(input)) = (run.session.clone(), run.input.clone()) else {
            return Err(CourseError::transition(action, run.stage));
        };
        Ok(StageInputs {
            session,
            input,
            profile: run.profile,
            reference: run.reference.clone(),
            structure: run.structure.clone(),
        })
    }

    fn require_stage(&self, action: &str, allowed: &[Stage]) -> Result<Stage> {
        let stage = self.stage();
        if allowed.contains(&stage) {
            Ok(stage)
        } else {
            Err(CourseError::transition(action, stage))
        }
    }

    /// Run one generation step, recording it in the attempt history.
    async fn attempt<T>(&self, step: Step, work: impl Future<Output = Result<T>>) -> Result<T> {
        let label = step_label(step);
        self.progress.phase(label);
        let start = Instant::now();
        let result = work.await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.progress.done(label, result.is_ok());

        let (outcome, error) = match &result {
            Ok(_) => {
                info!(%step, elapsed_ms, "step succeeded");
                (AttemptOutcome::Succeeded, None)
            }
            Err(e) => {
                warn!(%step, elapsed_ms, error = %e, "step failed");
                (AttemptOutcome::Failed, Some(e.to_string()))
            }
        };
        let mut run = self.lock();
        run.history.push(StageAttempt {
            step,
            outcome,
            error,
            elapsed_ms,
            at: Utc::now(),
        });
        run.touch();
        result
    }

    // -----------------------------------------------------------------------
    // Intake and structure discovery
    // -----------------------------------------------------------------------

    /// Validate the intake form and move to StructureDiscovery.
    #[instrument(skip_all, fields(run_id = %self.id(), files = files.len()))]
    pub fn submit_intake(&self, form: &IntakeForm, files: Vec<PathBuf>) -> Result<()> {
        let _guard = self.begin("submit intake")?;
        self.require_stage("submit intake", &[Stage::Intake])?;
        let input = form.validate(files.len(), self.settings.require_source_material)?;

        let mut run = self.lock();
        run.input = Some(input);
        run.reference_files = files;
        run.stage = Stage::StructureDiscovery;
        run.touch();
        info!("intake accepted");
        Ok(())
    }

    /// Ingest reference files, optionally build a document index, open the
    /// model session and extract a table of contents, then move to Overview.
    ///
    /// Unreadable files and a failed ToC extraction become warnings. A failed
    /// index build is fatal and leaves the run in StructureDiscovery.
    #[instrument(skip_all, fields(run_id = %self.id(), build_index = opts.build_index))]
    pub async fn discover_structure(&self, opts: &DiscoveryOptions) -> Result<()> {
        let _guard = self.begin("discover structure")?;
        self.require_stage("discover structure", &[Stage::StructureDiscovery])?;

        let (run_id, files, existing_session, existing_index) = {
            let run = self.lock();
            (
                run.id,
                run.reference_files.clone(),
                run.session.clone(),
                run.index.clone(),
            )
        };
        let mut warnings = Vec::new();

        let reference = if files.is_empty() {
            None
        } else {
            self.progress.phase("Reading reference material");
            let outcome = ingest(&files, &opts.ingest).await;
            self.progress.done("Reading reference material", outcome.material.is_some());
            for error in outcome.errors {
                warn!(%error, "reference file skipped");
                warnings.push(error);
            }
            if outcome.material.is_none() {
                warnings.push("no usable reference text; continuing without it".into());
            }
            outcome.material
        };

        let index = match (&self.index, existing_index) {
            (_, Some(id)) => Some(id),
            (Some(docs), None) if opts.build_index && !files.is_empty() => {
                Some(self.build_index(docs.as_ref(), run_id, &files).await?)
            }
            _ => None,
        };

        let session = match existing_session {
            Some(session) => session,
            None => match self.executor.backend().create_session(index.as_ref()).await {
                Ok(session) => session,
                Err(e) => {
                    if let (Some(docs), Some(id)) = (&self.index, &index) {
                        self.dispose_index(docs.as_ref(), id).await;
                    }
                    return Err(e);
                }
            },
        };

        let structure = match &reference {
            Some(material) => {
                let ctx = context::toc_context(material);
                match self
                    .attempt(Step::TocExtraction, self.executor.toc(&session, &ctx))
                    .await
                {
                    Ok(toc) => toc,
                    Err(e) => {
                        warnings.push(format!("table of contents extraction failed: {e}"));
                        None
                    }
                }
            }
            None => None,
        };

        let mut run = self.lock();
        info!(
            has_reference = reference.is_some(),
            has_structure = structure.is_some(),
            warnings = warnings.len(),
            "structure discovery finished"
        );
        run.reference = reference;
        run.structure = structure;
        run.session = Some(session);
        run.index = index;
        run.warnings.extend(warnings);
        run.stage = Stage::Overview;
        run.touch();
        Ok(())
    }

    async fn build_index(
        &self,
        docs: &dyn DocumentIndex,
        run_id: RunId,
        files: &[PathBuf],
    ) -> Result<IndexId> {
        self.progress.phase("Indexing reference files");
        let id = match docs.build_index(&format!("course-{run_id}"), files).await {
            Ok(id) => id,
            Err(e) => {
                self.progress.done("Indexing reference files", false);
                return Err(e);
            }
        };
        let ready = await_index_ready(
            docs,
            &id,
            self.settings.index_max_polls,
            self.settings.poll_interval,
        )
        .await;
        self.progress.done("Indexing reference files", ready.is_ok());
        match ready {
            Ok(()) => Ok(id),
            Err(e) => {
                self.dispose_index(docs, &id).await;
                Err(e)
            }
        }
    }

    async fn dispose_index(&self, docs: &dyn DocumentIndex, id: &IndexId) {
        if let Err(e) = docs.dispose(id).await {
            warn!(index = %id, error = %e, "failed to dispose document index");
        }
    }

    // -----------------------------------------------------------------------
    // Stage producers (no commit)
    // -----------------------------------------------------------------------

    async fn produce_overview(&self) -> Result<Overview> {
        let inp = self.inputs("generate the overview")?;
        let ctx = context::overview_context(
            &inp.input,
            inp.structure.as_deref(),
            inp.reference.as_ref(),
        );
        self.attempt(
            Step::Overview,
            self.executor.overview(&inp.session, inp.profile, &ctx),
        )
        .await
    }

    async fn produce_sections(&self, overview: &Overview) -> Result<Vec<Section>> {
        let inp = self.inputs("generate sections")?;
        let ctx = context::sections_context(
            &inp.input,
            overview,
            inp.structure.as_deref(),
            inp.reference.as_ref(),
        );
        self.attempt(Step::Sections, self.executor.sections(&inp.session, &ctx))
            .await
    }

    async fn produce_lessons(
        &self,
        overview: &Overview,
        section: &Section,
    ) -> Result<Vec<LessonOutline>> {
        let inp = self.inputs("generate lessons")?;
        let ctx = context::lessons_context(
            &inp.input,
            overview,
            section,
            inp.structure.as_deref(),
            inp.reference.as_ref(),
        );
        self.attempt(
            Step::Lessons,
            self.executor.lesson_outlines(&inp.session, &ctx),
        )
        .await
    }

    fn overview_for(&self, action: &str) -> Result<Overview> {
        let run = self.lock();
        run.artifact
            .overview
            .clone()
            .ok_or_else(|| CourseError::transition(action, run.stage))
    }

    // -----------------------------------------------------------------------
    // Control signals
    // -----------------------------------------------------------------------

    /// Produce the current stage's output if it is missing.
    #[instrument(skip_all, fields(run_id = %self.id()))]
    pub async fn generate(&self) -> Result<()> {
        let _guard = self.begin("generate")?;
        let (stage, has_output, section_index) = {
            let run = self.lock();
            let has_output = match run.stage {
                Stage::Overview => run.artifact.overview.is_some(),
                Stage::Sections => !run.artifact.sections.is_empty(),
                Stage::Lessons => run.scratch.is_some(),
                _ => true,
            };
            (run.stage, has_output, run.section_index)
        };

        match stage {
            Stage::Intake | Stage::StructureDiscovery => {
                return Err(CourseError::transition("generate", stage));
            }
            Stage::Complete => return Ok(()),
            _ if has_output => return Ok(()),
            _ => {}
        }

        match stage {
            Stage::Overview => {
                let overview = self.produce_overview().await?;
                let mut run = self.lock();
                run.artifact.overview = Some(overview);
                run.touch();
            }
            Stage::Sections => {
                let overview = self.overview_for("generate sections")?;
                let sections = self.produce_sections(&overview).await?;
                let mut run = self.lock();
                run.artifact.replace_sections(sections);
                run.touch();
            }
            Stage::Lessons => {
                let overview = self.overview_for("generate lessons")?;
                let section = self.section_at(section_index)?;
                let lessons = self.produce_lessons(&overview, &section).await?;
                let mut run = self.lock();
                run.scratch = Some(lessons);
                run.touch();
            }
            _ => {}
        }
        Ok(())
    }

    fn section_at(&self, index: usize) -> Result<Section> {
        self.lock()
            .artifact
            .sections
            .get(index)
            .cloned()
            .ok_or_else(|| CourseError::NotFound(format!("section {}", index + 1)))
    }

    /// Accept the current stage's output and advance.
    ///
    /// Advancing generates the next stage's output; if that fails the run
    /// stays exactly where it was.
    #[instrument(skip_all, fields(run_id = %self.id()))]
    pub async fn confirm(&self) -> Result<Stage> {
        let _guard = self.begin("confirm")?;
        let stage = self.stage();

        match stage {
            Stage::Overview => {
                let overview = self.overview_for("confirm without a generated overview")?;
                let sections = self.produce_sections(&overview).await?;
                let mut run = self.lock();
                run.artifact.replace_sections(sections);
                run.stage = Stage::Sections;
                run.touch();
            }
            Stage::Sections => {
                let overview = self.overview_for("confirm")?;
                let first = self
                    .lock()
                    .artifact
                    .sections
                    .first()
                    .cloned()
                    .ok_or_else(|| CourseError::transition("confirm without sections", stage))?;
                let lessons = self.produce_lessons(&overview, &first).await?;
                let mut run = self.lock();
                run.artifact.lessons.clear();
                run.section_index = 0;
                run.scratch = Some(lessons);
                run.stage = Stage::Lessons;
                run.touch();
            }
            Stage::Lessons => {
                let (index, accepted, next) = {
                    let run = self.lock();
                    let accepted = run.scratch.clone().ok_or_else(|| {
                        CourseError::transition("confirm without lesson outlines", stage)
                    })?;
                    let next = run.artifact.sections.get(run.section_index + 1).cloned();
                    (run.section_index, accepted, next)
                };
                let current = self.section_at(index)?;

                let upcoming = match &next {
                    Some(section) => {
                        let overview = self.overview_for("confirm")?;
                        Some(self.produce_lessons(&overview, section).await?)
                    }
                    None => None,
                };

                let mut run = self.lock();
                run.artifact.lessons.insert(current.id, accepted);
                match upcoming {
                    Some(lessons) => {
                        run.section_index = index + 1;
                        run.scratch = Some(lessons);
                    }
                    None => {
                        run.scratch = None;
                        run.stage = Stage::Complete;
                        info!(
                            sections = run.artifact.sections.len(),
                            "course outline complete"
                        );
                    }
                }
                run.touch();
            }
            _ => return Err(CourseError::transition("confirm", stage)),
        }

        Ok(self.stage())
    }

    /// Replace the current stage's output without changing stage.
    ///
    /// Regenerating sections drops every lesson, detail and quiz. Regenerating
    /// lesson outlines drops only the current section's scratch outlines and
    /// their details. On failure the previous output is kept.
    #[instrument(skip_all, fields(run_id = %self.id()))]
    pub async fn regenerate(&self) -> Result<()> {
        let _guard = self.begin("regenerate")?;
        let stage = self.stage();

        match stage {
            Stage::Overview => {
                let overview = self.produce_overview().await?;
                let mut run = self.lock();
                run.artifact.overview = Some(overview);
                run.touch();
            }
            Stage::Sections => {
                let overview = self.overview_for("regenerate sections")?;
                let sections = self.produce_sections(&overview).await?;
                let mut run = self.lock();
                run.artifact.replace_sections(sections);
                run.touch();
            }
            Stage::Lessons => {
                let overview = self.overview_for("regenerate lessons")?;
                let index = self.lock().section_index;
                let section = self.section_at(index)?;
                let lessons = self.produce_lessons(&overview, &section).await?;
                let mut run = self.lock();
                if let Some(old) = run.scratch.take() {
                    run.artifact.remove_details(old.iter().map(|l| l.id));
                }
                run.scratch = Some(lessons);
                run.touch();
            }
            _ => return Err(CourseError::transition("regenerate", stage)),
        }
        Ok(())
    }

    /// Step back one stage, discarding the output of the stage being left.
    #[instrument(skip_all, fields(run_id = %self.id()))]
    pub fn revert(&self) -> Result<Stage> {
        let _guard = self.begin("revert")?;
        let mut run = self.lock();

        match run.stage {
            Stage::Sections => {
                run.artifact.clear_sections();
                run.scratch = None;
                run.section_index = 0;
                run.stage = Stage::Overview;
            }
            Stage::Lessons => {
                let ids: Vec<_> = run.artifact.sections.iter().map(|s| s.id).collect();
                for id in ids {
                    run.artifact.remove_section_lessons(id);
                }
                if let Some(old) = run.scratch.take() {
                    run.artifact.remove_details(old.iter().map(|l| l.id));
                }
                run.section_index = 0;
                run.stage = Stage::Sections;
            }
            Stage::Complete => {
                let last = run.artifact.sections.len().saturating_sub(1);
                let reopened = run
                    .artifact
                    .sections
                    .get(last)
                    .and_then(|s| run.artifact.lessons.get(&s.id).map(|_| s.id));
                if let Some(id) = reopened {
                    run.scratch = run.artifact.lessons.remove(&id);
                }
                run.section_index = last;
                run.stage = Stage::Lessons;
            }
            stage => return Err(CourseError::transition("revert", stage)),
        }

        run.touch();
        info!(stage = %run.stage, "reverted");
        Ok(run.stage)
    }

    /// Clear all run state and return to Intake. The run id is kept and the
    /// document index, if any, is disposed.
    #[instrument(skip_all, fields(run_id = %self.id()))]
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.begin("reset")?;
        let index = self.lock().index.clone();
        if let (Some(docs), Some(id)) = (&self.index, &index) {
            self.dispose_index(docs.as_ref(), id).await;
        }

        let mut run = self.lock();
        let mut fresh = PipelineRun::new(run.profile);
        fresh.id = run.id;
        fresh.created_at = run.created_at;
        fresh.history = std::mem::take(&mut run.history);
        *run = fresh;
        info!("run reset");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lesson detail and quiz
    // -----------------------------------------------------------------------

    /// Generate (or return the existing) content for one lesson.
    ///
    /// A word count far from the target is accepted but flagged.
    #[instrument(skip_all, fields(run_id = %self.id(), lesson = %at, regenerate = regenerate))]
    pub async fn generate_lesson_detail(
        &self,
        at: LessonRef,
        instruction: Option<&str>,
        regenerate: bool,
    ) -> Result<LessonDetail> {
        let _guard = self.begin("generate lesson detail")?;
        self.require_stage("generate lesson detail", &[Stage::Lessons, Stage::Complete])?;

        let (section, lesson, overview, existing) = {
            let run = self.lock();
            let (section, lesson) = run.lesson(at)?;
            let overview = run
                .artifact
                .overview
                .clone()
                .ok_or_else(|| CourseError::transition("generate lesson detail", run.stage))?;
            (
                section.clone(),
                lesson.clone(),
                overview,
                run.artifact.details.get(&lesson.id).cloned(),
            )
        };
        if let Some(detail) = existing.filter(|_| !regenerate) {
            return Ok(detail);
        }

        let inp = self.inputs("generate lesson detail")?;
        let ctx = context::lesson_detail_context(
            &inp.input,
            &overview,
            &section,
            &lesson,
            inp.reference.as_ref(),
            instruction,
        );
        let body = self
            .attempt(
                Step::LessonDetail,
                self.executor.lesson_body(&inp.session, inp.profile, &ctx),
            )
            .await?;

        let word_count = body.word_count();
        let warning = word_count_warning(
            word_count,
            inp.input.structure.word_count,
            self.settings.word_count_tolerance,
        );
        if let Some(w) = &warning {
            warn!(lesson = %lesson.title, "{w}");
        }

        let detail = LessonDetail {
            id: DetailId::new(),
            lesson_id: lesson.id,
            body,
            word_count,
            instruction: instruction
                .map(str::trim)
                .filter(|i| !i.is_empty())
                .map(str::to_string),
            warning,
        };
        let mut run = self.lock();
        run.artifact.insert_detail(detail.clone());
        run.touch();
        Ok(detail)
    }

    /// Generate (or return the existing) quiz for a lesson with content.
    #[instrument(skip_all, fields(run_id = %self.id(), lesson = %at, regenerate = regenerate))]
    pub async fn generate_quiz(&self, at: LessonRef, regenerate: bool) -> Result<Quiz> {
        let _guard = self.begin("generate quiz")?;
        self.require_stage("generate quiz", &[Stage::Lessons, Stage::Complete])?;

        let (lesson, detail, existing) = {
            let run = self.lock();
            let (_, lesson) = run.lesson(at)?;
            let detail = run.artifact.details.get(&lesson.id).cloned().ok_or_else(|| {
                CourseError::NotFound(format!("content for lesson {at}; generate it first"))
            })?;
            let existing = run.artifact.quizzes.get(&detail.id).cloned();
            (lesson.clone(), detail, existing)
        };
        if let Some(quiz) = existing.filter(|_| !regenerate) {
            return Ok(quiz);
        }

        let title = match &detail.body {
            LessonBody::Markdown(text) => first_heading(text).unwrap_or_else(|| lesson.title.clone()),
            LessonBody::Structured(_) => lesson.title.clone(),
        };
        let inp = self.inputs("generate quiz")?;
        let ctx = context::quiz_context(&inp.input, &title, &detail.body);
        let quiz = self
            .attempt(Step::Quiz, self.executor.quiz(&inp.session, detail.id, &ctx))
            .await?;

        let mut run = self.lock();
        run.artifact.quizzes.insert(detail.id, quiz.clone());
        run.touch();
        Ok(quiz)
    }

    /// Record an answer to question `question` (zero-based) of a lesson's quiz.
    pub fn answer_quiz(
        &self,
        at: LessonRef,
        question: usize,
        answer: Answer,
    ) -> Result<(AnswerState, QuizProgress)> {
        self.lock().answer_quiz(at, question, answer)
    }

    /// Clear every answer of a lesson's quiz.
    pub fn reset_quiz(&self, at: LessonRef) -> Result<()> {
        self.lock().reset_quiz(at).map(|_| ())
    }
}

/// Warning text when `actual` deviates from `target` by more than `tolerance`.
pub fn word_count_warning(actual: usize, target: u32, tolerance: f64) -> Option<String> {
    if target == 0 {
        return None;
    }
    let target_f = f64::from(target);
    let deviation = (actual as f64 - target_f).abs() / target_f;
    (deviation > tolerance).then(|| {
        format!(
            "lesson has {actual} words, {:.0}% away from the {target}-word target",
            deviation * 100.0
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use coursesmith_backend::{IndexStatus, ScriptedBackend, ScriptedIndex, ScriptedReply};
    use coursesmith_shared::StructureParams;

    const OVERVIEW: &str = r#"{"course_name": "Beekeeping Basics", "description": "Learn bees", "prerequisites": "none", "learning_outcomes": ["Open a hive"]}"#;

    fn sections_reply(titles: &[(&str, u32)]) -> ScriptedReply {
        let items: Vec<String> = titles
            .iter()
            .map(|(t, m)| {
                format!(r#"{{"title": "{t}", "description": "About {t}", "estimated_time": {m}}}"#)
            })
            .collect();
        ScriptedReply::text(format!(r#"{{"sections": [{}]}}"#, items.join(",")))
    }

    fn lessons_reply(titles: &[&str]) -> ScriptedReply {
        let items: Vec<String> = titles
            .iter()
            .map(|t| format!(r#"{{"title": "{t}", "duration": 45, "brief": "Covers {t}"}}"#))
            .collect();
        ScriptedReply::text(format!(r#"{{"lessons": [{}]}}"#, items.join(",")))
    }

    fn settings() -> GenerationSettings {
        GenerationSettings {
            poll_interval: Duration::from_millis(2),
            stage_timeout: Some(Duration::from_secs(5)),
            index_max_polls: 3,
            ..GenerationSettings::default()
        }
    }

    fn form() -> IntakeForm {
        IntakeForm {
            language: "English".into(),
            main_content: "Beekeeping for hobbyists".into(),
            structure: StructureParams {
                course_duration: 10,
                lesson_length: 45,
                word_count: 500,
            },
            ..IntakeForm::default()
        }
    }

    /// A pipeline sitting in Overview with no reference files.
    async fn at_overview(replies: Vec<ScriptedReply>) -> (Arc<ScriptedBackend>, Pipeline) {
        let backend = Arc::new(ScriptedBackend::new(replies));
        let pipeline = Pipeline::new(backend.clone(), settings());
        pipeline.submit_intake(&form(), vec![]).unwrap();
        pipeline
            .discover_structure(&DiscoveryOptions::default())
            .await
            .unwrap();
        assert_eq!(pipeline.stage(), Stage::Overview);
        (backend, pipeline)
    }

    /// Course shape without generated ids.
    fn shape(run: &PipelineRun) -> (Option<Overview>, Vec<(String, u32)>, Vec<Vec<String>>) {
        let a = &run.artifact;
        (
            a.overview.clone(),
            a.sections
                .iter()
                .map(|s| (s.title.clone(), s.estimated_time))
                .collect(),
            a.sections
                .iter()
                .map(|s| {
                    a.section_lessons(s.id)
                        .iter()
                        .map(|l| l.title.clone())
                        .collect()
                })
                .collect(),
        )
    }

    #[test]
    fn lesson_ref_parsing() {
        let r: LessonRef = "2.3".parse().unwrap();
        assert_eq!(r, LessonRef { section: 1, lesson: 2 });
        assert_eq!(r.to_string(), "2.3");
        assert!("0.1".parse::<LessonRef>().is_err());
        assert!("2".parse::<LessonRef>().is_err());
        assert!("a.b".parse::<LessonRef>().is_err());
    }

    #[test]
    fn word_count_tolerance() {
        assert!(word_count_warning(500, 500, 0.2).is_none());
        assert!(word_count_warning(600, 500, 0.2).is_none());
        assert!(word_count_warning(399, 500, 0.2).is_some());
        let w = word_count_warning(1000, 500, 0.2).unwrap();
        assert!(w.contains("100%"));
    }

    #[tokio::test]
    async fn invalid_intake_does_not_advance() {
        let backend = Arc::new(ScriptedBackend::default());
        let pipeline = Pipeline::new(backend.clone(), settings());
        let bad = IntakeForm {
            category: "Other".into(),
            ..form()
        };
        let err = pipeline.submit_intake(&bad, vec![]).unwrap_err();
        assert!(matches!(err, CourseError::Validation { .. }));
        assert_eq!(pipeline.stage(), Stage::Intake);
        assert!(backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn full_run_reaches_complete() {
        let (backend, pipeline) = at_overview(vec![
            ScriptedReply::text(OVERVIEW),
            sections_reply(&[("Hives", 120), ("Honey", 90)]),
            lessons_reply(&["Frames", "Boxes"]),
            lessons_reply(&["Extraction", "Storage"]),
        ])
        .await;

        pipeline.generate().await.unwrap();
        assert_eq!(
            pipeline.snapshot().title().as_deref(),
            Some("Beekeeping Basics")
        );
        assert_eq!(pipeline.confirm().await.unwrap(), Stage::Sections);
        assert_eq!(pipeline.confirm().await.unwrap(), Stage::Lessons);

        // Section "Hives" is 120 minutes at 45 minutes per lesson.
        let prompts = backend.prompts();
        assert!(prompts[2].contains(r#""total_lessons_needed":2"#));
        assert!(prompts[2].contains(r#""current_section_time":120"#));

        assert_eq!(pipeline.confirm().await.unwrap(), Stage::Lessons);
        assert_eq!(pipeline.snapshot().section_index, 1);
        assert_eq!(pipeline.confirm().await.unwrap(), Stage::Complete);

        let run = pipeline.snapshot();
        assert!(run.scratch.is_none());
        let (_, sections, lessons) = shape(&run);
        assert_eq!(sections, vec![("Hives".into(), 120), ("Honey".into(), 90)]);
        assert_eq!(
            lessons,
            vec![vec!["Frames", "Boxes"], vec!["Extraction", "Storage"]]
        );
        assert_eq!(run.history.len(), 4);
        assert!(run.history.iter().all(|a| a.outcome == AttemptOutcome::Succeeded));
        assert_eq!(backend.remaining(), 0);
    }

    #[tokio::test]
    async fn failures_then_retry_match_clean_run() {
        let (_, clean) = at_overview(vec![
            ScriptedReply::text(OVERVIEW),
            sections_reply(&[("Hives", 120)]),
            lessons_reply(&["Frames"]),
        ])
        .await;
        clean.generate().await.unwrap();
        clean.confirm().await.unwrap();
        clean.confirm().await.unwrap();
        clean.confirm().await.unwrap();

        let (_, flaky) = at_overview(vec![
            ScriptedReply::text(OVERVIEW),
            ScriptedReply::Failed("server error".into()),
            ScriptedReply::Failed("server error".into()),
            sections_reply(&[("Hives", 120)]),
            lessons_reply(&["Frames"]),
        ])
        .await;
        flaky.generate().await.unwrap();
        let before = flaky.snapshot().artifact;
        for _ in 0..2 {
            let err = flaky.confirm().await.unwrap_err();
            assert!(matches!(err, CourseError::Backend(_)));
            assert_eq!(flaky.stage(), Stage::Overview);
            assert_eq!(flaky.snapshot().artifact, before);
        }
        flaky.confirm().await.unwrap();
        flaky.confirm().await.unwrap();
        flaky.confirm().await.unwrap();

        let (clean_run, flaky_run) = (clean.snapshot(), flaky.snapshot());
        assert_eq!(flaky_run.stage, Stage::Complete);
        assert_eq!(shape(&clean_run), shape(&flaky_run));
        let failed = flaky_run
            .history
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Failed)
            .count();
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn regenerating_sections_keeps_overview() {
        let (_, pipeline) = at_overview(vec![
            ScriptedReply::text(OVERVIEW),
            sections_reply(&[("Hives", 120)]),
            sections_reply(&[("Colonies", 60), ("Honey", 60)]),
        ])
        .await;
        pipeline.generate().await.unwrap();
        pipeline.confirm().await.unwrap();
        let overview = pipeline.snapshot().artifact.overview;

        pipeline.regenerate().await.unwrap();
        let run = pipeline.snapshot();
        assert_eq!(run.stage, Stage::Sections);
        assert_eq!(run.artifact.overview, overview);
        assert_eq!(run.artifact.sections.len(), 2);
        assert_eq!(run.artifact.sections[0].title, "Colonies");
    }

    #[tokio::test]
    async fn regenerating_lessons_leaves_accepted_sections() {
        let (_, pipeline) = at_overview(vec![
            ScriptedReply::text(OVERVIEW),
            sections_reply(&[("Hives", 90), ("Honey", 90)]),
            lessons_reply(&["Frames", "Boxes"]),
            lessons_reply(&["Extraction"]),
            lessons_reply(&["Jarring"]),
        ])
        .await;
        pipeline.generate().await.unwrap();
        pipeline.confirm().await.unwrap();
        pipeline.confirm().await.unwrap();
        pipeline.confirm().await.unwrap();
        let accepted = pipeline.snapshot().artifact.lessons.clone();

        pipeline.regenerate().await.unwrap();
        let run = pipeline.snapshot();
        assert_eq!(run.section_index, 1);
        assert_eq!(run.artifact.lessons, accepted);
        assert_eq!(run.scratch.as_ref().unwrap()[0].title, "Jarring");
    }

    #[tokio::test]
    async fn regenerating_lessons_drops_scratch_details() {
        let backend = Arc::new(ScriptedBackend::new([
            ScriptedReply::text("<content>\n# Beekeeping\n\nAll about bees.\n</content>"),
            sections_reply(&[("Hives", 45)]),
            lessons_reply(&["Frames"]),
            ScriptedReply::text("<content>\n# Frames\n\nShort.\n</content>"),
            lessons_reply(&["Supers"]),
        ]));
        let pipeline = Pipeline::new(
            backend,
            GenerationSettings {
                profile: GenerationProfile::FreeformMarkdown,
                ..settings()
            },
        );
        pipeline.submit_intake(&form(), vec![]).unwrap();
        pipeline
            .discover_structure(&DiscoveryOptions::default())
            .await
            .unwrap();
        pipeline.generate().await.unwrap();
        assert_eq!(pipeline.snapshot().title().as_deref(), Some("Beekeeping"));
        pipeline.confirm().await.unwrap();
        pipeline.confirm().await.unwrap();

        let at = LessonRef { section: 0, lesson: 0 };
        let detail = pipeline.generate_lesson_detail(at, None, false).await.unwrap();
        assert_eq!(detail.body, LessonBody::Markdown("# Frames\n\nShort.".into()));
        assert_eq!(pipeline.snapshot().artifact.details.len(), 1);

        pipeline.regenerate().await.unwrap();
        let run = pipeline.snapshot();
        assert_eq!(run.scratch.as_ref().unwrap()[0].title, "Supers");
        assert!(run.artifact.details.is_empty());
    }

    #[tokio::test]
    async fn detail_and_quiz_flow() {
        let detail = r#"{"lesson_content": {"overview": "Frames hold comb", "key_points": [{"concept": "Frame", "explanation": "Holds comb"}], "examples": ["Langstroth"], "takeaways": ["Use frames"]}}"#;
        let quiz = r#"{"questions": [
            {"type": "multi_choice", "question": "What holds comb?", "options": ["Frame", "Lid"], "correct": 0},
            {"type": "true_false", "statement": "Frames are optional.", "correct": false}
        ]}"#;
        let (backend, pipeline) = at_overview(vec![
            ScriptedReply::text(OVERVIEW),
            sections_reply(&[("Hives", 45)]),
            lessons_reply(&["Frames"]),
            ScriptedReply::text(detail),
            ScriptedReply::text(quiz),
        ])
        .await;
        pipeline.generate().await.unwrap();
        pipeline.confirm().await.unwrap();
        pipeline.confirm().await.unwrap();

        let at: LessonRef = "1.1".parse().unwrap();
        let generated = pipeline
            .generate_lesson_detail(at, Some("mention Langstroth hives"), false)
            .await
            .unwrap();
        assert!(generated.warning.is_some());
        assert!(backend.prompts()[3].contains("mention Langstroth hives"));

        // Cached unless regeneration is requested.
        let again = pipeline.generate_lesson_detail(at, None, false).await.unwrap();
        assert_eq!(again.id, generated.id);

        let quiz = pipeline.generate_quiz(at, false).await.unwrap();
        assert_eq!(quiz.questions.len(), 2);
        assert!(backend.prompts()[4].contains(r#""lesson_title":"Frames""#));

        let (state, _) = pipeline.answer_quiz(at, 0, Answer::Choice(1)).unwrap();
        assert_eq!(state, AnswerState::Incorrect);
        let (state, progress) = pipeline.answer_quiz(at, 1, Answer::TrueFalse(false)).unwrap();
        assert_eq!(state, AnswerState::Correct);
        assert_eq!(progress.answered, 2);
        assert_eq!(progress.correct, 1);

        pipeline.reset_quiz(at).unwrap();
        let mut run = pipeline.snapshot();
        let lesson_id = run.lesson(at).unwrap().1.id;
        assert_eq!(
            run.artifact.quiz_for_lesson(lesson_id).unwrap().progress().answered,
            0
        );

        // A saved snapshot answers and resets its quizzes without a backend.
        let submitted = backend.prompts().len();
        let (state, progress) = run.answer_quiz(at, 0, Answer::Choice(0)).unwrap();
        assert_eq!(state, AnswerState::Correct);
        assert_eq!(progress.answered, 1);
        assert!(run.answer_quiz(at, 5, Answer::Choice(0)).is_err());
        assert_eq!(run.reset_quiz(at).unwrap().progress().answered, 0);
        assert!(run.reset_quiz("1.2".parse().unwrap()).is_err());
        assert_eq!(backend.prompts().len(), submitted);
    }

    #[tokio::test]
    async fn quiz_requires_detail() {
        let (_, pipeline) = at_overview(vec![
            ScriptedReply::text(OVERVIEW),
            sections_reply(&[("Hives", 45)]),
            lessons_reply(&["Frames"]),
        ])
        .await;
        pipeline.generate().await.unwrap();
        pipeline.confirm().await.unwrap();
        pipeline.confirm().await.unwrap();

        let at = LessonRef { section: 0, lesson: 0 };
        let err = pipeline.generate_quiz(at, false).await.unwrap_err();
        assert!(matches!(err, CourseError::NotFound(_)));
        let err = pipeline
            .generate_lesson_detail(LessonRef { section: 0, lesson: 4 }, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CourseError::NotFound(_)));
    }

    #[tokio::test]
    async fn second_trigger_while_in_flight_is_rejected() {
        let (_, pipeline) = at_overview(vec![ScriptedReply::Hang]).await;
        let pipeline = Arc::new(pipeline);

        let pending = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.generate().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = pipeline.regenerate().await.unwrap_err();
        assert!(matches!(err, CourseError::StageInFlight { .. }));
        assert!(matches!(
            pipeline.revert().unwrap_err(),
            CourseError::StageInFlight { .. }
        ));

        pipeline.cancel();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, CourseError::Cancelled { .. }));
        assert_eq!(pipeline.stage(), Stage::Overview);
        assert!(pipeline.snapshot().artifact.overview.is_none());
    }

    #[tokio::test]
    async fn hanging_backend_times_out() {
        let backend = Arc::new(ScriptedBackend::new([ScriptedReply::Hang]));
        let pipeline = Pipeline::new(
            backend,
            GenerationSettings {
                stage_timeout: Some(Duration::from_millis(40)),
                ..settings()
            },
        );
        pipeline.submit_intake(&form(), vec![]).unwrap();
        pipeline
            .discover_structure(&DiscoveryOptions::default())
            .await
            .unwrap();

        let err = pipeline.generate().await.unwrap_err();
        assert!(matches!(err, CourseError::StageTimeout { .. }));
        assert_eq!(pipeline.stage(), Stage::Overview);
        assert_eq!(pipeline.snapshot().history.len(), 1);
    }

    #[tokio::test]
    async fn revert_walks_back_with_cascade() {
        let (_, pipeline) = at_overview(vec![
            ScriptedReply::text(OVERVIEW),
            sections_reply(&[("Hives", 45), ("Honey", 45)]),
            lessons_reply(&["Frames"]),
            lessons_reply(&["Jarring"]),
        ])
        .await;
        assert!(pipeline.revert().is_err());

        pipeline.generate().await.unwrap();
        pipeline.confirm().await.unwrap();
        pipeline.confirm().await.unwrap();
        pipeline.confirm().await.unwrap();
        pipeline.confirm().await.unwrap();
        assert_eq!(pipeline.stage(), Stage::Complete);

        assert_eq!(pipeline.revert().unwrap(), Stage::Lessons);
        let run = pipeline.snapshot();
        assert_eq!(run.section_index, 1);
        assert_eq!(run.scratch.as_ref().unwrap()[0].title, "Jarring");
        assert_eq!(run.artifact.lessons.len(), 1);

        assert_eq!(pipeline.revert().unwrap(), Stage::Sections);
        let run = pipeline.snapshot();
        assert!(run.artifact.lessons.is_empty());
        assert!(run.scratch.is_none());
        assert_eq!(run.artifact.sections.len(), 2);

        assert_eq!(pipeline.revert().unwrap(), Stage::Overview);
        let run = pipeline.snapshot();
        assert!(run.artifact.sections.is_empty());
        assert!(run.artifact.overview.is_some());
    }

    #[tokio::test]
    async fn confirm_without_output_is_invalid() {
        let (backend, pipeline) = at_overview(vec![]).await;
        let err = pipeline.confirm().await.unwrap_err();
        assert!(matches!(err, CourseError::InvalidTransition { .. }));
        assert!(backend.prompts().is_empty());
    }

    fn temp_reference(content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("cs_pipeline_{}.md", uuid::Uuid::now_v7()));
        std::fs::write(&path, content).expect("write temp file");
        path
    }

    #[tokio::test]
    async fn discovery_with_index_and_reset() {
        let file = temp_reference("# Bees\n\nTable of Contents\n1. Hives\n2. Honey\n");
        let backend = Arc::new(ScriptedBackend::new([ScriptedReply::text(
            "1. Hives\n2. Honey",
        )]));
        let index = Arc::new(ScriptedIndex::new([IndexStatus::Building]));
        let pipeline =
            Pipeline::new(backend.clone(), settings()).with_index(index.clone());

        pipeline.submit_intake(&form(), vec![file.clone()]).unwrap();
        pipeline
            .discover_structure(&DiscoveryOptions {
                build_index: true,
                ..DiscoveryOptions::default()
            })
            .await
            .unwrap();

        let run = pipeline.snapshot();
        let id = run.id;
        assert_eq!(run.stage, Stage::Overview);
        assert_eq!(run.structure.as_deref(), Some("1. Hives\n2. Honey"));
        assert!(run.reference.as_ref().unwrap().toc_excerpt.is_some());
        let index_id = run.index.clone().unwrap();
        assert_eq!(backend.session_indexes(), vec![Some(index_id.clone())]);

        pipeline.reset().await.unwrap();
        let run = pipeline.snapshot();
        assert_eq!(run.stage, Stage::Intake);
        assert_eq!(run.id, id);
        assert!(run.session.is_none() && run.reference.is_none());
        assert_eq!(index.disposed(), vec![index_id]);

        let _ = std::fs::remove_file(file);
    }

    #[tokio::test]
    async fn failed_index_is_fatal_and_disposed() {
        let file = temp_reference("Some notes about bees.");
        let backend = Arc::new(ScriptedBackend::default());
        let index = Arc::new(ScriptedIndex::new([IndexStatus::Failed {
            reason: "unsupported file".into(),
        }]));
        let pipeline =
            Pipeline::new(backend.clone(), settings()).with_index(index.clone());
        pipeline.submit_intake(&form(), vec![file.clone()]).unwrap();

        let err = pipeline
            .discover_structure(&DiscoveryOptions {
                build_index: true,
                ..DiscoveryOptions::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CourseError::Ingestion(_)));
        assert_eq!(pipeline.stage(), Stage::StructureDiscovery);
        assert_eq!(index.disposed().len(), 1);
        assert!(backend.session_indexes().is_empty());

        let _ = std::fs::remove_file(file);
    }

    #[tokio::test]
    async fn unreadable_files_become_warnings() {
        let backend = Arc::new(ScriptedBackend::default());
        let pipeline = Pipeline::new(backend.clone(), settings());
        let missing = std::env::temp_dir().join("cs_pipeline_missing.txt");
        pipeline.submit_intake(&form(), vec![missing]).unwrap();
        pipeline
            .discover_structure(&DiscoveryOptions::default())
            .await
            .unwrap();

        let run = pipeline.snapshot();
        assert_eq!(run.stage, Stage::Overview);
        assert!(run.reference.is_none());
        assert!(run.structure.is_none());
        assert_eq!(run.warnings.len(), 2);
    }

    #[test]
    fn run_snapshot_roundtrip() {
        let run = PipelineRun::new(GenerationProfile::FreeformMarkdown);
        let json = serde_json::to_string(&run).unwrap();
        let back: PipelineRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }
}
