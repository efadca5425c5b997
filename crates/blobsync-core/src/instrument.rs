//! Uniform enter/exit/error recording around pipeline steps.
//!
//! Every call to [`instrumented`] produces an "entering" record followed by
//! exactly one "exiting" or "error in" record, both as `tracing` events and in
//! the [`JobRun`] journal passed in by the caller.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Seed,
    Export,
    Upload,
    Truncate,
    SelectLatest,
    Load,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::Seed,
        Step::Export,
        Step::Upload,
        Step::Truncate,
        Step::SelectLatest,
        Step::Load,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::Seed => "reset_and_seed",
            Step::Export => "export",
            Step::Upload => "upload",
            Step::Truncate => "truncate",
            Step::SelectLatest => "select_latest",
            Step::Load => "load",
        }
    }

    /// 1-based position in the pipeline.
    pub fn ordinal(self) -> u8 {
        match self {
            Step::Seed => 1,
            Step::Export => 2,
            Step::Upload => 3,
            Step::Truncate => 4,
            Step::SelectLatest => 5,
            Step::Load => 6,
        }
    }

    /// State reached once this step has completed.
    pub fn completes(self) -> JobState {
        match self {
            Step::Seed => JobState::Seeded,
            Step::Export => JobState::Exported,
            Step::Upload => JobState::Uploaded,
            Step::Truncate => JobState::Truncated,
            Step::SelectLatest => JobState::Selected,
            Step::Load => JobState::Loaded,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Init,
    Seeded,
    Exported,
    Uploaded,
    Truncated,
    Selected,
    Loaded,
    Done,
    /// `step` is `None` when the run failed before its first step.
    Failed { step: Option<Step> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Entered { step: Step },
    Exited { step: Step, elapsed: Duration },
    Failed { step: Step, elapsed: Duration, detail: String },
}

impl StepEvent {
    pub fn step(&self) -> Step {
        match self {
            StepEvent::Entered { step }
            | StepEvent::Exited { step, .. }
            | StepEvent::Failed { step, .. } => *step,
        }
    }
}

/// Outcome of one step, paired from its enter and exit/error records.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub step: Step,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Journal of a single job run. Owned by the engine for the run's lifetime.
#[derive(Debug, Clone)]
pub struct JobRun {
    started_at: DateTime<Utc>,
    state: JobState,
    events: Vec<StepEvent>,
}

impl JobRun {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            state: JobState::Init,
            events: Vec::new(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn events(&self) -> &[StepEvent] {
        &self.events
    }

    pub fn finish(&mut self) {
        if self.state == JobState::Loaded {
            self.state = JobState::Done;
        }
    }

    /// Mark the run failed outside of any step (lock, connection).
    pub fn abort(&mut self) {
        self.state = JobState::Failed { step: None };
    }

    fn record(&mut self, event: StepEvent) {
        match &event {
            StepEvent::Entered { .. } => {}
            StepEvent::Exited { step, .. } => self.state = step.completes(),
            StepEvent::Failed { step, .. } => self.state = JobState::Failed { step: Some(*step) },
        }
        self.events.push(event);
    }

    /// Completed steps in order. An entered step without a matching exit or
    /// error record is not reported.
    pub fn outcomes(&self) -> Vec<StepOutcome> {
        self.events
            .iter()
            .filter_map(|event| match event {
                StepEvent::Entered { .. } => None,
                StepEvent::Exited { step, elapsed } => Some(StepOutcome {
                    step: *step,
                    elapsed: *elapsed,
                    error: None,
                }),
                StepEvent::Failed {
                    step,
                    elapsed,
                    detail,
                } => Some(StepOutcome {
                    step: *step,
                    elapsed: *elapsed,
                    error: Some(detail.clone()),
                }),
            })
            .collect()
    }

    /// True when every enter record is immediately closed by exactly one exit
    /// or error record for the same step.
    pub fn is_balanced(&self) -> bool {
        self.events.chunks(2).all(|pair| match pair {
            [StepEvent::Entered { step }, closing] => {
                !matches!(closing, StepEvent::Entered { .. }) && closing.step() == *step
            }
            _ => false,
        })
    }
}

/// Run `op` as pipeline step `step`, recording entry, exit with elapsed time,
/// or failure. The operation's error is returned unchanged.
pub async fn instrumented<T, E, F, Fut>(run: &mut JobRun, step: Step, op: F) -> Result<T, E>
where
    E: fmt::Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    run.record(StepEvent::Entered { step });
    info!(step = step.name(), "entering {step}");
    let started = Instant::now();

    match op().await {
        Ok(value) => {
            let elapsed = started.elapsed();
            info!(
                step = step.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "exiting {step}"
            );
            run.record(StepEvent::Exited { step, elapsed });
            Ok(value)
        }
        Err(err) => {
            let elapsed = started.elapsed();
            let detail = err.to_string();
            error!(
                step = step.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "error in {step}: {detail}"
            );
            run.record(StepEvent::Failed {
                step,
                elapsed,
                detail,
            });
            Err(err)
        }
    }
}
