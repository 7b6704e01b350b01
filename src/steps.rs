//! Ordered, fail-fast test steps
//!
//! ```ignore
//! Steps::new()
//!     .step(Step::new("ready", || async { require_ready_eventually(..).await.map(drop) }))
//!     .step(Step::new("functional", || async { require_database_functional(..).await }))
//!     .run(&config)
//!     .await?;
//! ```
//!
//! Steps run in declared order on the caller's task. Consecutive steps marked
//! [`Step::parallel`] are joined and run concurrently. The first failure stops
//! the run; there is no rollback, cleanup belongs to the sandbox.

use std::future::Future;

use futures::future::{BoxFuture, FutureExt, join_all};
use tracing::Instrument;

use crate::config::RunConfig;
use crate::error::{Result, StepFailure};

type StepFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// A labelled assertion procedure
pub struct Step<'a> {
    name: String,
    parallel: bool,
    run: StepFn<'a>,
}

impl<'a> Step<'a> {
    pub fn new<F, Fut>(name: &str, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<()>> + Send + 'a,
    {
        Self {
            name: name.to_string(),
            parallel: false,
            run: Box::new(move || f().boxed()),
        }
    }

    /// Allow this step to run concurrently with adjacent parallel steps
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }
}

impl std::fmt::Debug for Step<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

/// What a successful run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Labels of the steps that ran, in declared order
    pub executed: Vec<String>,
    /// The list was skipped in short mode
    pub skipped: bool,
}

/// A named, ordered step list
#[derive(Debug, Default)]
pub struct Steps<'a> {
    steps: Vec<Step<'a>>,
}

impl<'a> Steps<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn step(mut self, step: Step<'a>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Execute the steps, halting at the first failure.
    ///
    /// In short mode nothing runs and the report is marked skipped.
    pub async fn run(self, config: &RunConfig) -> Result<StepReport, StepFailure> {
        if config.short {
            tracing::info!(steps = self.steps.len(), "Short mode, skipping step list");
            return Ok(StepReport {
                executed: Vec::new(),
                skipped: true,
            });
        }

        let mut report = StepReport::default();
        let mut pending = self.steps.into_iter().enumerate().peekable();

        while let Some((index, step)) = pending.next() {
            let mut group = vec![(index, step)];
            if group[0].1.parallel {
                while let Some((i, next)) = pending.next_if(|(_, s)| s.parallel) {
                    group.push((i, next));
                }
            }

            let names: Vec<(usize, String)> =
                group.iter().map(|(i, s)| (*i, s.name.clone())).collect();

            let results = join_all(group.into_iter().map(|(index, step)| {
                let span = tracing::info_span!("step", index, name = %step.name);
                async move {
                    tracing::info!("Running step");
                    let result = (step.run)().await;
                    match &result {
                        Ok(()) => tracing::info!("Step passed"),
                        Err(e) => tracing::error!(error = %e, "Step failed"),
                    }
                    result
                }
                .instrument(span)
            }))
            .await;

            for ((index, name), result) in names.into_iter().zip(results) {
                match result {
                    Ok(()) => report.executed.push(name),
                    Err(source) => {
                        return Err(StepFailure {
                            step: name,
                            index,
                            source,
                        });
                    }
                }
            }
        }

        Ok(report)
    }
}
