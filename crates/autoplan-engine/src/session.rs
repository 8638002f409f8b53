use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use autoplan_core::{
    ArgumentBinding, AutoplanError, CallbackHandler, Plan, PlanEvent, Step, StepResult,
    StepStatus,
};
use autoplan_tools::ToolExecutor;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{validate_plan, Combiner, ExecutionContext, PlanChunk, Planner};

pub type EventStream<'a> =
    Pin<Box<dyn Stream<Item = Result<PlanEvent, AutoplanError>> + Send + 'a>>;

type EventSender = mpsc::UnboundedSender<Result<PlanEvent, AutoplanError>>;

// ---------------------------------------------------------------------------
// StepResults
// ---------------------------------------------------------------------------

/// Write-once result slots, one per step.
///
/// A slot is written by the task that ran its step, or by the coordinator
/// when the step is skipped. Everyone else only reads.
#[derive(Debug, Clone)]
pub struct StepResults {
    slots: Arc<[OnceLock<StepResult>]>,
}

impl StepResults {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Fill the slot for `result.step_index`. Writing a slot twice is an
    /// engine bug and reported as a `Scheduling` error.
    pub fn record(&self, result: StepResult) -> Result<(), AutoplanError> {
        let index = result.step_index;
        let slot = self.slots.get(index).ok_or_else(|| {
            AutoplanError::Scheduling(format!("no result slot for step {index}"))
        })?;
        slot.set(result)
            .map_err(|_| AutoplanError::Scheduling(format!("step {index} recorded twice")))
    }

    pub fn get(&self, index: usize) -> Option<&StepResult> {
        self.slots.get(index).and_then(OnceLock::get)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// One result per step; unrecorded slots are reported as Pending.
    pub fn snapshot(&self, plan: &Plan) -> Vec<StepResult> {
        plan.steps()
            .iter()
            .map(|step| {
                self.get(step.index())
                    .cloned()
                    .unwrap_or_else(|| StepResult::pending(step.index(), &step.tool_name))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Session report and handle
// ---------------------------------------------------------------------------

/// Final state of a session, available once it has ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    /// The plan, if one was produced and validated.
    pub plan: Option<Plan>,
    pub results: Vec<StepResult>,
    pub output: Option<Value>,
    /// Display form of the terminal error, if the session failed.
    pub error: Option<String>,
    pub cancelled: bool,
}

impl SessionReport {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            plan: None,
            results: Vec::new(),
            output: None,
            error: None,
            cancelled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.output.is_some()
    }

    pub fn result(&self, index: usize) -> Option<&StepResult> {
        self.results.get(index)
    }
}

/// The caller's side of a running session: its event stream, a way to cancel
/// it, and its final report.
///
/// The stream yields every event in emission order and ends after either one
/// `FinalResult` event or one `Err` item.
pub struct SessionHandle {
    session_id: String,
    events: mpsc::UnboundedReceiver<Result<PlanEvent, AutoplanError>>,
    cancel: CancellationToken,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Request cancellation. Steps not yet dispatched never start, in-flight
    /// tool calls are interrupted, and no `FinalResult` is produced.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn next_event(&mut self) -> Option<Result<PlanEvent, AutoplanError>> {
        self.events.recv().await
    }

    pub fn events(&mut self) -> EventStream<'_> {
        Box::pin(async_stream::stream! {
            while let Some(item) = self.events.recv().await {
                yield item;
            }
        })
    }

    /// Drain the remaining events and return the session report.
    pub async fn wait(mut self) -> Result<SessionReport, AutoplanError> {
        while self.events.recv().await.is_some() {}
        self.task
            .await
            .map_err(|e| AutoplanError::Scheduling(format!("session task failed: {e}")))
    }

    /// Drain the remaining events and return the final output, or the
    /// session's terminal error.
    ///
    /// Events already taken with [`next_event`](Self::next_event) are not
    /// needed: the output and failure are read from the session report.
    pub async fn finish(mut self) -> Result<Value, AutoplanError> {
        let mut terminal = None;
        while let Some(item) = self.events.recv().await {
            if let Err(e) = item {
                terminal.get_or_insert(e);
            }
        }
        let report = self
            .task
            .await
            .map_err(|e| AutoplanError::Scheduling(format!("session task failed: {e}")))?;
        if let Some(output) = report.output {
            return Ok(output);
        }
        if let Some(e) = terminal {
            return Err(e);
        }
        let message = report
            .error
            .unwrap_or_else(|| format!("session {} produced no output", report.session_id));
        if report.cancelled {
            Err(AutoplanError::Cancelled(message))
        } else {
            Err(AutoplanError::Session(message))
        }
    }
}

// ---------------------------------------------------------------------------
// PlanExecutor
// ---------------------------------------------------------------------------

/// Runs planning sessions: validation, concurrent step execution and
/// combination, reported as a stream of [`PlanEvent`]s.
///
/// Sessions are spawned on the current tokio runtime.
#[derive(Clone)]
pub struct PlanExecutor {
    ctx: Arc<ExecutionContext>,
    combiner: Arc<dyn Combiner>,
    callback: Option<Arc<dyn CallbackHandler>>,
}

enum PlanSource {
    Ready(Plan),
    Planner(Arc<dyn Planner>),
}

impl PlanExecutor {
    pub fn new(ctx: impl Into<Arc<ExecutionContext>>, combiner: Arc<dyn Combiner>) -> Self {
        Self {
            ctx: ctx.into(),
            combiner,
            callback: None,
        }
    }

    /// Also deliver every event to `callback`. Callback failures are logged
    /// and otherwise ignored.
    pub fn with_callback(mut self, callback: Arc<dyn CallbackHandler>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Plan with `planner`, then execute the plan.
    pub fn run(&self, planner: Arc<dyn Planner>) -> SessionHandle {
        self.spawn(PlanSource::Planner(planner))
    }

    /// Execute an already produced plan.
    pub fn execute(&self, plan: Plan) -> SessionHandle {
        self.spawn(PlanSource::Ready(plan))
    }

    fn spawn(&self, source: PlanSource) -> SessionHandle {
        let session_id = self
            .ctx
            .config()
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let session = Session {
            ctx: Arc::clone(&self.ctx),
            combiner: Arc::clone(&self.combiner),
            emitter: Emitter {
                session_id: session_id.clone(),
                tx,
                callback: self.callback.clone(),
            },
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session.run(source));

        SessionHandle {
            session_id,
            events: rx,
            cancel,
            task,
        }
    }
}

// ---------------------------------------------------------------------------
// Session coordinator
// ---------------------------------------------------------------------------

struct Emitter {
    session_id: String,
    tx: EventSender,
    callback: Option<Arc<dyn CallbackHandler>>,
}

impl Emitter {
    async fn emit(&self, event: PlanEvent) {
        if let Some(callback) = &self.callback {
            if let Err(e) = callback.on_event(event.clone()).await {
                tracing::warn!(
                    session_id = %self.session_id,
                    event = event.kind(),
                    error = %e,
                    "callback failed"
                );
            }
        }
        // The receiver may already be gone; the session still runs to completion.
        let _ = self.tx.send(Ok(event));
    }

    fn fail(&self, error: AutoplanError) {
        tracing::error!(session_id = %self.session_id, error = %error, "session failed");
        let _ = self.tx.send(Err(error));
    }
}

struct Session {
    ctx: Arc<ExecutionContext>,
    combiner: Arc<dyn Combiner>,
    emitter: Emitter,
    cancel: CancellationToken,
}

/// Where the coordinator stands after the dispatch loop.
enum Outcome {
    Completed,
    Cancelled,
}

impl Session {
    fn session_id(&self) -> &str {
        &self.emitter.session_id
    }

    async fn run(self, source: PlanSource) -> SessionReport {
        let mut report = SessionReport::new(self.session_id().to_string());
        tracing::info!(session_id = %self.session_id(), "session started");

        let plan = match self.obtain_plan(source).await {
            Ok(plan) => plan,
            Err(e) => {
                report.cancelled = matches!(e, AutoplanError::Cancelled(_));
                report.error = Some(e.to_string());
                self.emitter.fail(e);
                return report;
            }
        };

        if let Err(e) = validate_plan(&plan, self.ctx.registry()) {
            report.results = StepResults::new(plan.len()).snapshot(&plan);
            let e = AutoplanError::from(e);
            report.error = Some(e.to_string());
            self.emitter.fail(e);
            return report;
        }

        self.emitter
            .emit(PlanEvent::PlanResult {
                session_id: self.session_id().to_string(),
                plan: plan.clone(),
            })
            .await;

        let results = StepResults::new(plan.len());
        let outcome = self.execute_steps(&plan, &results).await;
        report.results = results.snapshot(&plan);

        let outcome = match outcome {
            Ok(Outcome::Completed) => {
                self.combiner
                    .combine(&self.ctx, &plan, &report.results)
                    .await
            }
            Ok(Outcome::Cancelled) => {
                report.cancelled = true;
                Err(AutoplanError::Cancelled(format!(
                    "session {} cancelled",
                    self.session_id()
                )))
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(output) => {
                self.emitter
                    .emit(PlanEvent::FinalResult {
                        session_id: self.session_id().to_string(),
                        output: output.clone(),
                    })
                    .await;
                tracing::info!(session_id = %self.session_id(), steps = plan.len(), "session finished");
                report.output = Some(output);
            }
            Err(e) => {
                report.error = Some(e.to_string());
                self.emitter.fail(e);
            }
        }
        report.plan = Some(plan);
        report
    }

    async fn obtain_plan(&self, source: PlanSource) -> Result<Plan, AutoplanError> {
        let planner = match source {
            PlanSource::Ready(plan) => return Ok(plan),
            PlanSource::Planner(planner) => planner,
        };

        let mut chunks = planner.stream_plan(&self.ctx);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(AutoplanError::Cancelled(format!(
                        "session {} cancelled during planning",
                        self.session_id()
                    )));
                }
                chunk = chunks.next() => chunk,
            };
            match chunk {
                Some(Ok(PlanChunk::Partial(partial))) => {
                    self.emitter
                        .emit(PlanEvent::PartialPlanResult {
                            session_id: self.session_id().to_string(),
                            plan: partial,
                        })
                        .await;
                }
                Some(Ok(PlanChunk::Complete(plan))) => return Ok(plan),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(AutoplanError::Planner(
                        "planner finished without producing a plan".to_string(),
                    ))
                }
            }
        }
    }

    /// Dispatch loop. Runs until every step is terminal, or until cancellation
    /// has drained all in-flight steps.
    async fn execute_steps(
        &self,
        plan: &Plan,
        results: &StepResults,
    ) -> Result<Outcome, AutoplanError> {
        let mut tasks = JoinSet::new();
        let outcome = self.drive(plan, results, &mut tasks).await;
        if outcome.is_err() {
            tasks.shutdown().await;
        }
        outcome
    }

    async fn drive(
        &self,
        plan: &Plan,
        results: &StepResults,
        tasks: &mut JoinSet<(usize, Result<(), AutoplanError>)>,
    ) -> Result<Outcome, AutoplanError> {
        let session_id = self.session_id();
        let config = self.ctx.config();
        let semaphore = Arc::new(Semaphore::new(config.effective_max_concurrency()));
        let executor = ToolExecutor::new(self.ctx.registry().clone())
            .with_timeout(config.tool_timeout())
            .with_cancellation(self.cancel.child_token());
        let mut status = vec![StepStatus::Pending; plan.len()];
        let mut cancelled = false;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                tracing::info!(session_id = %session_id, in_flight = tasks.len(), "session cancelled");
                cancelled = true;
            }
            if !cancelled {
                let mut saturated = false;
                for step in plan.steps() {
                    let index = step.index();
                    if status[index] != StepStatus::Pending {
                        continue;
                    }
                    match readiness(step, &status) {
                        Readiness::Blocked => {}
                        Readiness::Skip(dependency) => {
                            tracing::debug!(
                                session_id = %session_id,
                                step = index,
                                tool = %step.tool_name,
                                dependency,
                                "step skipped"
                            );
                            let skipped = StepResult::skipped(index, &step.tool_name, dependency);
                            results.record(skipped.clone())?;
                            status[index] = StepStatus::Skipped;
                            self.emit_step(skipped).await;
                        }
                        Readiness::Ready if saturated => {}
                        Readiness::Ready => {
                            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                                saturated = true;
                                continue;
                            };
                            let args = resolve_arguments(step, results)?;
                            tracing::debug!(
                                session_id = %session_id,
                                step = index,
                                tool = %step.tool_name,
                                "step dispatched"
                            );
                            status[index] = StepStatus::Running;

                            let executor = executor.clone();
                            let results = results.clone();
                            let tool = step.tool_name.clone();
                            tasks.spawn(async move {
                                let _permit = permit;
                                let call = AssertUnwindSafe(executor.execute(&tool, args));
                                let result = match call.catch_unwind().await {
                                    Ok(Ok(value)) => StepResult::succeeded(index, &tool, value),
                                    Ok(Err(e)) => StepResult::failed(index, &tool, e),
                                    Err(panic) => StepResult::failed(
                                        index,
                                        &tool,
                                        format!("tool '{tool}' panicked: {}", panic_message(&*panic)),
                                    ),
                                };
                                (index, results.record(result))
                            });
                        }
                    }
                }
            }

            if tasks.is_empty() {
                if cancelled {
                    return Ok(Outcome::Cancelled);
                }
                if status.iter().all(StepStatus::is_terminal) {
                    return Ok(Outcome::Completed);
                }
                let stuck: Vec<usize> = status
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !s.is_terminal())
                    .map(|(i, _)| i)
                    .collect();
                return Err(AutoplanError::Scheduling(format!(
                    "steps {stuck:?} can never become ready"
                )));
            }

            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = self.cancel.cancelled(), if !cancelled => continue,
            };

            let index = match joined {
                Some(Ok((index, Ok(())))) => index,
                Some(Ok((_, Err(e)))) => return Err(e),
                Some(Err(e)) => {
                    return Err(AutoplanError::Scheduling(format!("step task failed: {e}")))
                }
                None => continue,
            };
            let Some(result) = results.get(index).cloned() else {
                return Err(AutoplanError::Scheduling(format!(
                    "step {index} finished without recording a result"
                )));
            };

            match &result.error {
                Some(error) => tracing::warn!(
                    session_id = %session_id,
                    step = index,
                    tool = %result.tool,
                    error = %error,
                    "step failed"
                ),
                None => tracing::debug!(
                    session_id = %session_id,
                    step = index,
                    tool = %result.tool,
                    "step completed"
                ),
            }
            status[index] = result.status;
            self.emit_step(result).await;
        }
    }

    async fn emit_step(&self, result: StepResult) {
        self.emitter
            .emit(PlanEvent::StepResult {
                session_id: self.session_id().to_string(),
                result,
            })
            .await;
    }
}

enum Readiness {
    Ready,
    Blocked,
    /// A dependency failed or was skipped.
    Skip(usize),
}

fn readiness(step: &Step, status: &[StepStatus]) -> Readiness {
    let mut ready = true;
    for (_, reference) in step.prior_result_refs() {
        let dependency = reference.index() as usize;
        match status.get(dependency) {
            Some(StepStatus::Failed | StepStatus::Skipped) => return Readiness::Skip(dependency),
            Some(StepStatus::Succeeded) => {}
            _ => ready = false,
        }
    }
    if ready {
        Readiness::Ready
    } else {
        Readiness::Blocked
    }
}

/// Build the argument object for a ready step from its literals and the
/// recorded outputs it references.
fn resolve_arguments(step: &Step, results: &StepResults) -> Result<Value, AutoplanError> {
    let mut args = Map::new();
    for (name, binding) in &step.bindings {
        let value = match binding {
            ArgumentBinding::Literal(value) => value.clone(),
            ArgumentBinding::PriorResult(reference) => {
                let dependency = reference.index() as usize;
                results
                    .get(dependency)
                    .and_then(|r| r.value.clone())
                    .ok_or_else(|| {
                        AutoplanError::Scheduling(format!(
                            "step {} is ready but step {dependency} has no output",
                            step.index()
                        ))
                    })?
            }
        };
        args.insert(name.clone(), value);
    }
    Ok(Value::Object(args))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
