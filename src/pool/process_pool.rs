use super::{JobId, PoolCore, PoolKind, ShutdownMode, WorkerPool};
use crate::config::PoolConfig;
use crate::error::{panic_message, RuntimeError};
use crate::notifier::{JobCompletionInfo, JobCompletionStatus};
use crate::promise::Promise;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::io::{BufRead, BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, info_span, trace, warn};

/// Environment variable that turns a process into a pool worker. Set by
/// [`WorkerCommand`] on every child it launches.
pub const WORKER_ENV: &str = "HYBRID_LOOP_PROCESS_WORKER";

/// A job that can run in an isolated worker process.
///
/// Jobs are plain functions named by [`ProcessJob::NAME`]; only the input and
/// the output cross the process boundary, as JSON. Both the host and the
/// worker must register the job in the same [`JobRegistry`].
pub trait ProcessJob: 'static {
  /// Stable identifier used on the wire. Must be unique within a registry.
  const NAME: &'static str;
  type Input: Serialize + DeserializeOwned;
  type Output: Serialize + DeserializeOwned + Clone + Send + 'static;
  type Error: Display;

  fn run(input: Self::Input) -> Result<Self::Output, Self::Error>;
}

type Dispatch = fn(Value) -> Result<Value, String>;

fn dispatch_job<J: ProcessJob>(input: Value) -> Result<Value, String> {
  let input: J::Input =
    serde_json::from_value(input).map_err(|e| format!("cannot decode input for job `{}`: {}", J::NAME, e))?;
  let output = J::run(input).map_err(|e| e.to_string())?;
  serde_json::to_value(output).map_err(|e| format!("cannot encode output of job `{}`: {}", J::NAME, e))
}

/// The set of [`ProcessJob`]s a process pool may run.
#[derive(Default, Clone)]
pub struct JobRegistry {
  jobs: HashMap<&'static str, Dispatch>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<J: ProcessJob>(mut self) -> Self {
    if self.jobs.insert(J::NAME, dispatch_job::<J> as Dispatch).is_some() {
      warn!(job = J::NAME, "Job registered twice; keeping the latest registration.");
    }
    self
  }

  pub fn contains(&self, name: &str) -> bool {
    self.jobs.contains_key(name)
  }

  fn dispatch(&self, name: &str, input: Value) -> WireOutcome {
    let Some(run) = self.jobs.get(name) else {
      return WireOutcome::Failed(format!("job `{}` is not registered in the worker", name));
    };
    match panic::catch_unwind(AssertUnwindSafe(|| run(input))) {
      Ok(Ok(output)) => WireOutcome::Ok(output),
      Ok(Err(reason)) => WireOutcome::Failed(reason),
      Err(payload) => WireOutcome::Panicked(panic_message(payload.as_ref())),
    }
  }
}

impl fmt::Debug for JobRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<_> = self.jobs.keys().collect();
    names.sort();
    f.debug_struct("JobRegistry").field("jobs", &names).finish()
  }
}

/// How a process pool launches its worker processes.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
  pub program: PathBuf,
  pub args: Vec<String>,
  pub envs: Vec<(String, String)>,
}

impl WorkerCommand {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
      envs: Vec::new(),
    }
  }

  /// Re-executes the running binary. Its `main` must call
  /// [`serve_worker_if_requested`] before doing anything else.
  pub fn current_exe() -> Result<Self, RuntimeError> {
    let program = std::env::current_exe()
      .map_err(|e| RuntimeError::WorkerProcess(format!("cannot locate the current executable: {}", e)))?;
    Ok(Self::new(program))
  }

  pub fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.envs.push((key.into(), value.into()));
    self
  }

  fn to_command(&self) -> Command {
    let mut command = Command::new(&self.program);
    command
      .args(&self.args)
      .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
      .env(WORKER_ENV, "1")
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit());
    command
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerRequest {
  job_id: u64,
  job: String,
  input: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerResponse {
  job_id: u64,
  outcome: WireOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
enum WireOutcome {
  Ok(Value),
  Failed(String),
  Panicked(String),
}

/// Serves jobs from `reader` until it reaches end of input, writing one
/// response line per request line to `writer`.
pub fn serve_worker<R: BufRead, W: Write>(registry: &JobRegistry, reader: R, mut writer: W) -> Result<(), RuntimeError> {
  for line in reader.lines() {
    let line = line.map_err(|e| RuntimeError::WorkerProcess(format!("reading request: {}", e)))?;
    if line.trim().is_empty() {
      continue;
    }
    let request: WorkerRequest = serde_json::from_str(&line)
      .map_err(|e| RuntimeError::WorkerProcess(format!("malformed request: {}", e)))?;
    trace!(job_id = request.job_id, job = %request.job, "Worker received job.");

    let response = WorkerResponse {
      job_id: request.job_id,
      outcome: registry.dispatch(&request.job, request.input),
    };
    let encoded = serde_json::to_string(&response)
      .map_err(|e| RuntimeError::WorkerProcess(format!("encoding response: {}", e)))?;
    writeln!(writer, "{}", encoded)
      .and_then(|_| writer.flush())
      .map_err(|e| RuntimeError::WorkerProcess(format!("writing response: {}", e)))?;
  }
  Ok(())
}

/// Turns the current process into a pool worker when it was launched as one.
///
/// Returns immediately in a normal process. In a worker process it serves jobs
/// from stdin until the pool closes the pipe, then exits the process.
pub fn serve_worker_if_requested(registry: &JobRegistry) {
  if std::env::var_os(WORKER_ENV).is_none() {
    return;
  }
  let span = info_span!("process_worker", pid = std::process::id());
  let _entered = span.enter();
  debug!(?registry, "Serving jobs on stdin.");

  let stdin = std::io::stdin();
  let stdout = std::io::stdout();
  let code = match serve_worker(registry, stdin.lock(), stdout.lock()) {
    Ok(()) => 0,
    Err(e) => {
      error!("Worker process terminating: {}", e);
      1
    }
  };
  std::process::exit(code);
}

/// One live worker process owned by a pool thread.
struct ChildWorker {
  child: Child,
  stdin: Option<ChildStdin>,
  stdout: BufReader<ChildStdout>,
}

impl ChildWorker {
  fn spawn(command: &WorkerCommand) -> Result<Self, RuntimeError> {
    let mut child = command
      .to_command()
      .spawn()
      .map_err(|e| RuntimeError::WorkerProcess(format!("cannot spawn `{}`: {}", command.program.display(), e)))?;
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
      let _ = child.kill();
      let _ = child.wait();
      return Err(RuntimeError::WorkerProcess("worker process has no stdio pipes".to_string()));
    };
    debug!(pid = child.id(), "Spawned worker process.");
    Ok(Self {
      child,
      stdin: Some(stdin),
      stdout: BufReader::new(stdout),
    })
  }

  fn round_trip(&mut self, request: &WorkerRequest) -> Result<WireOutcome, RuntimeError> {
    let encoded = serde_json::to_string(request)
      .map_err(|e| RuntimeError::WorkerProcess(format!("encoding request: {}", e)))?;
    let stdin = self
      .stdin
      .as_mut()
      .ok_or_else(|| RuntimeError::WorkerProcess("worker stdin already closed".to_string()))?;
    writeln!(stdin, "{}", encoded)
      .and_then(|_| stdin.flush())
      .map_err(|e| RuntimeError::WorkerProcess(format!("sending job to worker: {}", e)))?;

    let mut line = String::new();
    loop {
      line.clear();
      let read = self
        .stdout
        .read_line(&mut line)
        .map_err(|e| RuntimeError::WorkerProcess(format!("reading worker response: {}", e)))?;
      if read == 0 {
        return Err(RuntimeError::WorkerProcess("worker process exited mid-job".to_string()));
      }
      match serde_json::from_str::<WorkerResponse>(&line) {
        Ok(response) if response.job_id == request.job_id => return Ok(response.outcome),
        Ok(response) => {
          return Err(RuntimeError::WorkerProcess(format!(
            "worker answered job {} while job {} was in flight",
            response.job_id, request.job_id
          )))
        }
        // Stray output from the job itself.
        Err(_) => trace!(line = %line.trim_end(), "Ignoring non-protocol line from worker."),
      }
    }
  }

  fn kill(mut self) {
    let _ = self.child.kill();
  }
}

impl Drop for ChildWorker {
  fn drop(&mut self) {
    // Closing stdin tells the worker to exit.
    drop(self.stdin.take());
    if let Err(e) = self.child.wait() {
      warn!(pid = self.child.id(), "Failed to reap worker process: {}", e);
    }
  }
}

type Deliver = Box<dyn FnOnce(Result<Value, RuntimeError>, Duration) + Send + 'static>;

struct QueuedProcessJob {
  name: &'static str,
  input: Value,
  deliver: Deliver,
}

/// A pool of worker processes for CPU-bound work that must not share memory
/// with the host.
///
/// Each worker thread owns at most one child process, spawned lazily on its
/// first job and respawned after a protocol or I/O failure.
pub struct ProcessPool {
  core: PoolCore<QueuedProcessJob>,
  registry: Arc<JobRegistry>,
}

impl ProcessPool {
  /// A pool whose workers re-execute the current binary.
  pub fn new(name: &str, workers: usize, registry: Arc<JobRegistry>) -> Result<Arc<Self>, RuntimeError> {
    Self::with_config(PoolConfig::new(name, workers), registry, WorkerCommand::current_exe()?)
  }

  pub fn with_config(config: PoolConfig, registry: Arc<JobRegistry>, command: WorkerCommand) -> Result<Arc<Self>, RuntimeError> {
    let command = Arc::new(command);
    let core = PoolCore::start(&config, PoolKind::Process, |_index| {
      let command = command.clone();
      let mut worker: Option<ChildWorker> = None;
      move |job_id: JobId, job: QueuedProcessJob| {
        let started = Instant::now();
        let outcome = run_in_child(&command, &mut worker, job_id, job.name, job.input);
        (job.deliver)(outcome, started.elapsed());
      }
    })?;
    Ok(Arc::new(Self { core, registry }))
  }

  /// Enqueues job `J` with `input` and returns a promise for its output.
  ///
  /// # Errors
  /// Returns `RuntimeError::NotTransferable` if `J` is not registered with
  /// this pool or `input` cannot be serialized to JSON.
  /// Returns `RuntimeError::PoolShuttingDown` after shutdown.
  pub fn submit<J: ProcessJob>(&self, input: J::Input) -> Result<Promise<J::Output>, RuntimeError> {
    if !self.registry.contains(J::NAME) {
      warn!(pool_name = %self.core.name, job = J::NAME, "Submit: Job is not registered with this pool.");
      return Err(RuntimeError::NotTransferable(format!(
        "job `{}` is not registered with pool `{}`",
        J::NAME,
        self.core.name
      )));
    }
    let input = serde_json::to_value(&input)
      .map_err(|e| RuntimeError::NotTransferable(format!("input of job `{}` cannot be serialized: {}", J::NAME, e)))?;

    let job_id = JobId::next();
    let (resolver, promise) = Promise::channel();
    let notifier = self.core.notifier.clone();

    let deliver: Deliver = Box::new(move |outcome, elapsed| {
      let outcome = outcome.and_then(|value| {
        serde_json::from_value::<J::Output>(value)
          .map_err(|e| RuntimeError::WorkerProcess(format!("cannot decode output of job `{}`: {}", J::NAME, e)))
      });
      let status = JobCompletionStatus::from(&outcome);
      resolver.resolve(outcome);
      notifier.notify(job_id, status, elapsed);
    });

    self.core.enqueue(
      job_id,
      QueuedProcessJob {
        name: J::NAME,
        input,
        deliver,
      },
    )?;
    Ok(promise)
  }

  pub fn add_completion_handler(&self, handler: impl Fn(JobCompletionInfo) + Send + Sync + 'static) {
    self.core.notifier.add_handler(handler);
  }

  pub fn registry(&self) -> &JobRegistry {
    &self.registry
  }
}

fn run_in_child(
  command: &WorkerCommand,
  worker: &mut Option<ChildWorker>,
  job_id: JobId,
  name: &'static str,
  input: Value,
) -> Result<Value, RuntimeError> {
  let mut child = match worker.take() {
    Some(child) => child,
    None => ChildWorker::spawn(command)?,
  };
  let request = WorkerRequest {
    job_id: job_id.as_u64(),
    job: name.to_string(),
    input,
  };
  let outcome = match child.round_trip(&request) {
    Ok(outcome) => outcome,
    Err(e) => {
      error!(%job_id, job = name, "Worker process failed; it will be respawned: {}", e);
      child.kill();
      return Err(e);
    }
  };
  *worker = Some(child);

  match outcome {
    WireOutcome::Ok(value) => Ok(value),
    WireOutcome::Failed(reason) => {
      debug!(%job_id, job = name, "Job failed in worker process: {}", reason);
      Err(RuntimeError::JobFailed(reason))
    }
    WireOutcome::Panicked(reason) => {
      error!(%job_id, job = name, "Job panicked in worker process: {}", reason);
      Err(RuntimeError::JobPanicked(reason))
    }
  }
}

impl WorkerPool for ProcessPool {
  fn name(&self) -> &str {
    self.core.name()
  }

  fn kind(&self) -> PoolKind {
    self.core.kind()
  }

  fn worker_count(&self) -> usize {
    self.core.worker_count()
  }

  fn active_job_count(&self) -> usize {
    self.core.active_job_count()
  }

  fn queued_job_count(&self) -> usize {
    self.core.queued_job_count()
  }

  fn shutdown(&self, mode: ShutdownMode) {
    self.core.shutdown(mode);
    info!(pool_name = %self.core.name, "Worker processes released.");
  }
}

impl fmt::Debug for ProcessPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProcessPool")
      .field("core", &self.core)
      .field("registry", &self.registry)
      .finish()
  }
}
