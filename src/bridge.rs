//! Request bridge
//!
//! Every session operation runs on one background execution context: a
//! dedicated thread driving a current-thread tokio runtime that owns the
//! [`SessionManager`]. Callers on any thread hand it a job and block until the
//! result arrives or the wait bound passes.
//!
//! Jobs run one at a time in submission order, so the session never sees
//! concurrent protocol traffic and needs no lock of its own.
//!
//! Timing out does not cancel anything. The job keeps running and its result
//! is discarded when it eventually completes, so a timeout means the outcome
//! is unknown, not that the operation was aborted.

use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rmcp::model::{CallToolResult, JsonObject, ListToolsResult};
use tokio::sync::mpsc;

use crate::error::WrapperError;
use crate::session::{ServerParams, SessionConnector, SessionManager};

/// How long a caller waits for its operation before giving up
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

type Job = Box<dyn for<'a> FnOnce(&'a mut SessionManager) -> BoxFuture<'a, ()> + Send>;

fn into_job<F>(f: F) -> Job
where
    F: for<'a> FnOnce(&'a mut SessionManager) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// The background thread and the queue feeding it
struct ExecutionContext {
    jobs: mpsc::UnboundedSender<Job>,
    carrier: JoinHandle<()>,
    generation: u64,
}

impl ExecutionContext {
    fn spawn(
        params: ServerParams,
        connector: Arc<dyn SessionConnector>,
        generation: u64,
    ) -> Result<Self, WrapperError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                WrapperError::ContextUnavailable(format!("failed to build runtime: {}", e))
            })?;

        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();

        let carrier = std::thread::Builder::new()
            .name(format!("mcp-session-{}", generation))
            .spawn(move || {
                runtime.block_on(async move {
                    let mut manager = SessionManager::new(params, connector);
                    tracing::debug!(generation, "execution context started");

                    while let Some(job) = queue.recv().await {
                        job(&mut manager).await;
                    }

                    if let Err(e) = manager.close().await {
                        tracing::warn!("{}", e);
                    }
                    tracing::debug!(generation, "execution context stopped");
                });
            })
            .map_err(|e| {
                WrapperError::ContextUnavailable(format!("failed to spawn carrier thread: {}", e))
            })?;

        Ok(Self {
            jobs,
            carrier,
            generation,
        })
    }

    fn is_running(&self) -> bool {
        !self.carrier.is_finished() && !self.jobs.is_closed()
    }
}

/// Lets blocking callers drive the single shared session
pub struct RequestBridge {
    params: ServerParams,
    connector: Arc<dyn SessionConnector>,
    wait_timeout: Duration,
    context: Mutex<Option<ExecutionContext>>,
}

impl RequestBridge {
    /// Create a bridge. The execution context starts on the first submission.
    pub fn new(params: ServerParams, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            params,
            connector,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            context: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn params(&self) -> &ServerParams {
        &self.params
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Whether a live execution context currently exists
    pub fn is_running(&self) -> bool {
        self.lock_context()
            .as_ref()
            .is_some_and(ExecutionContext::is_running)
    }

    /// How many execution contexts have been started (0 before first use)
    pub fn generation(&self) -> u64 {
        self.lock_context()
            .as_ref()
            .map_or(0, |context| context.generation)
    }

    /// Run `operation` against the session manager and block for its result.
    ///
    /// Fails with [`WrapperError::Timeout`] once the wait bound passes; the
    /// operation is left running in the background.
    pub fn submit_and_wait<T, F>(&self, operation: F) -> Result<T, WrapperError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut SessionManager) -> BoxFuture<'a, Result<T, WrapperError>>
            + Send
            + 'static,
    {
        self.submit_and_wait_for(self.wait_timeout, operation)
    }

    fn submit_and_wait_for<T, F>(&self, wait: Duration, operation: F) -> Result<T, WrapperError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut SessionManager) -> BoxFuture<'a, Result<T, WrapperError>>
            + Send
            + 'static,
    {
        let deadline = Instant::now() + wait;
        let (reply, outcome) = std_mpsc::channel();

        self.dispatch(into_job(move |manager| {
            Box::pin(async move {
                let result = operation(manager).await;
                if reply.send(result).is_err() {
                    tracing::warn!("MCP operation finished after its caller stopped waiting");
                }
            })
        }))?;

        match outcome.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_secs = wait.as_secs_f64(),
                    "Gave up waiting for MCP operation; it keeps running in the background"
                );
                Err(WrapperError::Timeout(wait))
            }
            Err(RecvTimeoutError::Disconnected) => Err(WrapperError::ContextUnavailable(
                "execution context stopped before the operation completed".to_string(),
            )),
        }
    }

    pub fn list_tools(&self) -> Result<ListToolsResult, WrapperError> {
        self.submit_and_wait(|manager| Box::pin(manager.list_tools()))
    }

    pub fn call_tool(
        &self,
        name: impl Into<String>,
        arguments: JsonObject,
    ) -> Result<CallToolResult, WrapperError> {
        let name = name.into();
        self.submit_and_wait(move |manager| {
            Box::pin(async move { manager.call_tool(&name, arguments).await })
        })
    }

    /// Release the session (if any). The execution context stays up.
    pub fn close_session(&self) -> Result<(), WrapperError> {
        self.submit_and_wait(|manager| Box::pin(manager.close()))
    }

    /// [`close_session`](Self::close_session) with its own wait bound, for
    /// callers such as shutdown that cannot sit behind a hung operation.
    pub fn close_session_within(&self, wait: Duration) -> Result<(), WrapperError> {
        self.submit_and_wait_for(wait, |manager| Box::pin(manager.close()))
    }

    /// Queue `job` on the live context, starting a fresh one if there is none
    fn dispatch(&self, job: Job) -> Result<(), WrapperError> {
        let mut slot = self.lock_context();

        let job = match slot.as_ref() {
            Some(context) if context.is_running() => match context.jobs.send(job) {
                Ok(()) => return Ok(()),
                // The context died between the check and the send
                Err(mpsc::error::SendError(job)) => job,
            },
            _ => job,
        };

        let generation = slot.as_ref().map_or(0, |context| context.generation) + 1;
        if generation > 1 {
            tracing::warn!(generation, "Execution context is not running, starting a new one");
        }

        let context =
            ExecutionContext::spawn(self.params.clone(), self.connector.clone(), generation)?;
        context.jobs.send(job).map_err(|_| {
            WrapperError::ContextUnavailable("execution context exited on startup".to_string())
        })?;
        *slot = Some(context);
        Ok(())
    }

    fn lock_context(&self) -> std::sync::MutexGuard<'_, Option<ExecutionContext>> {
        // Only the handle lives behind this lock; it is never held across a job.
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
