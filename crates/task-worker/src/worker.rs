//! Task worker - bounded-concurrency intake and per-task orchestration
//!
//! One loop pops descriptors off the work queue. Each descriptor waits for a
//! semaphore permit and then runs on its own tokio task, so a full worker
//! stops pulling from the queue instead of dropping work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_runner::{
    AgentRunner, ExecutionResult, ProviderOptions, RunRequest, RunnerEvent, ToolEvent,
};
use relay_core::output_store::OutputStore;
use relay_core::queue::WorkQueue;
use relay_core::stream::{truncate_to_bytes, EventPublisher, EventType, MAX_RAW_OUTPUT_BYTES};
use relay_core::task::{Task, TaskDescriptor, TaskRepository, TaskStatus};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::conversation::{fallback_notice, ContextProvider, CONTEXT_MESSAGES};
use crate::error::Result;
use crate::notify::Notifier;
use crate::posting::{extract_posted_comment_ids, CommentLedger, ResponsePoster};
use crate::routing::{
    agent_already_posted, build_prompt, build_task_context, extract_mcp_posted_content,
};
use crate::validation::{clean_agent_output, detect_auth_failure};

const MAX_CONTEXT_PROMPT_CHARS: usize = 50_000;
const RUNNER_EVENT_BUFFER: usize = 256;
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Collaborators the worker drives
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn WorkQueue>,
    pub publisher: EventPublisher,
    pub tasks: Arc<dyn TaskRepository>,
    pub outputs: OutputStore,
    pub runner: Arc<dyn AgentRunner>,
    /// Conversation service for webhook flows; webhook tasks run without
    /// history when absent
    pub context: Option<Arc<dyn ContextProvider>>,
    pub poster: Arc<dyn ResponsePoster>,
    pub notifier: Arc<dyn Notifier>,
    pub ledger: Arc<CommentLedger>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub in_flight: usize,
    pub capacity: usize,
}

#[derive(Clone)]
pub struct TaskWorker {
    inner: Arc<Inner>,
}

struct Inner {
    config: WorkerConfig,
    deps: WorkerDeps,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    running: AtomicBool,
}

/// Prompt and flow details resolved before the agent starts
struct PreparedPrompt {
    prompt: String,
    flow_conversation: Option<String>,
}

impl TaskWorker {
    pub fn new(config: WorkerConfig, deps: WorkerDeps) -> Self {
        let capacity = config.max_concurrent_tasks.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                deps,
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn deps(&self) -> &WorkerDeps {
        &self.inner.deps
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            running: self.is_running(),
            in_flight: self.in_flight(),
            capacity: self.inner.capacity,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.capacity - self.inner.semaphore.available_permits()
    }

    /// Pull from the queue until [`stop`](Self::stop) is called. In-flight
    /// tasks keep running after this returns.
    pub async fn run(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
        info!(
            max_concurrent = self.inner.capacity,
            provider = %self.inner.config.provider,
            "Task worker started"
        );

        while self.is_running() {
            let descriptor = match self.inner.deps.queue.pop(self.inner.config.poll_timeout).await {
                Ok(Some(descriptor)) => descriptor,
                Ok(None) => continue,
                Err(e) => {
                    error!("Queue pop failed: {}", e);
                    tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&self.inner.semaphore).acquire_owned().await else {
                break;
            };
            self.spawn_task(descriptor, permit);
        }

        info!("Task worker stopped");
    }

    fn spawn_task(&self, descriptor: TaskDescriptor, permit: OwnedSemaphorePermit) {
        let worker = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            worker.process_guarded(descriptor).await;
        });
    }

    /// [`process`](Self::process) on its own tokio task, so a panic while
    /// processing still leaves the task failed
    pub async fn process_guarded(&self, mut descriptor: TaskDescriptor) -> Task {
        if descriptor.task_id.is_empty() {
            descriptor.task_id = Uuid::new_v4().to_string();
        }
        let task_id = descriptor.task_id.clone();
        let worker = self.clone();
        let fallback = descriptor.clone();

        let error = match tokio::spawn(async move { worker.process(descriptor).await }).await {
            Ok(task) => return task,
            Err(e) => e,
        };
        let message = if error.is_panic() {
            "Task processing panicked"
        } else {
            "Task processing was cancelled"
        };

        let mut task = match self.inner.deps.tasks.get(&task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => Task::from_descriptor(&fallback),
            Err(e) => {
                warn!(%task_id, "Mirrored task unavailable: {}", e);
                Task::from_descriptor(&fallback)
            }
        };
        self.handle_fault(&mut task, message).await;
        task
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Wait until every permit is back, i.e. no task is in flight
    pub async fn wait_idle(&self) {
        let permits = u32::try_from(self.inner.capacity).unwrap_or(u32::MAX);
        if let Ok(all) = self.inner.semaphore.acquire_many(permits).await {
            drop(all);
        }
    }

    /// Run one task to a terminal state and return it
    pub async fn process(&self, mut descriptor: TaskDescriptor) -> Task {
        if descriptor.task_id.is_empty() {
            descriptor.task_id = Uuid::new_v4().to_string();
        }
        let mut task = Task::from_descriptor(&descriptor);
        if task.assigned_agent.is_none() {
            task.assigned_agent = Some(self.inner.config.default_agent.clone());
        }

        if let Err(e) = self.execute(&descriptor, &mut task).await {
            self.handle_fault(&mut task, &e.to_string()).await;
        }
        task
    }

    async fn execute(&self, descriptor: &TaskDescriptor, task: &mut Task) -> Result<()> {
        let task_id = task.task_id.clone();
        info!(%task_id, source = %task.source, "Processing task");

        self.mirror(task).await;
        self.publish(
            EventType::TaskCreated,
            json!({
                "task_id": task_id,
                "session_id": task.session_id,
                "input_message": task.input_message,
                "source": task.source,
                "assigned_agent": task.assigned_agent,
                "source_metadata": task.source_metadata,
            }),
            &task_id,
        )
        .await;

        task.start()?;
        self.mirror(task).await;
        self.publish(
            EventType::TaskStarted,
            json!({
                "task_id": task_id,
                "session_id": task.session_id,
                "conversation_id": task.conversation_id,
            }),
            &task_id,
        )
        .await;

        let prepared = self.prepare_prompt(descriptor, task).await;
        let result = self.run_agent(descriptor, task, &prepared.prompt).await;

        let mcp_posted = task.source.is_webhook() && agent_already_posted(&result);
        let cleaned = match mcp_posted.then(|| extract_mcp_posted_content(&result)).flatten() {
            Some(posted) => posted,
            None => {
                let source = if result.clean_output.is_empty() {
                    &result.output
                } else {
                    &result.clean_output
                };
                clean_agent_output(source)
            }
        };

        self.inner
            .deps
            .outputs
            .save(&task_id, &result.output, &cleaned)
            .await?;
        self.publish(
            EventType::TaskRawOutput,
            json!({
                "task_id": task_id,
                "raw_output": truncate_to_bytes(&result.output, MAX_RAW_OUTPUT_BYTES),
            }),
            &task_id,
        )
        .await;
        if !cleaned.is_empty() {
            self.publish(
                EventType::TaskOutput,
                json!({"task_id": task_id, "content": cleaned}),
                &task_id,
            )
            .await;
        }

        let mut success = result.success;
        let mut failure = result.error.clone();
        if let Some(signature) = detect_auth_failure(&cleaned) {
            warn!(%task_id, %signature, "Authentication failure in agent output");
            success = false;
            failure = Some(format!("Authentication failure detected: {}", signature));
        }

        self.finish(task, &result, &cleaned, success, failure).await?;

        if task.source.is_webhook() {
            self.deliver_response(task, &result, &cleaned, success, mcp_posted, &prepared)
                .await;
        }

        self.send_notification(task, &cleaned).await;
        Ok(())
    }

    async fn prepare_prompt(
        &self,
        descriptor: &TaskDescriptor,
        task: &mut Task,
    ) -> PreparedPrompt {
        if !task.source.is_webhook() {
            return PreparedPrompt {
                prompt: build_prompt(descriptor),
                flow_conversation: None,
            };
        }

        let (prompt, flow_conversation) = match self.fetch_flow_context(descriptor, task).await {
            Ok((prompt, conversation_id)) => (prompt, conversation_id),
            Err(e) => {
                warn!(task_id = %task.task_id, "Context unavailable, using routed prompt: {}", e);
                (build_prompt(descriptor), None)
            }
        };
        if task.conversation_id.is_none() {
            task.conversation_id = flow_conversation.clone();
        }

        let capped: String = prompt.chars().take(MAX_CONTEXT_PROMPT_CHARS).collect();
        self.publish(
            EventType::TaskContextBuilt,
            json!({
                "task_id": task.task_id,
                "enriched_prompt": capped,
                "flow_id": task.source_metadata.flow_id(),
                "conversation_id": task.conversation_id,
                "source_metadata": task.source_metadata,
                "event_type": descriptor.event_type,
            }),
            &task.task_id,
        )
        .await;

        PreparedPrompt {
            prompt,
            flow_conversation,
        }
    }

    async fn fetch_flow_context(
        &self,
        descriptor: &TaskDescriptor,
        task: &Task,
    ) -> Result<(String, Option<String>)> {
        let Some(provider) = self.inner.deps.context.as_ref() else {
            return Ok((build_task_context(descriptor, &[]), None));
        };
        let conversation_id = provider.open_flow(task).await?;
        let context = provider
            .fetch_context(&conversation_id, CONTEXT_MESSAGES)
            .await?;
        debug!(task_id = %task.task_id, messages = context.len(), "Conversation context loaded");
        Ok((build_task_context(descriptor, &context), Some(conversation_id)))
    }

    async fn run_agent(
        &self,
        descriptor: &TaskDescriptor,
        task: &Task,
        prompt: &str,
    ) -> ExecutionResult {
        let config = &self.inner.config;
        let working_dir = descriptor
            .repo_path
            .clone()
            .unwrap_or_else(|| config.default_repo_path.clone());
        let options = ProviderOptions {
            model: descriptor.model.clone(),
            agent: task.assigned_agent.clone(),
            ..Default::default()
        };
        let request = RunRequest::new(&task.task_id, prompt, working_dir)
            .with_timeout(config.task_timeout_seconds)
            .with_options(options);

        let (tx, rx) = mpsc::channel(RUNNER_EVENT_BUFFER);
        let forwarder = tokio::spawn(forward_runner_events(
            self.inner.deps.publisher.clone(),
            task.task_id.clone(),
            rx,
        ));

        let result = self.inner.deps.runner.run(request, Some(tx)).await;
        if let Err(e) = forwarder.await {
            warn!(task_id = %task.task_id, "Runner event forwarder ended abnormally: {}", e);
        }
        info!(
            task_id = %task.task_id,
            success = result.success,
            exit_code = ?result.exit_code,
            "Agent run finished"
        );
        result
    }

    async fn finish(
        &self,
        task: &mut Task,
        result: &ExecutionResult,
        cleaned: &str,
        success: bool,
        failure: Option<String>,
    ) -> Result<()> {
        let task_id = task.task_id.clone();
        if result.session_id.is_some() && task.session_id.is_none() {
            task.session_id = result.session_id.clone();
        }

        if success {
            task.complete(
                cleaned,
                result.cost_usd,
                result.input_tokens,
                result.output_tokens,
            )?;
        } else {
            task.cost_usd = result.cost_usd;
            task.input_tokens = result.input_tokens;
            task.output_tokens = result.output_tokens;
            task.fail(failure.unwrap_or_else(|| "Unknown error".to_string()))?;
        }
        self.mirror(task).await;

        self.publish(
            EventType::TaskMetrics,
            json!({
                "task_id": task_id,
                "cost_usd": task.cost_usd,
                "input_tokens": task.input_tokens,
                "output_tokens": task.output_tokens,
                "duration_seconds": task.duration_seconds,
            }),
            &task_id,
        )
        .await;

        let (event_type, payload) = if success {
            (
                EventType::TaskCompleted,
                json!({
                    "task_id": task_id,
                    "session_id": task.session_id,
                    "conversation_id": task.conversation_id,
                    "status": TaskStatus::Completed.as_str(),
                    "result": task.result,
                    "cost_usd": task.cost_usd,
                    "input_tokens": task.input_tokens,
                    "output_tokens": task.output_tokens,
                    "duration_seconds": task.duration_seconds,
                }),
            )
        } else {
            (
                EventType::TaskFailed,
                json!({
                    "task_id": task_id,
                    "session_id": task.session_id,
                    "conversation_id": task.conversation_id,
                    "status": TaskStatus::Failed.as_str(),
                    "error": task.error,
                    "result": (!cleaned.is_empty()).then_some(cleaned),
                    "cost_usd": task.cost_usd,
                    "input_tokens": task.input_tokens,
                    "output_tokens": task.output_tokens,
                    "duration_seconds": task.duration_seconds,
                }),
            )
        };
        self.publish(event_type, payload, &task_id).await;

        info!(%task_id, status = %task.status.as_str(), "Task finished");
        Ok(())
    }

    /// Make sure the originating platform got an answer, and record what was
    /// posted so its webhooks are not mistaken for new work
    async fn deliver_response(
        &self,
        task: &Task,
        result: &ExecutionResult,
        cleaned: &str,
        success: bool,
        mcp_posted: bool,
        prepared: &PreparedPrompt,
    ) {
        let deps = &self.inner.deps;
        let task_id = task.task_id.as_str();
        let source = task.source.as_str();

        let (method, comment_ids, fallback_posted) = if mcp_posted {
            let ids = extract_posted_comment_ids(&result.tool_events);
            deps.ledger.track(&ids, task_id, "mcp");
            ("mcp", ids, false)
        } else {
            let body = if cleaned.is_empty() {
                task.error.as_deref().unwrap_or_default()
            } else {
                cleaned
            };
            let outcome = match deps.poster.post(task, body, success).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(%task_id, %source, "Fallback posting failed: {}", e);
                    Default::default()
                }
            };
            let ids: Vec<String> = outcome.comment_id.into_iter().collect();
            deps.ledger.track(&ids, task_id, "fallback");

            if let Some(conversation_id) = prepared.flow_conversation.as_deref() {
                self.post_to_conversation(
                    conversation_id,
                    "system",
                    &fallback_notice(source, outcome.posted),
                    task_id,
                )
                .await;
            }

            let method = if outcome.posted { "fallback" } else { "failed" };
            (method, ids, outcome.posted)
        };

        self.publish(
            EventType::TaskResponsePosted,
            json!({
                "task_id": task_id,
                "method": method,
                "source": source,
                "mcp_detected": mcp_posted,
                "fallback_posted": fallback_posted,
                "comment_ids": comment_ids,
                "success": success,
            }),
            task_id,
        )
        .await;

        if let Some(conversation_id) = task.conversation_id.as_deref() {
            if !cleaned.is_empty() {
                self.post_to_conversation(conversation_id, "assistant", cleaned, task_id)
                    .await;
            }
        }
    }

    async fn post_to_conversation(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        task_id: &str,
    ) {
        let Some(provider) = self.inner.deps.context.as_ref() else {
            return;
        };
        if let Err(e) = provider
            .post_message(conversation_id, role, content, task_id)
            .await
        {
            warn!(%task_id, %conversation_id, %role, "Conversation update failed: {}", e);
        }
    }

    async fn send_notification(&self, task: &Task, output: &str) {
        match self.inner.deps.notifier.notify(task, output).await {
            Ok(sent) => debug!(task_id = %task.task_id, sent, "Notification handled"),
            Err(e) => warn!(task_id = %task.task_id, "Notification failed: {}", e),
        }
    }

    async fn handle_fault(&self, task: &mut Task, message: &str) {
        error!(task_id = %task.task_id, "Task processing failed: {}", message);

        if !task.status.is_terminal() {
            if task.status == TaskStatus::Queued {
                if let Err(e) = task.start() {
                    warn!(task_id = %task.task_id, "{}", e);
                }
            }
            if let Err(e) = task.fail(message) {
                warn!(task_id = %task.task_id, "{}", e);
            }
            self.mirror(task).await;
        }

        self.publish(
            EventType::TaskFailed,
            json!({
                "task_id": task.task_id,
                "status": task.status.as_str(),
                "error": message,
                "duration_seconds": task.duration_seconds,
            }),
            &task.task_id,
        )
        .await;
        self.send_notification(task, "").await;
    }

    async fn mirror(&self, task: &Task) {
        if let Err(e) = self.inner.deps.tasks.save(task.clone()).await {
            warn!(task_id = %task.task_id, "Failed to mirror task: {}", e);
        }
    }

    async fn publish(&self, event_type: EventType, payload: Value, task_id: &str) {
        self.inner
            .deps
            .publisher
            .publish(event_type, payload, Some(task_id), None)
            .await;
    }
}

/// Publish the runner's structured events while the agent is live
async fn forward_runner_events(
    publisher: EventPublisher,
    task_id: String,
    mut events: mpsc::Receiver<RunnerEvent>,
) {
    while let Some(event) = events.recv().await {
        let (event_type, payload) = match event {
            RunnerEvent::ToolCall(ToolEvent::ToolCall { id, name, input }) => (
                EventType::TaskToolCall,
                json!({"task_id": task_id, "name": name, "input": input, "tool_use_id": id}),
            ),
            RunnerEvent::ToolResult(ToolEvent::ToolResult {
                name,
                content,
                is_error,
            }) => (
                EventType::TaskToolResult,
                json!({"task_id": task_id, "name": name, "content": content, "is_error": is_error}),
            ),
            RunnerEvent::Thinking(block) => (
                EventType::TaskThinking,
                json!({"task_id": task_id, "content": block.content}),
            ),
            RunnerEvent::Output(_) | RunnerEvent::ToolCall(_) | RunnerEvent::ToolResult(_) => {
                continue
            }
        };
        publisher
            .publish(event_type, payload, Some(&task_id), None)
            .await;
    }
}
