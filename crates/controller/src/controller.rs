//! Reacts to task status changes by submitting or cancelling batch jobs.
//!
//! Every pipeline task becomes two jobs: the primary job, named after the
//! task, and a companion `<name>-aborted` job that only runs if the primary
//! does not succeed and marks the task aborted. Pipeline-to-pipeline
//! predecessors become `afterok` dependencies, so cancelling one job lets
//! the scheduler cancel everything downstream of it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use obsflow_bus::{Bus, Inbound, InboundOptions, Message};
use obsflow_scheduler::{BatchScheduler, JobConstraints, JobId, TaskSpecification};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::otdb::OtdbClient;
use crate::status::{TaskStatus, TaskStatusNotification};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Gap between an observation's end and the earliest start of a
    /// pipeline that reads its data.
    pub start_margin: chrono::Duration,
    pub run_command: String,
    pub abort_command: String,
    /// `exchange/subject-prefix` the controller listens on.
    pub notification_address: String,
    pub poll_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            start_margin: chrono::Duration::seconds(60),
            run_command: "runPipeline.sh -o {task_id}".into(),
            abort_command: "setOTDBTreeStatus -o {task_id} -s aborted".into(),
            notification_address: "otdb.notification/TaskStatus.".into(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// What happened to a `Scheduled` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Not ours: an observation, or a task for the legacy cluster.
    Ignored,
    /// A pending or running job already carries this task's name, so the
    /// event was a repeat.
    AlreadySubmitted { job_id: JobId },
    Submitted { job_id: JobId, abort_job_id: JobId },
}

pub struct Controller<S> {
    otdb: OtdbClient,
    scheduler: S,
    settings: ControllerSettings,
}

impl<S: BatchScheduler> Controller<S> {
    pub fn new(otdb: OtdbClient, scheduler: S, settings: ControllerSettings) -> Self {
        Self {
            otdb,
            scheduler,
            settings,
        }
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn otdb(&self) -> &OtdbClient {
        &self.otdb
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Consume status notifications until `shutdown` is notified. The event
    /// in flight is finished first. Always closes the subscription and the
    /// RPC clients before returning.
    pub async fn run(&self, bus: &dyn Bus, shutdown: Arc<Notify>) -> Result<(), ControllerError> {
        let subscription = match bus
            .open_inbound(&self.settings.notification_address, InboundOptions::durable())
            .await
        {
            Ok(s) => s,
            Err(e) => {
                self.otdb.close().await;
                return Err(e.into());
            }
        };
        info!(
            address = %self.settings.notification_address,
            queue = %subscription.queue(),
            "listening for task status changes"
        );

        let result = self.consume(subscription.as_ref(), &shutdown).await;

        if let Err(e) = subscription.close().await {
            warn!(error = %e, "failed to close notification subscription");
        }
        self.otdb.close().await;
        info!("controller stopped");
        result
    }

    async fn consume(&self, subscription: &dyn Inbound, shutdown: &Notify) -> Result<(), ControllerError> {
        loop {
            tokio::select! {
                _ = shutdown.notified() => return Ok(()),
                received = subscription.receive(self.settings.poll_interval) => {
                    if let Some(message) = received? {
                        self.handle_message(&message).await;
                    }
                }
            }
        }
    }

    /// Decode one notification and act on it. Never fails: problems are
    /// logged and the event is dropped.
    pub async fn handle_message(&self, message: &Message) {
        let notification: TaskStatusNotification = match message.decode() {
            Ok(n) => n,
            Err(e) => {
                warn!(subject = %message.subject, error = %e, "dropping undecodable notification");
                return;
            }
        };
        match notification.status() {
            Ok(status) => self.handle_notification(notification.tree_id, status).await,
            Err(e) => debug!(task_id = notification.tree_id, error = %e, "ignoring notification"),
        }
    }

    /// Error boundary for one event.
    pub async fn handle_notification(&self, task_id: u32, status: TaskStatus) {
        let result = match status {
            TaskStatus::Scheduled => self.on_task_scheduled(task_id).await.map(|outcome| {
                debug!(task_id, ?outcome, "scheduled event handled");
            }),
            s if s.is_abort_like() => self.on_task_aborted(task_id).await,
            other => {
                debug!(task_id, status = %other, "nothing to do for status");
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(task_id, status = %status, stage = e.stage(), error = %e, "failed to handle status change");
        }
    }

    /// Turn a newly scheduled pipeline into its primary and companion jobs,
    /// then mark it queued. A repeated event for a pipeline whose primary is
    /// still pending or running submits nothing.
    pub async fn on_task_scheduled(&self, task_id: u32) -> Result<ScheduleOutcome, ControllerError> {
        let spec = self.otdb.get_specification(task_id).await?;
        if !is_ours(&spec) {
            debug!(task_id, kind = ?spec.kind(), cluster = %spec.cluster_target().target, "not a pipeline for this cluster");
            return Ok(ScheduleOutcome::Ignored);
        }

        let job_name = spec.job_name();
        let active = self
            .scheduler
            .active_job_id(&job_name)
            .await
            .map_err(|source| ControllerError::LookupJob {
                task_id,
                job_name: job_name.clone(),
                source,
            })?;
        if let Some(job_id) = active {
            info!(task_id, %job_id, "pipeline already submitted, not submitting again");
            self.otdb.set_status(task_id, TaskStatus::Queued).await?;
            return Ok(ScheduleOutcome::AlreadySubmitted { job_id });
        }

        let predecessors = self.fetch_predecessors(&spec).await?;
        let begin = earliest_start(&predecessors, self.settings.start_margin);

        let mut depends_on = Vec::new();
        for pred in predecessors.iter().filter(|p| p.is_pipeline()) {
            let id = self
                .scheduler
                .require_job_id(&pred.job_name())
                .await
                .map_err(|source| ControllerError::ResolveDependency { task_id, source })?;
            depends_on.push(id);
        }

        let cluster = spec.cluster_target();
        let constraints = JobConstraints {
            partition: Some(cluster.partition.clone()),
            cpus_per_task: Some(cluster.cores_per_task),
            mem_per_cpu_mb: Some(cluster.mem_per_cpu_mb()),
            begin,
            ..JobConstraints::after_ok(depends_on)
        };

        let job_id = self
            .submit(task_id, &job_name, &self.settings.run_command, &constraints)
            .await?;

        let abort_job_name = spec.abort_job_name();
        let abort_job_id = match self
            .submit(
                task_id,
                &abort_job_name,
                &self.settings.abort_command,
                &JobConstraints::after_not_ok(job_id.clone()),
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // No primary runs without its companion.
                warn!(task_id, %job_id, "companion submission failed, cancelling primary");
                self.scheduler.cancel(&job_name).await;
                return Err(e);
            }
        };

        info!(task_id, %job_id, %abort_job_id, begin = ?begin, "pipeline submitted");
        self.otdb.set_status(task_id, TaskStatus::Queued).await?;

        Ok(ScheduleOutcome::Submitted {
            job_id,
            abort_job_id,
        })
    }

    /// Cancel a pipeline's primary job. Its companion then runs and
    /// dependents are cancelled by the scheduler.
    pub async fn on_task_aborted(&self, task_id: u32) -> Result<(), ControllerError> {
        let spec = self.otdb.get_specification(task_id).await?;
        if !is_ours(&spec) {
            debug!(task_id, "abort of a task this controller does not run");
            return Ok(());
        }
        info!(task_id, "cancelling pipeline");
        self.scheduler.cancel(&spec.job_name()).await;
        Ok(())
    }

    async fn fetch_predecessors(
        &self,
        spec: &TaskSpecification,
    ) -> Result<Vec<TaskSpecification>, ControllerError> {
        let mut out = Vec::with_capacity(spec.predecessors().len());
        for &predecessor in spec.predecessors() {
            let pred = self
                .fetch_predecessor(predecessor)
                .await
                .map_err(|e| ControllerError::Predecessor {
                    task_id: spec.task_id(),
                    predecessor,
                    source: Box::new(e),
                })?;
            out.push(pred);
        }
        Ok(out)
    }

    /// Observation predecessors must carry the times the start is derived
    /// from.
    async fn fetch_predecessor(&self, task_id: u32) -> Result<TaskSpecification, ControllerError> {
        let pred = self.otdb.get_specification(task_id).await?;
        if pred.is_observation() {
            pred.observation_window()
                .map_err(|source| ControllerError::InvalidSpecification { task_id, source })?;
        }
        Ok(pred)
    }

    async fn submit(
        &self,
        task_id: u32,
        job_name: &str,
        template: &str,
        constraints: &JobConstraints,
    ) -> Result<JobId, ControllerError> {
        let command = render_command(template, task_id, job_name);
        self.scheduler
            .submit(job_name, &command, constraints)
            .await
            .map_err(|source| ControllerError::Submit {
                task_id,
                job_name: job_name.to_string(),
                source,
            })
    }
}

fn is_ours(spec: &TaskSpecification) -> bool {
    spec.is_pipeline() && !spec.cluster_target().target.is_legacy()
}

/// Latest observation stop time plus `margin`; `None` without observation
/// predecessors.
pub fn earliest_start(
    predecessors: &[TaskSpecification],
    margin: chrono::Duration,
) -> Option<DateTime<Utc>> {
    predecessors
        .iter()
        .filter(|p| p.is_observation())
        .filter_map(TaskSpecification::stop_time)
        .max()
        .map(|stop| stop + margin)
}

/// Substitute `{task_id}` and `{job_name}`.
pub fn render_command(template: &str, task_id: u32, job_name: &str) -> String {
    template
        .replace("{task_id}", &task_id.to_string())
        .replace("{job_name}", job_name)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use obsflow_scheduler::specification::{
        KEY_CLUSTER_NAME, KEY_PROCESS_TYPE, KEY_START_TIME, KEY_STOP_TIME,
    };
    use obsflow_scheduler::Parset;

    use super::*;

    fn observation(id: u32, stop: &str) -> TaskSpecification {
        let parset = Parset::new()
            .with(KEY_PROCESS_TYPE, "Observation")
            .with(KEY_START_TIME, "2016-03-01 10:00:00")
            .with(KEY_STOP_TIME, stop);
        TaskSpecification::from_parset(id, parset).unwrap()
    }

    fn pipeline(id: u32, cluster: &str) -> TaskSpecification {
        let parset = Parset::new()
            .with(KEY_PROCESS_TYPE, "Pipeline")
            .with(KEY_CLUSTER_NAME, cluster);
        TaskSpecification::from_parset(id, parset).unwrap()
    }

    #[test]
    fn start_follows_latest_observation() {
        let preds = vec![
            observation(1, "2016-03-01 12:00:00"),
            observation(2, "2016-03-01 11:00:00"),
            pipeline(3, "CEP4"),
        ];
        assert_eq!(
            earliest_start(&preds, chrono::Duration::seconds(60)),
            Some(Utc.with_ymd_and_hms(2016, 3, 1, 12, 1, 0).unwrap())
        );
    }

    #[test]
    fn no_start_without_observations() {
        assert_eq!(earliest_start(&[], chrono::Duration::seconds(60)), None);
        assert_eq!(
            earliest_start(&[pipeline(3, "CEP4")], chrono::Duration::seconds(60)),
            None
        );
    }

    #[test]
    fn commands_substitute_placeholders() {
        assert_eq!(
            render_command("runPipeline.sh -o {task_id}", 123, "123"),
            "runPipeline.sh -o 123"
        );
        assert_eq!(
            render_command("run {job_name} for {task_id}", 5, "5-aborted"),
            "run 5-aborted for 5"
        );
        assert_eq!(render_command("true", 5, "5"), "true");
    }

    #[test]
    fn only_cep4_pipelines_are_ours() {
        assert!(is_ours(&pipeline(1, "CEP4")));
        assert!(!is_ours(&pipeline(1, "CEP2")));
        assert!(!is_ours(&observation(1, "2016-03-01 12:00:00")));
    }
}
