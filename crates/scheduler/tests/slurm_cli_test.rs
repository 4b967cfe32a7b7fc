//! Drives `SlurmGateway` through `LocalRunner` against stand-in `sbatch`,
//! `sacct`, `squeue` and `scancel` scripts.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use obsflow_scheduler::{
    BatchScheduler, CommandOutput, CommandRunner, JobConstraints, JobId, LocalRunner,
    SchedulerError, SlurmGateway,
};

/// Runs programs out of `dir` instead of `$PATH`.
struct ScriptRunner {
    dir: PathBuf,
    inner: LocalRunner,
}

#[async_trait]
impl CommandRunner for ScriptRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, SchedulerError> {
        let mut argv = argv.to_vec();
        argv[0] = self.dir.join(&argv[0]).display().to_string();
        self.inner.run(&argv).await
    }
}

fn script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\necho \"{name} $*\" >> \"$(dirname \"$0\")/calls.log\"\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn gateway(dir: &Path) -> SlurmGateway<ScriptRunner> {
    SlurmGateway::new(ScriptRunner {
        dir: dir.to_path_buf(),
        inner: LocalRunner::default(),
    })
}

fn calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn submit_lookup_and_cancel() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "sbatch", "echo 'Submitted batch job 4242'");
    script(
        dir.path(),
        "sacct",
        "printf '4240|123\\n4240.batch|batch\\n4242|123\\n4243|123-aborted\\n'",
    );
    script(dir.path(), "scancel", "exit 0");
    let slurm = gateway(dir.path());

    let id = slurm
        .submit("123", "runPipeline.sh -o 123", &JobConstraints::after_ok([JobId::new("11")]))
        .await
        .unwrap();
    assert_eq!(id, JobId::new("4242"));

    assert_eq!(slurm.job_id("123").await.unwrap(), Some(JobId::new("4242")));
    assert_eq!(slurm.job_id("999").await.unwrap(), None);
    assert!(matches!(
        slurm.require_job_id("999").await,
        Err(SchedulerError::UnresolvedDependency(name)) if name == "999"
    ));

    slurm.cancel("123").await;

    let log = calls(dir.path());
    assert!(log[0].starts_with("sbatch --wait-all-nodes=1 --kill-on-invalid-dep=yes --requeue --time=31-0"));
    assert!(log[0].contains("--dependency=afterok:11 --job-name=123 bash -c runPipeline.sh -o 123"));
    assert!(log[1].contains("--name=123"));
    assert_eq!(log.last().map(String::as_str), Some("scancel --jobname 123"));
}

#[tokio::test]
async fn active_job_ignores_finished_jobs() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "squeue", "printf '4242|123\n'");
    let slurm = gateway(dir.path());

    assert_eq!(slurm.active_job_id("123").await.unwrap(), Some(JobId::new("4242")));
    assert_eq!(slurm.active_job_id("4242").await.unwrap(), None);
    assert_eq!(
        calls(dir.path()),
        vec![
            "squeue --noheader --format=%i|%j --name=123",
            "squeue --noheader --format=%i|%j --name=4242",
        ]
    );
}

#[tokio::test]
async fn failing_cancel_is_only_logged() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "scancel", "echo 'scancel: error: Invalid job id' >&2; exit 1");
    let slurm = gateway(dir.path());

    slurm.cancel("123").await;
    slurm.cancel("123").await;
    assert_eq!(calls(dir.path()).len(), 2);
}

#[tokio::test]
async fn failing_sacct_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "sacct", "echo 'sacct: error: slurmdbd down' >&2; exit 1");
    let slurm = gateway(dir.path());

    let err = slurm.job_id("123").await.unwrap_err();
    assert!(
        matches!(err, SchedulerError::CommandFailed { ref stderr, .. } if stderr.contains("slurmdbd"))
    );
}
