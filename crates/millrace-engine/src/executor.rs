//! Script execution: one task, one subprocess.
//!
//! The executor is a local transducer: it materialises the task's input
//! artifact to a temp file, runs the step's script under `sh -c` with
//! `INPUT_FILE` and `OUTPUT_DIR` set, streams the script's output into
//! the log, and drains the sink. It knows nothing about downstream steps;
//! a non-zero exit becomes the task's error string, not a pipeline
//! failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use millrace_state::{MetaStore, ObjectStore, StateError};
use millrace_types::{FileEmission, Step, Task};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use crate::errors::PipelineError;
use crate::sink::{OutputSink, SinkMode};

/// Result of one script run. `error` is recorded on the task row.
#[derive(Debug)]
pub struct ExecOutcome {
    pub error: Option<String>,
    pub duration: Duration,
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(16)]
}

/// Run one task's script to completion, feeding its output files into
/// `tx`.
///
/// # Errors
///
/// Storage and mount failures abort; script failures land in the returned
/// outcome instead.
pub async fn execute_task(
    meta: &Arc<dyn MetaStore>,
    objects: &Arc<ObjectStore>,
    task: &Task,
    step: &Step,
    sink_mode: SinkMode,
    tmp_root: &Path,
    tx: mpsc::Sender<FileEmission>,
) -> Result<ExecOutcome, PipelineError> {
    let started = Instant::now();

    let input_path = materialise_input(meta, objects, task, tmp_root).await?;
    let sink = {
        let tmp_root = tmp_root.to_path_buf();
        tokio::task::spawn_blocking(move || OutputSink::create(sink_mode, &tmp_root, tx)).await??
    };

    tracing::debug!(step = %step.name, task = task.id, "executing script");
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(&step.script)
        .env("INPUT_FILE", &*input_path)
        .env("OUTPUT_DIR", sink.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Reap the child if this worker is cancelled by a fatal error
        // elsewhere in the batch.
        .kill_on_drop(true);

    let error = match cmd.spawn() {
        Ok(mut child) => {
            let stdout_task = child
                .stdout
                .take()
                .map(|out| stream_lines(out, step.name.clone(), false));
            let stderr_task = child
                .stderr
                .take()
                .map(|err| stream_lines(err, step.name.clone(), true));

            let status = child.wait().await;
            for log_task in [stdout_task, stderr_task].into_iter().flatten() {
                let _ = log_task.await;
            }

            match status {
                Ok(status) if status.success() => None,
                Ok(status) => Some(format!("script failed: {status}")),
                Err(e) => Some(format!("waiting for script: {e}")),
            }
        }
        Err(e) => Some(format!("failed to spawn shell: {e}")),
    };

    // All emissions must be downstream before the task counts as done.
    tokio::task::spawn_blocking(move || sink.finish()).await??;
    drop(input_path);

    Ok(ExecOutcome {
        error,
        duration: started.elapsed(),
    })
}

/// Copy the task's input blob into a unique temp file; empty for seed
/// tasks.
async fn materialise_input(
    meta: &Arc<dyn MetaStore>,
    objects: &Arc<ObjectStore>,
    task: &Task,
    tmp_root: &Path,
) -> Result<tempfile::TempPath, PipelineError> {
    let meta = meta.clone();
    let objects = objects.clone();
    let task = task.clone();
    let tmp_root: PathBuf = tmp_root.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<tempfile::TempPath, PipelineError> {
        let mut file = tempfile::Builder::new()
            .prefix("input-")
            .tempfile_in(&tmp_root)
            .map_err(StateError::Io)?;

        if let Some(resource_id) = task.input_resource_id {
            let resource = meta.resource_by_id(resource_id)?.ok_or_else(|| {
                PipelineError::Infrastructure(anyhow::anyhow!(
                    "task {} references missing resource {resource_id}",
                    task.id
                ))
            })?;
            let bytes = objects.copy_to(&resource.object_hash, file.as_file_mut())?;
            tracing::debug!(
                task = task.id,
                bytes,
                hash = short_hash(&resource.object_hash),
                "input materialised"
            );
        } else {
            tracing::debug!(task = task.id, "input empty (seed task)");
        }

        Ok(file.into_temp_path())
    })
    .await?
}

/// Forward a child stream into the log line by line, tagged with the step
/// name. stderr is informational only; it never fails the task.
fn stream_lines(
    stream: impl AsyncRead + Unpin + Send + 'static,
    step_name: String,
    is_stderr: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                tracing::warn!(step = %step_name, "{line}");
            } else {
                tracing::info!(step = %step_name, "{line}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_state::{sha256_hex, SqliteMetaStore};
    use millrace_types::StepDef;

    struct Fixture {
        _dir: tempfile::TempDir,
        meta: Arc<dyn MetaStore>,
        objects: Arc<ObjectStore>,
        tmp_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(ObjectStore::open(dir.path()).unwrap());
        let meta: Arc<dyn MetaStore> = Arc::new(SqliteMetaStore::in_memory().unwrap());
        let tmp_root = dir.path().join("tmp");
        Fixture {
            _dir: dir,
            meta,
            objects,
            tmp_root,
        }
    }

    fn step(f: &Fixture, name: &str, script: &str, inputs: &[&str]) -> Step {
        let id = f
            .meta
            .upsert_step(&StepDef {
                name: name.into(),
                script: script.into(),
                is_start: inputs.is_empty(),
                parallel: None,
                inputs: inputs.iter().map(|s| (*s).to_string()).collect(),
            })
            .unwrap();
        f.meta.step_by_id(id).unwrap().unwrap()
    }

    fn seed_task(f: &Fixture, step: &Step) -> Task {
        f.meta.create_seed_task(step.id).unwrap().unwrap();
        f.meta.unprocessed_tasks(step.id).unwrap().remove(0)
    }

    #[tokio::test]
    async fn script_output_is_emitted() {
        let f = fixture();
        let step = step(&f, "a", "printf hello > \"$OUTPUT_DIR/b_1.txt\"", &[]);
        let task = seed_task(&f, &step);

        let (tx, mut rx) = mpsc::channel(4);
        let outcome = execute_task(
            &f.meta,
            &f.objects,
            &task,
            &step,
            SinkMode::Spool,
            &f.tmp_root,
            tx,
        )
        .await
        .unwrap();

        assert!(outcome.error.is_none());
        let emission = rx.recv().await.unwrap();
        assert_eq!(emission.name, "b_1.txt");
        assert_eq!(emission.payload, b"hello");
    }

    #[tokio::test]
    async fn input_file_carries_resource_bytes() {
        let f = fixture();
        let payload = b"upstream bytes";
        let hash = sha256_hex(payload);
        f.objects.put(&hash, payload).unwrap();
        let resource_id = f.meta.create_resource("b", &hash).unwrap();

        let step = step(&f, "b", "cat \"$INPUT_FILE\" > \"$OUTPUT_DIR/copy_1.txt\"", &["b"]);
        assert_eq!(f.meta.schedule_tasks_for_step(step.id).unwrap(), 1);
        let task = f.meta.unprocessed_tasks(step.id).unwrap().remove(0);
        assert_eq!(task.input_resource_id, Some(resource_id));

        let (tx, mut rx) = mpsc::channel(4);
        let outcome = execute_task(
            &f.meta,
            &f.objects,
            &task,
            &step,
            SinkMode::Spool,
            &f.tmp_root,
            tx,
        )
        .await
        .unwrap();

        assert!(outcome.error.is_none());
        assert_eq!(rx.recv().await.unwrap().payload, payload);
    }

    #[tokio::test]
    async fn nonzero_exit_recorded_not_fatal() {
        let f = fixture();
        let step = step(&f, "a", "echo doomed >&2; exit 3", &[]);
        let task = seed_task(&f, &step);

        let (tx, mut rx) = mpsc::channel(4);
        let outcome = execute_task(
            &f.meta,
            &f.objects,
            &task,
            &step,
            SinkMode::Spool,
            &f.tmp_root,
            tx,
        )
        .await
        .unwrap();

        let error = outcome.error.unwrap();
        assert!(error.contains("script failed"), "got: {error}");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn partial_output_survives_script_failure() {
        let f = fixture();
        let step = step(&f, "a", "printf partial > \"$OUTPUT_DIR/b_1.txt\"; exit 1", &[]);
        let task = seed_task(&f, &step);

        let (tx, mut rx) = mpsc::channel(4);
        let outcome = execute_task(
            &f.meta,
            &f.objects,
            &task,
            &step,
            SinkMode::Spool,
            &f.tmp_root,
            tx,
        )
        .await
        .unwrap();

        assert!(outcome.error.is_some());
        assert_eq!(rx.recv().await.unwrap().payload, b"partial");
    }
}
