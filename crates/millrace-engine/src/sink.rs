//! Per-task output sinks.
//!
//! Every task execution gets a fresh directory to write into and a way to
//! drain what it wrote into the emission channel. Two sinks implement
//! that: the kernel-mounted write-only filesystem, and a plain spool
//! directory scanned after the child exits. `auto` prefers the mount and
//! falls back when the host can't provide one.

use std::path::Path;

use millrace_types::FileEmission;
use tokio::sync::mpsc;

use crate::errors::PipelineError;

/// Which sink implementation to hand child processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkMode {
    /// Try the FUSE mount, fall back to a spool directory.
    #[default]
    Auto,
    /// Kernel mount only; mount failure is fatal.
    Fuse,
    /// Plain directory drained after process exit.
    Spool,
}

impl std::str::FromStr for SinkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "fuse" => Ok(Self::Fuse),
            "spool" => Ok(Self::Spool),
            other => Err(format!("unknown sink mode '{other}' (auto|fuse|spool)")),
        }
    }
}

/// A live output sink for one task.
pub enum OutputSink {
    #[cfg(feature = "fuse")]
    Fuse(crate::mount::FuseMount),
    Spool(SpoolDir),
}

impl OutputSink {
    /// Create the sink for one task execution under `tmp_root`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Mount`] when an explicitly requested mount cannot
    /// be set up, or the spool directory cannot be created.
    pub fn create(
        mode: SinkMode,
        tmp_root: &Path,
        tx: mpsc::Sender<FileEmission>,
    ) -> Result<Self, PipelineError> {
        match mode {
            #[cfg(feature = "fuse")]
            SinkMode::Fuse => Ok(Self::Fuse(
                crate::mount::FuseMount::mount(tmp_root, tx).map_err(PipelineError::Mount)?,
            )),
            #[cfg(not(feature = "fuse"))]
            SinkMode::Fuse => Err(PipelineError::Mount(anyhow::anyhow!(
                "built without fuse support"
            ))),
            #[cfg(feature = "fuse")]
            SinkMode::Auto => match crate::mount::FuseMount::mount(tmp_root, tx.clone()) {
                Ok(mount) => Ok(Self::Fuse(mount)),
                Err(e) => {
                    tracing::warn!("mount unavailable ({e:#}); falling back to spool directory");
                    Ok(Self::Spool(SpoolDir::create(tmp_root, tx)?))
                }
            },
            #[cfg(not(feature = "fuse"))]
            SinkMode::Auto => Ok(Self::Spool(SpoolDir::create(tmp_root, tx)?)),
            SinkMode::Spool => Ok(Self::Spool(SpoolDir::create(tmp_root, tx)?)),
        }
    }

    /// The directory handed to the child as `OUTPUT_DIR`.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            #[cfg(feature = "fuse")]
            Self::Fuse(mount) => mount.path(),
            Self::Spool(spool) => spool.path(),
        }
    }

    /// Drain everything the task wrote into the emission channel and tear
    /// the sink down. Blocks; run it on a blocking thread.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Mount`] if spool files cannot be read back.
    pub fn finish(self) -> Result<(), PipelineError> {
        match self {
            #[cfg(feature = "fuse")]
            Self::Fuse(mount) => {
                mount.wait_for_writes();
                mount.stop();
                Ok(())
            }
            Self::Spool(spool) => spool.drain(),
        }
    }
}

/// Fallback sink: an ordinary private directory, read back after the
/// child exits. Emission order is name-sorted rather than close-ordered;
/// backpressure still applies because the drain pushes through the same
/// bounded channel.
pub struct SpoolDir {
    dir: tempfile::TempDir,
    tx: mpsc::Sender<FileEmission>,
}

impl SpoolDir {
    fn create(tmp_root: &Path, tx: mpsc::Sender<FileEmission>) -> Result<Self, PipelineError> {
        let dir = tempfile::Builder::new()
            .prefix("output-")
            .tempdir_in(tmp_root)
            .map_err(|e| PipelineError::Mount(anyhow::anyhow!("creating spool directory: {e}")))?;
        Ok(Self { dir, tx })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn drain(self) -> Result<(), PipelineError> {
        let read_err =
            |e: std::io::Error| PipelineError::Mount(anyhow::anyhow!("reading spool output: {e}"));

        let mut entries: Vec<_> = std::fs::read_dir(self.dir.path())
            .map_err(read_err)?
            .collect::<Result<_, _>>()
            .map_err(read_err)?;
        entries.sort_by_key(std::fs::DirEntry::file_name);

        for entry in entries {
            let meta = entry.metadata().map_err(read_err)?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!("skipping non-utf8 output filename");
                continue;
            };
            let payload = std::fs::read(entry.path()).map_err(read_err)?;
            if payload.is_empty() {
                continue;
            }
            if self.tx.blocking_send(FileEmission { name, payload }).is_err() {
                tracing::warn!("emission channel closed; remaining spool output dropped");
                break;
            }
        }
        // TempDir drop removes the directory.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_mode_parses() {
        assert_eq!("auto".parse::<SinkMode>().unwrap(), SinkMode::Auto);
        assert_eq!("fuse".parse::<SinkMode>().unwrap(), SinkMode::Fuse);
        assert_eq!("spool".parse::<SinkMode>().unwrap(), SinkMode::Spool);
        assert!("watcher".parse::<SinkMode>().is_err());
    }

    #[test]
    fn spool_drains_files_in_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let sink = OutputSink::create(SinkMode::Spool, tmp.path(), tx).unwrap();

        std::fs::write(sink.path().join("b_2.txt"), b"two").unwrap();
        std::fs::write(sink.path().join("b_1.txt"), b"one").unwrap();
        std::fs::write(sink.path().join("empty.txt"), b"").unwrap();
        sink.finish().unwrap();

        let first = rx.blocking_recv().unwrap();
        let second = rx.blocking_recv().unwrap();
        assert_eq!(first.name, "b_1.txt");
        assert_eq!(first.payload, b"one");
        assert_eq!(second.name, "b_2.txt");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn spool_dir_removed_after_finish() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let sink = OutputSink::create(SinkMode::Spool, tmp.path(), tx).unwrap();
        let path = sink.path().to_path_buf();
        assert!(path.is_dir());
        sink.finish().unwrap();
        assert!(!path.exists());
    }
}
