use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tracing::debug;
use wsrun_commons::resolve_lenient;

use super::{
    BufferedOutput, ExecOptions, FileStat, Runtime, RuntimeError, RuntimeKind, SpawnOptions,
    SpillSink, run_buffered,
};
use crate::pipe::{PipeSpawnOptions, spawn_piped};
use crate::process::{BackgroundHandle, ProcessGroupTerminator};

/// Runs everything on the current host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRuntime;

impl LocalRuntime {
    pub fn new() -> Self {
        Self
    }
}

async fn blocking<T, F>(context: &str, work: F) -> Result<T, RuntimeError>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| RuntimeError::io(context, io::Error::other(err)))?
        .map_err(|err| RuntimeError::io(context, err))
}

#[async_trait]
impl Runtime for LocalRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    async fn resolve_path(&self, path: &Path) -> Result<PathBuf, RuntimeError> {
        let path = path.to_path_buf();
        blocking("failed to resolve path", move || Ok(resolve_lenient(&path))).await
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, RuntimeError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(RuntimeError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(err) => {
                return Err(RuntimeError::io(
                    format!("failed to stat {}", path.display()),
                    err,
                ));
            }
        };

        #[cfg(unix)]
        let executable_bits = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode() & 0o111 != 0
        };
        #[cfg(not(unix))]
        let executable_bits = true;

        Ok(FileStat {
            is_directory: metadata.is_dir(),
            is_file: metadata.is_file(),
            is_executable: metadata.is_file() && executable_bits,
            size: metadata.len(),
        })
    }

    async fn exec_buffered(
        &self,
        command: &str,
        options: ExecOptions,
    ) -> Result<BufferedOutput, RuntimeError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        run_buffered(cmd, command, options.timeout).await
    }

    async fn spawn_background(
        &self,
        command: &str,
        options: SpawnOptions,
    ) -> Result<BackgroundHandle, RuntimeError> {
        let spawn = PipeSpawnOptions {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            cwd: Some(options.cwd),
            env: options.env,
            grace: options.grace,
            max_line_bytes: options.max_line_bytes,
            pid_marker: None,
        };
        spawn_piped(spawn, |pid| {
            Box::new(ProcessGroupTerminator {
                process_group_id: pid,
            })
        })
        .map_err(|err| RuntimeError::io("failed to spawn background command", err))
    }

    async fn create_spill_file(&self, path: &Path) -> Result<Box<dyn SpillSink>, RuntimeError> {
        let file = tokio::fs::File::create(path).await.map_err(|err| {
            RuntimeError::io(format!("failed to create {}", path.display()), err)
        })?;
        Ok(Box::new(LocalSpill {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        }))
    }

    async fn create_temp_dir(&self, parent: Option<&Path>) -> Result<PathBuf, RuntimeError> {
        let parent = parent.map(Path::to_path_buf);
        let dir = blocking("failed to create temp directory", move || {
            let dir = match parent {
                Some(parent) => {
                    std::fs::create_dir_all(&parent)?;
                    tempfile::Builder::new()
                        .prefix("script-")
                        .tempdir_in(parent)?
                }
                None => tempfile::Builder::new().prefix("wsrun-").tempdir()?,
            };
            Ok(dir.keep())
        })
        .await?;
        debug!(path = %dir.display(), "Created execution temp directory");
        Ok(dir)
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<(), RuntimeError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RuntimeError::io(
                format!("failed to remove {}", path.display()),
                err,
            )),
        }
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<String>, RuntimeError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(RuntimeError::NotFound {
                    path: dir.to_path_buf(),
                });
            }
            Err(err) => {
                return Err(RuntimeError::io(
                    format!("failed to read {}", dir.display()),
                    err,
                ));
            }
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| RuntimeError::io(format!("failed to read {}", dir.display()), err))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn read_head(&self, path: &Path, max_lines: usize) -> Result<String, RuntimeError> {
        let file = tokio::fs::File::open(path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                RuntimeError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                RuntimeError::io(format!("failed to open {}", path.display()), err)
            }
        })?;
        let mut lines = BufReader::new(file).lines();
        let mut head = String::new();
        for _ in 0..max_lines {
            // Binary files stop the scan instead of failing it.
            match lines.next_line().await {
                Ok(Some(line)) => {
                    head.push_str(&line);
                    head.push('\n');
                }
                Ok(None) | Err(_) => break,
            }
        }
        Ok(head)
    }
}

struct LocalSpill {
    path: PathBuf,
    writer: BufWriter<tokio::fs::File>,
}

#[async_trait]
impl SpillSink for LocalSpill {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await
    }

    async fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stat_reports_missing_paths() {
        let runtime = LocalRuntime::new();
        let err = runtime
            .stat(Path::new("/definitely/not/here"))
            .await
            .expect_err("missing path");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn exec_buffered_collects_streams() -> anyhow::Result<()> {
        let runtime = LocalRuntime::new();
        let output = runtime
            .exec_buffered("echo out; echo err >&2; exit 4", ExecOptions::default())
            .await?;
        assert_eq!(output.exit_code, 4);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        Ok(())
    }

    #[tokio::test]
    async fn exec_buffered_times_out_with_124() -> anyhow::Result<()> {
        let runtime = LocalRuntime::new();
        let output = runtime
            .exec_buffered(
                "sleep 10",
                ExecOptions {
                    cwd: None,
                    timeout: Duration::from_millis(200),
                },
            )
            .await?;
        assert!(output.timed_out);
        assert_eq!(output.exit_code, super::super::TIMEOUT_EXIT_CODE);
        Ok(())
    }

    #[tokio::test]
    async fn temp_dirs_are_created_inside_parent_and_removed() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let runtime = LocalRuntime::new();
        let dir = runtime.create_temp_dir(Some(root.path())).await?;
        assert!(dir.starts_with(root.path()));
        assert!(dir.is_dir());

        runtime.remove_dir_all(&dir).await?;
        assert!(!dir.exists());
        // Removing twice is fine.
        runtime.remove_dir_all(&dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn spill_file_receives_bytes() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let runtime = LocalRuntime::new();
        let path = root.path().join("output.log");
        let mut sink = runtime.create_spill_file(&path).await?;
        sink.write_all(b"a\n").await?;
        sink.write_all(b"b\n").await?;
        sink.finish().await?;
        assert_eq!(std::fs::read_to_string(&path)?, "a\nb\n");
        Ok(())
    }
}
