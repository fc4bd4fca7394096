//! Processor execution on a worker node.
//!
//! Processors come in two forms. Source form is stored at
//! `nodeFiles/<task>.src` and run through the configured interpreter;
//! precompiled form is a cached executable at `nodeFiles/<algorithm>` keyed
//! by the task's algorithm id, which skips the download entirely.
//!
//! The execution contract is file-based: the input is written to `in.txt`
//! in the node files directory, the processor is run with that directory as
//! its working directory, and the output is read back from `out.txt`.
//! Stderr is captured to `error.txt`; on a non-zero exit its contents are
//! appended to the output so the submitter sees what went wrong. A processor
//! that produces no `out.txt` yields the literal bytes
//! `out.txt file not found`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use uuid::Uuid;

/// Sent when a processor exits without writing `out.txt`.
const MISSING_OUTPUT: &[u8] = b"out.txt file not found";

/// A locally available form of a task's processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processor {
    /// Run `<interpreter> <path>`.
    Source(PathBuf),
    /// Run the executable directly.
    CachedBinary(PathBuf),
}

/// Runs processors under the node files directory.
#[derive(Debug, Clone)]
pub struct Executor {
    files_dir: PathBuf,
    interpreter: String,
}

impl Executor {
    pub fn new(files_dir: PathBuf, interpreter: String) -> Self {
        Self {
            files_dir,
            interpreter,
        }
    }

    /// Where a task's source-form processor lives.
    pub fn source_path(&self, task: Uuid) -> PathBuf {
        self.files_dir.join(format!("{task}.src"))
    }

    /// Where a precompiled processor for an algorithm id lives.
    pub fn binary_path(&self, algorithm: Uuid) -> PathBuf {
        self.files_dir.join(algorithm.to_string())
    }

    /// Probe the local cache for a usable processor form.
    ///
    /// A cached binary wins over cached source: it exists precisely because
    /// someone precompiled the same algorithm for this machine.
    pub fn cached(&self, task: Uuid, algorithm: Option<Uuid>) -> Option<Processor> {
        if let Some(algorithm) = algorithm {
            let binary = self.binary_path(algorithm);
            if binary.is_file() {
                return Some(Processor::CachedBinary(binary));
            }
        }
        let source = self.source_path(task);
        source.is_file().then_some(Processor::Source(source))
    }

    /// Store downloaded processor source, returning its runnable form.
    pub async fn store_source(&self, task: Uuid, source: &[u8]) -> Result<Processor> {
        tokio::fs::create_dir_all(&self.files_dir)
            .await
            .with_context(|| format!("create {}", self.files_dir.display()))?;
        let path = self.source_path(task);
        tokio::fs::write(&path, source)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(Processor::Source(path))
    }

    /// Run `processor` on one input and collect its output.
    pub async fn execute(&self, processor: &Processor, input: &[u8]) -> Result<Vec<u8>> {
        tokio::fs::create_dir_all(&self.files_dir)
            .await
            .with_context(|| format!("create {}", self.files_dir.display()))?;

        let in_path = self.files_dir.join("in.txt");
        let out_path = self.files_dir.join("out.txt");
        let error_path = self.files_dir.join("error.txt");

        tokio::fs::write(&in_path, input)
            .await
            .with_context(|| format!("write {}", in_path.display()))?;
        // A stale out.txt from the previous run must not masquerade as this
        // run's output.
        let _ = tokio::fs::remove_file(&out_path).await;

        let mut command = match processor {
            Processor::Source(path) => {
                let mut command = tokio::process::Command::new(&self.interpreter);
                command.arg(file_name(path));
                command
            }
            Processor::CachedBinary(path) => {
                tokio::process::Command::new(Path::new(".").join(file_name(path)))
            }
        };
        let result = command
            .current_dir(&self.files_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("spawn processor {processor:?}"))?;

        tokio::fs::write(&error_path, &result.stderr)
            .await
            .with_context(|| format!("write {}", error_path.display()))?;

        let mut output = match tokio::fs::read(&out_path).await {
            Ok(bytes) => bytes,
            Err(_) => MISSING_OUTPUT.to_vec(),
        };
        if !result.status.success() {
            output.extend_from_slice(&result.stderr);
        }
        Ok(output)
    }
}

/// Final path component, for invocation relative to the working directory.
fn file_name(path: &Path) -> &std::ffi::OsStr {
    path.file_name().expect("processor paths always have a file name")
}
