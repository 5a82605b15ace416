//! Record stream reader
//!
//! Lines come either from a file or from the stdout of a generator process.
//! Both are read through one large buffered reader and exposed as a stream
//! of trimmed lines. Lines are not validated here.

use futures::stream::{self, Stream};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{IngestError, IngestResult};

/// Read buffer for the input source
pub const READ_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Generator run when `INGEST_COMMAND` is not set
pub const DEFAULT_GENERATOR: &str = "haveibeenpwned-downloader";
pub const DEFAULT_GENERATOR_ARGS: &[&str] = &["--format", "sha1ordered", "--output", "-"];

/// Where input lines come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineSource {
    File(PathBuf),
    Command { program: String, args: Vec<String> },
}

impl LineSource {
    pub fn default_generator() -> Self {
        LineSource::Command {
            program: DEFAULT_GENERATOR.to_string(),
            args: DEFAULT_GENERATOR_ARGS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// `INGEST_FILE` takes precedence over `INGEST_COMMAND` (whitespace separated)
    pub fn from_env() -> Option<Self> {
        if let Some(path) = std::env::var("INGEST_FILE").ok().filter(|s| !s.is_empty()) {
            return Some(LineSource::File(PathBuf::from(path)));
        }
        let command = std::env::var("INGEST_COMMAND").ok()?;
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(LineSource::Command {
            program,
            args: parts.collect(),
        })
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            LineSource::File(path) => path.display().to_string(),
            LineSource::Command { program, args } if args.is_empty() => program.clone(),
            LineSource::Command { program, args } => format!("{} {}", program, args.join(" ")),
        }
    }

    pub async fn open(&self) -> IngestResult<LineStream> {
        match self {
            LineSource::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|source| IngestError::OpenInput {
                        path: path.clone(),
                        source,
                    })?;
                info!(path = %path.display(), "Reading hashes from file");
                Ok(LineStream::new(file, None))
            }
            LineSource::Command { program, args } => {
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|source| IngestError::SpawnGenerator {
                        program: program.clone(),
                        source,
                    })?;

                let stdout = child.stdout.take().ok_or_else(|| IngestError::SpawnGenerator {
                    program: program.clone(),
                    source: std::io::Error::other("stdout was not captured"),
                })?;
                info!(program = %program, pid = child.id(), "Streaming hashes from generator");
                Ok(LineStream::new(
                    stdout,
                    Some(Generator {
                        program: program.clone(),
                        child,
                    }),
                ))
            }
        }
    }
}

struct Generator {
    program: String,
    child: Child,
}

type Lines = Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>;

/// Stream of trimmed input lines
pub struct LineStream {
    lines: Lines,
    generator: Option<Generator>,
}

impl LineStream {
    fn new<R>(reader: R, generator: Option<Generator>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let reader = BufReader::with_capacity(READ_BUFFER_SIZE, reader);
        let lines = stream::try_unfold(
            (reader, Vec::with_capacity(128)),
            |(mut reader, mut buf)| async move {
                buf.clear();
                let read = reader.read_until(b'\n', &mut buf).await?;
                if read == 0 {
                    return Ok(None);
                }
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                Ok(Some((line, (reader, buf))))
            },
        );

        Self {
            lines: Box::pin(lines),
            generator,
        }
    }

    /// Wait for the generator, if any, and fail on a non-zero exit status.
    ///
    /// Call after the stream is exhausted; a generator that crashed mid-run
    /// may still have produced a clean EOF.
    pub async fn finish(self) -> IngestResult<()> {
        let Some(Generator { program, mut child }) = self.generator else {
            return Ok(());
        };
        drop(self.lines);

        let status = child.wait().await.map_err(IngestError::Read)?;
        if status.success() {
            debug!(program = %program, "Generator exited cleanly");
            Ok(())
        } else {
            warn!(program = %program, %status, "Generator exited with failure");
            Err(IngestError::GeneratorFailed { program, status })
        }
    }
}

impl Stream for LineStream {
    type Item = std::io::Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.lines.as_mut().poll_next(cx)
    }
}
