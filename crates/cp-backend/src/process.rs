use std::ffi::OsString;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub(crate) const MAX_STDIN_BYTES: usize = 16 * 1_048_576;
pub(crate) const MAX_STDOUT_BYTES: usize = 16 * 1_048_576;
pub(crate) const MAX_STDERR_BYTES: usize = 262_144;
pub(crate) const DIAGNOSTIC_BYTES: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    Spawn {
        program: String,
        diagnostic: String,
    },
    StdinTooLarge {
        actual: usize,
        max: usize,
    },
    StreamUnavailable {
        stream: &'static str,
    },
    Stream {
        stream: &'static str,
        diagnostic: String,
    },
    StreamOverflow {
        stream: &'static str,
        actual: usize,
        max: usize,
    },
    Wait {
        diagnostic: String,
    },
    TimedOut {
        millis: u64,
    },
    NonZeroExit {
        status: String,
        stderr: String,
    },
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn {
                program,
                diagnostic,
            } => write!(f, "failed to spawn {program}: {diagnostic}"),
            Self::StdinTooLarge { actual, max } => {
                write!(f, "stdin exceeds max bytes: actual={actual} max={max}")
            }
            Self::StreamUnavailable { stream } => write!(f, "{stream} stream unavailable"),
            Self::Stream { stream, diagnostic } => {
                write!(f, "{stream} stream failed: {diagnostic}")
            }
            Self::StreamOverflow {
                stream,
                actual,
                max,
            } => write!(f, "{stream} exceeds max bytes: actual={actual} max={max}"),
            Self::Wait { diagnostic } => write!(f, "process wait failed: {diagnostic}"),
            Self::TimedOut { millis } => write!(f, "process timed out after {millis}ms"),
            Self::NonZeroExit { status, stderr } => {
                write!(f, "process exited with status {status}: {stderr}")
            }
        }
    }
}

impl std::error::Error for ProcessError {}

/// Program plus fixed leading arguments. Per-call arguments are appended after `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// `None` blocks until the child exits.
    pub timeout_millis: Option<u64>,
}

impl ProcessCommand {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout_millis: None,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_timeout_millis(mut self, timeout_millis: Option<u64>) -> Self {
        self.timeout_millis = timeout_millis;
        self
    }
}

#[derive(Debug)]
pub(crate) struct ProcessOutput {
    pub(crate) stdout: Vec<u8>,
}

#[derive(Debug)]
struct CappedStreamCapture {
    bytes: Vec<u8>,
    total_bytes: usize,
}

/// Runs `command` with `extra_args` appended, feeding `stdin` if given, and
/// returns captured stdout once the child exited successfully.
pub(crate) fn run_process(
    command: &ProcessCommand,
    extra_args: &[OsString],
    stdin: Option<Vec<u8>>,
) -> Result<ProcessOutput, ProcessError> {
    if let Some(body) = &stdin {
        validate_stdin_bounds(body.len())?;
    }

    let mut builder = Command::new(&command.program);
    builder
        .args(&command.args)
        .args(extra_args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &command.working_dir {
        builder.current_dir(dir);
    }
    let mut child = builder.spawn().map_err(|error| ProcessError::Spawn {
        program: command.program.display().to_string(),
        diagnostic: error.to_string(),
    })?;

    let stdin_writer = match stdin {
        Some(body) => {
            let Some(mut pipe) = child.stdin.take() else {
                terminate_and_reap_child(&mut child);
                return Err(ProcessError::StreamUnavailable { stream: "stdin" });
            };
            Some(std::thread::spawn(move || {
                match pipe.write_all(&body) {
                    // a child that never reads its input is allowed
                    Err(error) if error.kind() == ErrorKind::BrokenPipe => Ok(()),
                    other => other,
                }
            }))
        }
        None => None,
    };
    let Some(stdout) = child.stdout.take() else {
        terminate_and_reap_child(&mut child);
        return Err(ProcessError::StreamUnavailable { stream: "stdout" });
    };
    let Some(stderr) = child.stderr.take() else {
        terminate_and_reap_child(&mut child);
        return Err(ProcessError::StreamUnavailable { stream: "stderr" });
    };

    let overflow_flag = Arc::new(AtomicBool::new(false));
    let stdout_overflow = Arc::clone(&overflow_flag);
    let stdout_reader = std::thread::spawn(move || {
        read_stream_capped(stdout, MAX_STDOUT_BYTES, stdout_overflow.as_ref(), "stdout")
    });
    let stderr_overflow = Arc::clone(&overflow_flag);
    let stderr_reader = std::thread::spawn(move || {
        read_stream_capped(stderr, MAX_STDERR_BYTES, stderr_overflow.as_ref(), "stderr")
    });

    let wait_result = wait_for_exit(&mut child, overflow_flag.as_ref(), command.timeout_millis);
    let stdout_capture = stdout_reader
        .join()
        .map_err(|_| ProcessError::Stream {
            stream: "stdout",
            diagnostic: "reader thread panicked".to_string(),
        })??;
    let stderr_capture = stderr_reader
        .join()
        .map_err(|_| ProcessError::Stream {
            stream: "stderr",
            diagnostic: "reader thread panicked".to_string(),
        })??;
    let status = wait_result?;
    if let Some(writer) = stdin_writer {
        writer
            .join()
            .map_err(|_| ProcessError::Stream {
                stream: "stdin",
                diagnostic: "writer thread panicked".to_string(),
            })?
            .map_err(|error| ProcessError::Stream {
                stream: "stdin",
                diagnostic: error.to_string(),
            })?;
    }

    validate_stream_bounds(stdout_capture.total_bytes, stderr_capture.total_bytes)?;
    if !status.success() {
        return Err(exit_error(&status, &stderr_capture.bytes));
    }
    Ok(ProcessOutput {
        stdout: stdout_capture.bytes,
    })
}

fn wait_for_exit(
    child: &mut Child,
    overflow_flag: &AtomicBool,
    timeout_millis: Option<u64>,
) -> Result<ExitStatus, ProcessError> {
    let started_at = Instant::now();
    let mut killed_for_overflow = false;
    loop {
        if overflow_flag.load(Ordering::Relaxed) && !killed_for_overflow {
            terminate_and_reap_child(child);
            killed_for_overflow = true;
        }

        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(error) => {
                terminate_and_reap_child(child);
                return Err(ProcessError::Wait {
                    diagnostic: error.to_string(),
                });
            }
        }

        if let Some(millis) = timeout_millis {
            if started_at.elapsed().as_millis() > u128::from(millis) {
                terminate_and_reap_child(child);
                return Err(ProcessError::TimedOut { millis });
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn terminate_and_reap_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn read_stream_capped<R: Read>(
    mut reader: R,
    max_bytes: usize,
    overflow_flag: &AtomicBool,
    stream: &'static str,
) -> Result<CappedStreamCapture, ProcessError> {
    let mut bytes = Vec::with_capacity(max_bytes.min(8192));
    let mut total_bytes = 0usize;
    let mut chunk = [0_u8; 8192];

    loop {
        let read_len = reader.read(&mut chunk).map_err(|error| ProcessError::Stream {
            stream,
            diagnostic: error.to_string(),
        })?;
        if read_len == 0 {
            break;
        }

        total_bytes = total_bytes.saturating_add(read_len);
        if bytes.len() < max_bytes {
            let copy_len = read_len.min(max_bytes - bytes.len());
            bytes.extend_from_slice(&chunk[..copy_len]);
        }
        if total_bytes > max_bytes {
            overflow_flag.store(true, Ordering::Relaxed);
        }
    }

    Ok(CappedStreamCapture { bytes, total_bytes })
}

fn validate_stream_bounds(stdout_len: usize, stderr_len: usize) -> Result<(), ProcessError> {
    if stdout_len > MAX_STDOUT_BYTES {
        return Err(ProcessError::StreamOverflow {
            stream: "stdout",
            actual: stdout_len,
            max: MAX_STDOUT_BYTES,
        });
    }
    if stderr_len > MAX_STDERR_BYTES {
        return Err(ProcessError::StreamOverflow {
            stream: "stderr",
            actual: stderr_len,
            max: MAX_STDERR_BYTES,
        });
    }
    Ok(())
}

fn validate_stdin_bounds(stdin_len: usize) -> Result<(), ProcessError> {
    if stdin_len > MAX_STDIN_BYTES {
        return Err(ProcessError::StdinTooLarge {
            actual: stdin_len,
            max: MAX_STDIN_BYTES,
        });
    }
    Ok(())
}

fn exit_error(status: &ExitStatus, stderr: &[u8]) -> ProcessError {
    let stderr_text = String::from_utf8_lossy(stderr);
    ProcessError::NonZeroExit {
        status: status.to_string(),
        stderr: bounded_diagnostic(stderr_text.trim(), DIAGNOSTIC_BYTES),
    }
}

/// Last non-empty line of `stdout`, which is where runners print their result.
pub(crate) fn last_non_empty_line(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .rev()
        .find(|candidate| !candidate.trim().is_empty())
}

pub(crate) fn bounded_diagnostic(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }

    let mut boundary = max_len.min(input.len());
    while boundary > 0 && !input.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}...", &input[..boundary])
}
