//! `FileSink` and `FilterSink`.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

use dmacap_core::error::{DmacapError, Result};
use dmacap_core::sink::ByteSink;
use tracing::{debug, info, warn};

/// Positioned writes into a regular file.
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        debug!(path = %path.display(), "file sink opened");
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl ByteSink for FileSink {
    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<usize> {
        Ok(self.file.write_at(bytes, offset)?)
    }

    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn finish(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Stream writes into an external filter process (e.g. `gzip -9`) whose
/// stdout is the output file.
pub struct FilterSink {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl FilterSink {
    /// Spawn `program args...` writing to `output`. The stdin pipe is grown
    /// to `pipe_size` bytes where the platform allows it.
    pub fn spawn(program: &str, args: &[String], output: &Path, pipe_size: usize) -> Result<Self> {
        let out = File::create(output)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(out))
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DmacapError::Filter(format!("{program}: no stdin pipe")))?;

        set_pipe_size(stdin.as_raw_fd(), pipe_size);
        info!(program, ?args, output = %output.display(), pid = child.id(), "filter started");

        Ok(Self {
            program: program.to_string(),
            child,
            stdin: Some(stdin),
        })
    }

    /// Default filter: `gzip -9`.
    pub fn gzip(output: &Path, pipe_size: usize) -> Result<Self> {
        Self::spawn("gzip", &["-9".to_string()], output, pipe_size)
    }

    /// Split a shell-style command line on whitespace into program and args.
    pub fn from_command_line(cmdline: &str, output: &Path, pipe_size: usize) -> Result<Self> {
        let mut words = cmdline.split_whitespace();
        let program = words
            .next()
            .ok_or(DmacapError::InvalidConfig("empty filter command"))?;
        let args: Vec<String> = words.map(str::to_string).collect();
        Self::spawn(program, &args, output, pipe_size)
    }

    fn reap(&mut self) -> Result<()> {
        // Closing stdin is the filter's EOF.
        drop(self.stdin.take());
        let status = self.child.wait()?;
        if !status.success() {
            return Err(DmacapError::Filter(format!("{} exited with {}", self.program, status)));
        }
        debug!(program = %self.program, "filter exited cleanly");
        Ok(())
    }
}

impl ByteSink for FilterSink {
    fn write_at(&self, _offset: u64, bytes: &[u8]) -> Result<usize> {
        let mut stdin = self.stdin.as_ref().ok_or(DmacapError::SessionClosed)?;
        Ok(stdin.write(bytes)?)
    }

    fn is_stream(&self) -> bool {
        true
    }

    fn raw_fd(&self) -> RawFd {
        self.stdin.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn finish(&mut self) -> Result<()> {
        self.reap()
    }
}

impl Drop for FilterSink {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            if let Err(e) = self.reap() {
                warn!(error = %e, "filter did not exit cleanly");
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn set_pipe_size(fd: RawFd, size: usize) {
            use nix::fcntl::{fcntl, FcntlArg};

            let want = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
            match fcntl(fd, FcntlArg::F_SETPIPE_SZ(want)) {
                Ok(got) => debug!(want, got, "pipe size set"),
                // Unprivileged callers are capped by /proc/sys/fs/pipe-max-size.
                Err(e) => warn!(want, error = %e, "F_SETPIPE_SZ failed, keeping default"),
            }
        }
    } else {
        fn set_pipe_size(_fd: RawFd, size: usize) {
            debug!(size, "pipe resizing not supported here");
        }
    }
}
