//! Process-stdout hijack.
//!
//! The frame stream and user code share one process, so any stray
//! `println!` (or a chatty third-party library) would corrupt the protocol.
//! Before the server loop starts, the original stdout descriptor is
//! preserved for frames and fd 1 is rebound to an internal pipe whose read
//! end drains to stderr. Stray writes therefore end up on stderr, where the
//! parent tees them.
//!
//! The rebind is process-global and guarded against running twice.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

static HIJACKED: AtomicBool = AtomicBool::new(false);

/// Keeps the stderr drain alive; [`StdoutGuard::shutdown`] stops it.
pub(crate) struct StdoutGuard {
    drain: Option<JoinHandle<()>>,
}

impl StdoutGuard {
    /// Detach fd 1 from the internal pipe and wait for the drain to flush.
    ///
    /// Afterwards anything the process writes to stdout goes to /dev/null;
    /// the preserved frame stream is unaffected.
    pub(crate) async fn shutdown(mut self) {
        #[cfg(unix)]
        redirect_stdout_to_null();
        if let Some(drain) = self.drain.take() {
            let _ = drain.await;
        }
    }
}

/// Rebind fd 1 and hand back the preserved stdout for the frame stream.
#[cfg(unix)]
pub(crate) fn hijack_stdout() -> Result<(Box<dyn AsyncWrite + Send + Unpin>, StdoutGuard)> {
    use std::fs::File;
    use std::os::unix::io::FromRawFd;

    if HIJACKED.swap(true, Ordering::SeqCst) {
        return Err(Error::Options("stdout already hijacked".into()));
    }

    // Preserve the real stdout for frames.
    let frames_fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if frames_fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    // Replace fd 1 with the write end of an internal pipe.
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    if unsafe { libc::dup2(write_fd, libc::STDOUT_FILENO) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    unsafe { libc::close(write_fd) };

    let frames = tokio::fs::File::from_std(unsafe { File::from_raw_fd(frames_fd) });
    let pipe_read = tokio::fs::File::from_std(unsafe { File::from_raw_fd(read_fd) });

    let drain = tokio::spawn(async move {
        let mut pipe_read = pipe_read;
        let mut err_out = tokio::io::stderr();
        let _ = tokio::io::copy(&mut pipe_read, &mut err_out).await;
    });

    Ok((
        Box::new(frames),
        StdoutGuard {
            drain: Some(drain),
        },
    ))
}

/// Without fd-level plumbing the frame stream is plain stdout and stray
/// prints are the application's problem.
#[cfg(not(unix))]
pub(crate) fn hijack_stdout() -> Result<(Box<dyn AsyncWrite + Send + Unpin>, StdoutGuard)> {
    if HIJACKED.swap(true, Ordering::SeqCst) {
        return Err(Error::Options("stdout already hijacked".into()));
    }
    Ok((Box::new(tokio::io::stdout()), StdoutGuard { drain: None }))
}

/// Point fd 1 at /dev/null, closing the internal pipe's write end so the
/// drain sees EOF. Keeps later stdout writes harmless.
#[cfg(unix)]
fn redirect_stdout_to_null() {
    use std::os::unix::io::IntoRawFd;

    if let Ok(null) = std::fs::OpenOptions::new().write(true).open("/dev/null") {
        let null_fd = null.into_raw_fd();
        unsafe {
            libc::dup2(null_fd, libc::STDOUT_FILENO);
            libc::close(null_fd);
        }
    }
}
