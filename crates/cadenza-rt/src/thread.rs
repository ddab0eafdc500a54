//! Thread setup helpers for the real-time domain.

use std::io;
use std::thread::{self, JoinHandle};

#[derive(Debug, thiserror::Error)]
pub enum RtError {
    #[error("real-time scheduling is not supported on this platform")]
    Unsupported,
    #[error("failed to acquire real-time priority: {0}")]
    Os(#[from] io::Error),
}

/// Enables flush-to-zero and denormals-are-zero on supported CPUs.
#[inline]
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn enable_ftz_daz() {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::{_mm_getcsr, _mm_setcsr};
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::{_mm_getcsr, _mm_setcsr};

    const FTZ: u32 = 1 << 15;
    const DAZ: u32 = 1 << 6;
    // Safety: only touches the MXCSR register of the calling thread.
    #[allow(deprecated)]
    unsafe {
        let csr = _mm_getcsr();
        _mm_setcsr(csr | FTZ | DAZ);
    }
}

#[inline]
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub fn enable_ftz_daz() {}

/// Requests `SCHED_FIFO` at `priority` for the calling thread.
#[cfg(target_os = "linux")]
pub fn request_realtime_priority(priority: i32) -> Result<(), RtError> {
    // Safety: plain syscall on the current thread with a valid parameter block.
    let result = unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if result != 0 {
        return Err(RtError::Os(io::Error::from_raw_os_error(result)));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn request_realtime_priority(_priority: i32) -> Result<(), RtError> {
    Err(RtError::Unsupported)
}

/// Pins the process address space into RAM. Missing permissions are treated
/// as success because running unlocked is still acceptable.
#[cfg(target_os = "linux")]
pub fn lock_memory() -> io::Result<()> {
    // Safety: mlockall has no memory-safety preconditions.
    unsafe {
        if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                return Ok(());
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn lock_memory() -> io::Result<()> {
    Ok(())
}

/// Spawns a named thread that tries to run with real-time priority.
///
/// Failing to obtain the priority is not fatal: the thread keeps running under
/// normal scheduling and a warning is logged.
pub fn spawn_rt_thread<F, T>(
    name: String,
    priority: Option<i32>,
    body: F,
) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name).spawn(move || {
        if let Some(priority) = priority {
            if let Err(err) = request_realtime_priority(priority) {
                let name = thread::current().name().unwrap_or("rt").to_owned();
                tracing::warn!(thread = %name, "falling back to normal scheduling: {err}");
            }
        }
        enable_ftz_daz();
        body()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rt_thread_runs_without_privileges() {
        let handle = spawn_rt_thread("rt-test".into(), Some(10), || 7).unwrap();
        assert_eq!(handle.join().unwrap(), 7);
    }
}
