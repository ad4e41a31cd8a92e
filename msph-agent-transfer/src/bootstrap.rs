//! Process hardening applied before any secret is touched.
//!
//! Both steps are best effort: failure logs a warning and the transfer
//! continues.

/// Disable core dumps and ptrace-style memory reads, then pin memory.
#[cfg(unix)]
pub fn secure_bootstrap() {
    set_not_dumpable();
    lock_memory();
}

#[cfg(not(unix))]
pub fn secure_bootstrap() {}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
fn set_not_dumpable() {
    // SAFETY: PR_SET_DUMPABLE takes plain integer arguments.
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_DUMPABLE,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if ret == 0 {
        tracing::debug!("process marked non-dumpable");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!(error = %err, "PR_SET_DUMPABLE failed, continuing");
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_not_dumpable() {}

#[cfg(unix)]
fn lock_memory() {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::debug!("memory locked");
    } else {
        let err = std::io::Error::last_os_error();
        // EPERM/ENOMEM without CAP_IPC_LOCK or with a low RLIMIT_MEMLOCK
        tracing::warn!(error = %err, "mlockall failed, secrets may reach swap");
    }
}
