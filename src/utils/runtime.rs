use std::process;

use nix::errno::Errno;
use nix::sys::resource::{getrlimit, rlim_t, setrlimit, Resource};
use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Soft `nofile` limit requested at boot; one descriptor per client plus storage and pipes.
pub const OPEN_FILES_TARGET: rlim_t = 4096;

/// Process signals and subprocess control assume a POSIX host.
pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: relayhub needs POSIX signals and process control");
        process::exit(2);
    }
}

/// Soft limit to request: `target` capped at the hard limit, never below `soft`.
pub fn open_files_soft_limit(soft: rlim_t, hard: rlim_t, target: rlim_t) -> rlim_t {
    target.min(hard).max(soft)
}

/// Raises the soft open-file limit towards `target` and returns the resulting `(soft, hard)`.
pub fn raise_open_file_limit(target: rlim_t) -> Result<(rlim_t, rlim_t), Errno> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    let wanted = open_files_soft_limit(soft, hard, target);
    if wanted != soft {
        setrlimit(Resource::RLIMIT_NOFILE, wanted, hard)?;
    }
    getrlimit(Resource::RLIMIT_NOFILE)
}

/// Boot step: a failure is logged and the process keeps running.
pub fn adjust_open_file_limit(logger: &Logger) {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) => logger.log(
            LogLevel::Debug,
            Some("runtime::limits"),
            "current open-file limits",
            Some(json!({"soft": soft, "hard": hard})),
        ),
        Err(error) => logger.warn(
            Some("runtime::limits"),
            &format!("unable to read open-file limits: {error}"),
        ),
    }

    match raise_open_file_limit(OPEN_FILES_TARGET) {
        Ok((soft, hard)) => logger.log(
            LogLevel::Debug,
            Some("runtime::limits"),
            "adjusted open-file limits",
            Some(json!({"soft": soft, "hard": hard})),
        ),
        Err(error) => logger.error(
            Some("runtime::limits"),
            &format!("unable to raise open-file limit, resource issues could arise: {error}"),
        ),
    }
}
