use crate::policy::Fault;
use tracing::error;

/// Exit status used when re-exec is impossible; the service manager restarts us.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Replace the current process with a fresh copy of itself.
pub fn restart_process(fault: &Fault) -> ! {
    error!(%fault, "restarting process");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        match std::env::current_exe() {
            Ok(exe) => {
                let err = std::process::Command::new(&exe)
                    .args(std::env::args_os().skip(1))
                    .exec();
                error!(exe = %exe.display(), error = %err, "re-exec failed");
            }
            Err(e) => error!(error = %e, "cannot locate own executable"),
        }
    }

    std::process::exit(RESTART_EXIT_CODE)
}
