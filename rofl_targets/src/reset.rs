//! Per-execution reset, run in every fresh child before target code.

use std::{fs::File, os::fd::AsRawFd, path::Path};

use libc::{STDERR_FILENO, STDOUT_FILENO};
use rofl_bolts::{os::dup2, Error};

use crate::{config::RuntimeConfig, coverage::RuntimeContext};

/// Zero the feedback channel and apply the configured stdout/stderr redirects.
///
/// A redirect that fails is logged and the original stream is kept.
pub fn reset_run(ctx: &RuntimeContext, config: &RuntimeConfig) {
    ctx.reset_channel();

    for (path, target_fd) in [
        (config.out_path(), STDOUT_FILENO),
        (config.err_path(), STDERR_FILENO),
    ] {
        if let Some(path) = path {
            if let Err(err) = redirect_stream(path, target_fd) {
                log::error!("Keeping fd {target_fd}: {err}");
            }
        }
    }
}

/// Open `path` read/write (created, truncated) and `dup2` it over `target_fd`.
pub fn redirect_stream(path: &Path, target_fd: i32) -> Result<(), Error> {
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|err| Error::os_error(err, format!("Could not open {}", path.display())))?;
    // The duplicate keeps the file open once `file` is dropped.
    unsafe { dup2(file.as_raw_fd(), target_fd) }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        io::Write,
        os::fd::{AsRawFd, FromRawFd},
        path::PathBuf,
    };

    use rofl_bolts::os::dup;

    use super::{redirect_stream, reset_run};
    use crate::{config::RuntimeConfig, coverage::RuntimeContext};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rofl_targets_{name}_{}", std::process::id()))
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_redirect_truncates() {
        let path = temp_path("redirect");
        fs::write(&path, "stale content from an earlier run").unwrap();

        // A scratch fd stands in for stdout, so the test harness output stays untouched.
        let devnull = fs::File::open("/dev/null").unwrap();
        let scratch = unsafe { dup(devnull.as_raw_fd()) }.unwrap();
        redirect_stream(&path, scratch).unwrap();
        let mut out = unsafe { fs::File::from_raw_fd(scratch) };
        out.write_all(b"fresh").unwrap();
        drop(out);

        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh");
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_redirect_failure_keeps_fd() {
        let devnull = fs::File::open("/dev/null").unwrap();
        let scratch = unsafe { dup(devnull.as_raw_fd()) }.unwrap();
        let missing = PathBuf::from("/nonexistent-rofl-dir/out");
        assert!(redirect_stream(&missing, scratch).is_err());
        // still open
        assert_ne!(unsafe { libc::fcntl(scratch, libc::F_GETFD) }, -1);
        unsafe { libc::close(scratch) };
    }

    #[test]
    fn test_reset_run_zeroes_channel() {
        let ctx = RuntimeContext::new();
        ctx.record_edge(11);
        ctx.record_child_status(1);

        reset_run(&ctx, &RuntimeConfig::new());
        assert_eq!(ctx.magic(), 0);
        assert_eq!(ctx.status(), 0);
        assert!((0..crate::MAP_SIZE).all(|idx| ctx.hits(idx) == 0));
    }
}
