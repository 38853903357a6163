//! Command line handling for the tracer binary
//!
//! The only argument is the spawner's pid:
//!
//! ```text
//! rootcloak <pid>
//! ```

use std::ffi::OsString;

use nix::unistd::Pid;

use crate::error::TracerError;

const DEFAULT_PROGRAM: &str = "rootcloak";

/// Parse `argv` into the spawner pid.
///
/// Anything other than exactly one strictly positive decimal pid is an error.
/// Takes raw `OsString`s so a non-UTF-8 argument is rejected, not a panic.
pub fn parse_spawner_pid<I, S>(args: I) -> Result<Pid, TracerError>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let mut args = args.into_iter().map(Into::into);
    let program = args
        .next()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_PROGRAM.to_string());

    let arg = match (args.next(), args.next()) {
        (Some(arg), None) => arg,
        _ => return Err(TracerError::Usage(program)),
    };

    match arg.to_str().map(str::parse::<i32>) {
        Some(Ok(pid)) if pid > 0 => Ok(Pid::from_raw(pid)),
        _ => Err(TracerError::InvalidPid(arg.to_string_lossy().into_owned())),
    }
}
