/// The outcome of a command: success, or an exit code plus a user-readable
/// message.
pub enum ExitResult<T> {
    Ok(T),
    Err(i32, String),
}

impl<T> ExitResult<T> {
    /// Exit code 2: bad user input (unknown flag value, missing trace,
    /// unknown process).
    pub fn usage_error(message: impl Into<String>) -> ExitResult<T> {
        ExitResult::Err(2, message.into())
    }

    pub fn fatal(message: impl Into<String>) -> ExitResult<T> {
        ExitResult::Err(1, message.into())
    }
}
