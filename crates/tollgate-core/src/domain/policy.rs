/// What a component does when its backing infrastructure errors.
///
/// The rate limiter defaults to [`FailureMode::FailOpen`] (availability first),
/// the idempotency coordinator to [`FailureMode::FailClosed`] (no silent loss of
/// deduplication). Both are configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Let the request through without protection.
    FailOpen,
    /// Reject the request.
    FailClosed,
}

impl FailureMode {
    pub fn from_fail_closed(fail_closed: bool) -> Self {
        if fail_closed {
            FailureMode::FailClosed
        } else {
            FailureMode::FailOpen
        }
    }
}
