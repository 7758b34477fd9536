use std::fmt::Display;

/// Turns a per-item failure into a logged skip.
pub trait ResultOkLogExt<T> {
    /// Logs the error at `error` level and discards it.
    fn ok_log(self) -> Option<T>;

    /// Like [`ResultOkLogExt::ok_log`], with `context` in front of the error message.
    fn ok_log_with(self, context: impl Display) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log(self) -> Option<T> {
        self.map_err(|err| log::error!("{err}")).ok()
    }

    fn ok_log_with(self, context: impl Display) -> Option<T> {
        self.map_err(|err| log::error!("{context}: {err}")).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_log_keeps_value() {
        let ok: Result<u8, std::io::Error> = Ok(4);
        assert_eq!(ok.ok_log(), Some(4));
    }

    #[test]
    fn test_ok_log_with_drops_error() {
        let err: Result<u8, std::io::Error> = Err(std::io::Error::other("boom"));
        assert_eq!(err.ok_log_with("pipeline p1"), None);
    }
}
