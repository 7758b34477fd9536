use std::any::Any;
use std::future::Future;

use crate::alarm::{self, AlarmType};

const MAX_PANIC_MESSAGE_LEN: usize = 2048;

/// Spawns `future` as a top-level task whose panic is logged instead of propagated.
///
/// The returned handle resolves once the task finished; a panic inside the task is reported
/// with the task name and a truncated panic message and then swallowed, so one broken loop never
/// takes the process down.
pub fn spawn_guarded<F>(name: impl Into<String>, future: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let inner = tokio::spawn(future);
    tokio::spawn(async move {
        match inner.await {
            Ok(()) => log::debug!("task `{name}` finished"),
            Err(err) if err.is_panic() => {
                let message = panic_message(err.into_panic());
                alarm::raise(
                    AlarmType::Panic,
                    format_args!("task `{name}` panicked: {message}"),
                );
            }
            Err(err) => log::debug!("task `{name}` cancelled: {err}"),
        }
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let mut message = if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    };
    if message.len() > MAX_PANIC_MESSAGE_LEN {
        let mut end = MAX_PANIC_MESSAGE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}
