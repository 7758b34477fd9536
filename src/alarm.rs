//! Alarm reporting.
//!
//! Alarms are warnings that an operator is expected to act on. They are emitted through the
//! regular `log` facade with the alarm type as the record target, so a log subscriber can route
//! them to an external alarm sink while they still show up in the normal log output.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Category of an alarm, used as the `log` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmType {
    DockerCenter,
    DockerFileMapping,
    ParseDockerLine,
    StatFile,
    ReadFile,
    InvalidRegex,
    ConnectCriRuntime,
    StaticContainer,
    Checkpoint,
    Panic,
}

const ALARM_TYPES: usize = AlarmType::Panic as usize + 1;

static RAISED: [AtomicU64; ALARM_TYPES] = [const { AtomicU64::new(0) }; ALARM_TYPES];

impl AlarmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmType::DockerCenter => "DOCKER_CENTER_ALARM",
            AlarmType::DockerFileMapping => "DOCKER_FILE_MAPPING_ALARM",
            AlarmType::ParseDockerLine => "PARSE_DOCKER_LINE_ALARM",
            AlarmType::StatFile => "STAT_FILE_ALARM",
            AlarmType::ReadFile => "READ_FILE_ALARM",
            AlarmType::InvalidRegex => "INVALID_REGEX_ALARM",
            AlarmType::ConnectCriRuntime => "CONNECT_CRI_RUNTIME_ALARM",
            AlarmType::StaticContainer => "STATIC_CONTAINER_ALARM",
            AlarmType::Checkpoint => "CHECKPOINT_ALARM",
            AlarmType::Panic => "PANIC_ALARM",
        }
    }
}

impl fmt::Display for AlarmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emits an alarm record.
///
/// # Examples
///
/// ```
/// # use container_stdout_core::alarm::{self, AlarmType};
/// alarm::raise(AlarmType::StatFile, format_args!("stat file `{}` failed", "/a.log"));
/// ```
pub fn raise(alarm: AlarmType, message: fmt::Arguments<'_>) {
    RAISED[alarm as usize].fetch_add(1, Ordering::Relaxed);
    log::warn!(target: alarm.as_str(), "{message}");
}

/// Number of alarms of type `alarm` raised since start.
pub fn raised_count(alarm: AlarmType) -> u64 {
    RAISED[alarm as usize].load(Ordering::Relaxed)
}

/// Lossily decodes at most `max` bytes of `src`, for log previews.
pub fn preview(src: &[u8], max: usize) -> String {
    let end = src.len().min(max);
    String::from_utf8_lossy(&src[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm_targets() {
        assert_eq!(AlarmType::DockerCenter.as_str(), "DOCKER_CENTER_ALARM");
        assert_eq!(
            AlarmType::ConnectCriRuntime.to_string(),
            "CONNECT_CRI_RUNTIME_ALARM"
        );
    }

    #[test]
    fn test_raise_counts_per_type() {
        let before = raised_count(AlarmType::Panic);
        raise(AlarmType::Panic, format_args!("counted"));
        assert!(raised_count(AlarmType::Panic) > before);
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview(b"abcdef", 3), "abc");
        assert_eq!(preview(b"ab", 3), "ab");
    }
}
