//! Per-line decoding of the two container log framings.
//!
//! Docker's `json-file` driver writes one JSON object per line:
//!
//! ```text
//! {"log":"hello\n","stream":"stdout","time":"2018-05-16T06:28:41.2195434Z"}
//! ```
//!
//! containerd writes CRI text lines:
//!
//! ```text
//! 2021-07-13T16:32:21.212861448Z stdout F hello
//! ```
use std::borrow::Cow;

use crate::alarm::{self, AlarmType};

const PREVIEW_LEN: usize = 512;

/// Which standard stream a fragment was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
    /// The line could not be decoded.
    Unknown,
}

impl StreamType {
    fn parse(src: &str) -> Option<Self> {
        match src {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }

    /// Value of the `_source_` field; undecodable lines are reported as stdout.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Stdout | StreamType::Unknown => "stdout",
            StreamType::Stderr => "stderr",
        }
    }
}

/// One decoded framing unit.
///
/// `content` ends with `\n` iff the fragment completes a line. Borrowed content still aliases the
/// reader's buffer and must be copied with [`StreamFragment::into_owned`] before it outlives the
/// current parse call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFragment<'a> {
    pub time: Cow<'a, str>,
    pub stream: StreamType,
    pub content: Cow<'a, str>,
    /// CRI `P` tag: the line continues in the next fragment.
    pub partial: bool,
}

impl StreamFragment<'_> {
    /// True if the fragment no longer borrows from the input buffer.
    pub fn is_safe(&self) -> bool {
        matches!(self.content, Cow::Owned(_)) && matches!(self.time, Cow::Owned(_))
    }

    pub fn into_owned(self) -> StreamFragment<'static> {
        StreamFragment {
            time: Cow::Owned(self.time.into_owned()),
            stream: self.stream,
            content: Cow::Owned(self.content.into_owned()),
            partial: self.partial,
        }
    }

    pub fn ends_line(&self) -> bool {
        self.content.ends_with('\n')
    }
}

#[derive(serde::Deserialize)]
struct DockerJsonLine<'a> {
    #[serde(borrow, default)]
    log: Cow<'a, str>,
    #[serde(borrow, default)]
    stream: Cow<'a, str>,
    #[serde(borrow, default)]
    time: Cow<'a, str>,
}

/// Decodes one line, including its trailing `\n` if it has one.
///
/// Lines starting with `{` are decoded as Docker JSON, everything else as CRI text. A line that
/// fits neither framing becomes an [`StreamType::Unknown`] fragment carrying the raw line.
pub fn parse_line(line: &[u8]) -> StreamFragment<'_> {
    let parsed = if line.first() == Some(&b'{') {
        parse_docker_json(line)
    } else {
        parse_cri(line)
    };
    parsed.unwrap_or_else(|| {
        alarm::raise(
            AlarmType::ParseDockerLine,
            format_args!(
                "parse docker line error: {}",
                alarm::preview(line, PREVIEW_LEN)
            ),
        );
        raw_fragment(line)
    })
}

fn parse_docker_json(line: &[u8]) -> Option<StreamFragment<'_>> {
    let decoded: DockerJsonLine<'_> = serde_json::from_slice(line).ok()?;
    Some(StreamFragment {
        time: decoded.time,
        stream: StreamType::parse(&decoded.stream).unwrap_or(StreamType::Unknown),
        content: decoded.log,
        partial: false,
    })
}

fn parse_cri(line: &[u8]) -> Option<StreamFragment<'_>> {
    let text = std::str::from_utf8(line).ok()?;
    let mut fields = text.splitn(4, ' ');
    let time = fields.next().filter(|t| !t.is_empty())?;
    let stream = StreamType::parse(fields.next()?)?;
    let partial = match fields.next()? {
        "F" => false,
        "P" => true,
        _ => return None,
    };
    let content = fields.next().unwrap_or_default();
    let content = match (partial, content.strip_suffix('\n')) {
        (true, Some(stripped)) => Cow::Borrowed(stripped),
        (true, None) => Cow::Borrowed(content),
        (false, Some(_)) => Cow::Borrowed(content),
        (false, None) => Cow::Owned(format!("{content}\n")),
    };
    Some(StreamFragment {
        time: Cow::Borrowed(time),
        stream,
        content,
        partial,
    })
}

fn raw_fragment(line: &[u8]) -> StreamFragment<'_> {
    let mut content = String::from_utf8_lossy(line);
    if !content.ends_with('\n') {
        content.to_mut().push('\n');
    }
    StreamFragment {
        time: Cow::Owned(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)),
        stream: StreamType::Unknown,
        content,
        partial: false,
    }
}
