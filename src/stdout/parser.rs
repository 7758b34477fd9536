use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use super::collector::{CONTENT_KEY, Collector, LogicalRecord, PipelineContext, SOURCE_KEY, TIME_KEY};
use super::framing::{StreamFragment, StreamType, parse_line};
use super::{Error, Result};
use crate::alarm::{self, AlarmType};
use crate::config::StdoutConfig;

/// Accounted per pending fragment on top of its content when enforcing the size cap.
const FRAGMENT_OVERHEAD: usize = 24;

/// Grouping policy of a [`StdoutParser`].
#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// Lines matching this regex start a new record; `None` groups by line.
    pub begin_line_regex: Option<Regex>,
    /// A pending group is flushed once the input has been idle this long.
    pub begin_line_timeout: Duration,
    /// How many leading bytes of a line are tested against the regex.
    pub begin_line_check_length: usize,
    pub max_log_size: usize,
    pub stdout: bool,
    pub stderr: bool,
}

impl ParserOptions {
    /// # Errors
    ///
    /// Returns [`Error::BeginLineRegex`] if the configured regex does not compile.
    pub fn from_config(config: &StdoutConfig) -> Result<Self> {
        let begin_line_regex = match config.begin_line_regex.as_deref() {
            None | Some("") => None,
            Some(pattern) => Some(Regex::new(pattern).map_err(|source| {
                alarm::raise(
                    AlarmType::InvalidRegex,
                    format_args!("compile begin line regex `{pattern}` error: {source}"),
                );
                Error::BeginLineRegex {
                    pattern: pattern.to_owned(),
                    source: Box::new(source),
                }
            })?),
        };
        Ok(Self {
            begin_line_regex,
            begin_line_timeout: Duration::from_millis(config.begin_line_timeout_ms),
            begin_line_check_length: config.begin_line_check_length,
            max_log_size: config.max_log_size,
            stdout: config.stdout,
            stderr: config.stderr,
        })
    }
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            begin_line_regex: None,
            begin_line_timeout: Duration::from_secs(3),
            begin_line_check_length: 10 * 1024,
            max_log_size: 512 * 1024,
            stdout: true,
            stderr: true,
        }
    }
}

/// Turns framed stdout bytes into logical records.
///
/// Fragments are grouped either by line (joining CRI partial fragments and Docker's split lines)
/// or, with a begin-line regex, into multi-line records.
pub struct StdoutParser {
    options: ParserOptions,
    context: PipelineContext,
    collector: Arc<dyn Collector>,
    tags: Vec<(String, String)>,
    pending: Vec<StreamFragment<'static>>,
    pending_size: usize,
}

impl StdoutParser {
    pub fn new(
        options: ParserOptions,
        context: PipelineContext,
        collector: Arc<dyn Collector>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            options,
            context,
            collector,
            tags: tags.into_iter().collect(),
            pending: Vec::new(),
            pending_size: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Parses every complete line of `block` and returns how many bytes were consumed.
    ///
    /// Bytes after the last `\n` are left to the caller, unless the block has no `\n` at all, in
    /// which case it is taken as one line. A pending group is flushed when `staleness`, the time
    /// since the input last grew, exceeds the begin-line timeout.
    pub fn process(&mut self, block: &[u8], staleness: Duration) -> usize {
        let mut consumed = 0;
        while let Some(pos) = block[consumed..].iter().position(|b| *b == b'\n') {
            let line = &block[consumed..consumed + pos + 1];
            consumed += pos + 1;
            self.handle(parse_line(line));
        }
        if consumed == 0 && !block.is_empty() {
            self.handle(parse_line(block));
            consumed = block.len();
        }
        if self.has_pending() && staleness > self.options.begin_line_timeout {
            log::trace!(
                "flushing {} pending fragments of {} after {:?}",
                self.pending.len(),
                self.context,
                staleness
            );
            self.flush_pending();
        }
        consumed
    }

    fn stream_allowed(&self, stream: StreamType) -> bool {
        match stream {
            StreamType::Stdout => self.options.stdout,
            StreamType::Stderr => self.options.stderr,
            StreamType::Unknown => true,
        }
    }

    fn handle(&mut self, fragment: StreamFragment<'_>) {
        if !self.stream_allowed(fragment.stream) {
            return;
        }
        match &self.options.begin_line_regex {
            None => {
                if self.pending.is_empty() && fragment.ends_line() {
                    let content = fragment
                        .content
                        .strip_suffix('\n')
                        .unwrap_or(&fragment.content[..]);
                    self.emit(content.to_owned(), &fragment.time, fragment.stream);
                    return;
                }
                let ends_line = fragment.ends_line();
                self.push(fragment);
                if ends_line || self.pending_size > self.options.max_log_size {
                    self.flush_pending();
                }
            }
            Some(regex) => {
                let at_line_start = self.pending.last().is_none_or(StreamFragment::ends_line);
                if at_line_start
                    && self.has_pending()
                    && regex.is_match(prefix(&fragment.content, self.options.begin_line_check_length))
                {
                    self.flush_pending();
                }
                self.push(fragment);
                if self.pending_size > self.options.max_log_size {
                    self.flush_pending();
                }
            }
        }
    }

    fn push(&mut self, fragment: StreamFragment<'_>) {
        self.pending_size += fragment.content.len() + FRAGMENT_OVERHEAD;
        self.pending.push(fragment.into_owned());
    }

    fn flush_pending(&mut self) {
        let Some(last) = self.pending.last() else {
            return;
        };
        let (time, stream) = (last.time.to_string(), last.stream);
        let mut content = String::with_capacity(self.pending_size);
        for fragment in self.pending.drain(..) {
            content.push_str(&fragment.content);
        }
        self.pending_size = 0;
        if content.ends_with('\n') {
            content.pop();
        }
        self.emit(content, &time, stream);
    }

    fn emit(&self, content: String, time: &str, stream: StreamType) {
        let mut fields = Vec::with_capacity(3 + self.tags.len());
        fields.push((CONTENT_KEY.to_owned(), content));
        fields.push((TIME_KEY.to_owned(), time.to_owned()));
        fields.push((SOURCE_KEY.to_owned(), stream.as_str().to_owned()));
        fields.extend(self.tags.iter().cloned());
        self.collector.collect(&self.context, LogicalRecord { fields });
    }
}

/// At most `len` leading bytes of `s`, cut back to a char boundary; zero means all of `s`.
fn prefix(s: &str, len: usize) -> &str {
    if len == 0 || s.len() <= len {
        return s;
    }
    let mut end = len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
