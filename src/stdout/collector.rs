use std::fmt;

pub const CONTENT_KEY: &str = "content";
pub const TIME_KEY: &str = "_time_";
pub const SOURCE_KEY: &str = "_source_";

/// Identity of the pipeline a record belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PipelineContext {
    pub project: String,
    pub logstore: String,
    pub config_name: String,
}

impl fmt::Display for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.logstore, self.config_name)
    }
}

/// One reconstructed log record: ordered `key -> value` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LogicalRecord {
    pub fields: Vec<(String, String)>,
}

impl LogicalRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn content(&self) -> Option<&str> {
        self.get(CONTENT_KEY)
    }
}

/// Receiver of the records a pipeline emits.
pub trait Collector: Send + Sync {
    fn collect(&self, context: &PipelineContext, record: LogicalRecord);
}

/// Forwards records into a channel, e.g. towards a flusher task.
#[derive(Debug, Clone)]
pub struct ChannelCollector {
    tx: tokio::sync::mpsc::UnboundedSender<(PipelineContext, LogicalRecord)>,
}

impl ChannelCollector {
    pub fn new() -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<(PipelineContext, LogicalRecord)>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Collector for ChannelCollector {
    fn collect(&self, context: &PipelineContext, record: LogicalRecord) {
        if self.tx.send((context.clone(), record)).is_err() {
            log::debug!("dropping record of {context}, receiver is gone");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Keeps every record in memory.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryCollector {
        records: Arc<Mutex<Vec<LogicalRecord>>>,
    }

    impl MemoryCollector {
        pub fn records(&self) -> Vec<LogicalRecord> {
            self.records.lock().unwrap().clone()
        }

        pub fn contents(&self) -> Vec<String> {
            self.records()
                .iter()
                .map(|r| r.content().unwrap_or_default().to_owned())
                .collect()
        }
    }

    impl Collector for MemoryCollector {
        fn collect(&self, _context: &PipelineContext, record: LogicalRecord) {
            self.records.lock().unwrap().push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_collector_forwards() {
        let (collector, mut rx) = ChannelCollector::new();
        let context = PipelineContext {
            project: "p".to_owned(),
            logstore: "l".to_owned(),
            config_name: "c".to_owned(),
        };
        collector.collect(
            &context,
            LogicalRecord {
                fields: vec![(CONTENT_KEY.to_owned(), "x".to_owned())],
            },
        );
        let (ctx, record) = rx.recv().await.unwrap();
        assert_eq!(ctx.to_string(), "p/l/c");
        assert_eq!(record.content(), Some("x"));
        assert_eq!(record.get(TIME_KEY), None);
    }
}
