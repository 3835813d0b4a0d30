/// Typed models used by the table-layer tests
use dynamo_batch::DynamoTable;
use serde::{Deserialize, Serialize};

/// Event keyed by stream and sequence number
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Event {
    pub stream: String,
    pub sequence: u64,
    pub kind: String,
    pub body: Option<String>,
}

impl DynamoTable for Event {
    type PK = String;
    type SK = u64;
    const TABLE: &'static str = "tests_events";
    const PARTITION_KEY: &'static str = "stream";
    const SORT_KEY: Option<&'static str> = Some("sequence");

    fn partition_key(&self) -> String {
        self.stream.clone()
    }

    fn sort_key(&self) -> Option<u64> {
        Some(self.sequence)
    }
}

impl Event {
    #[allow(dead_code)]
    pub fn new(stream: &str, sequence: u64) -> Self {
        Self {
            stream: stream.to_string(),
            sequence,
            kind: if sequence % 2 == 0 { "even" } else { "odd" }.to_string(),
            body: None,
        }
    }
}
