//! 📦 Common data structures: the building blocks of dstorm.
//!
//! 🎬 COLD OPEN. INT. BROKER ROOM. 3:47 AM.
//!
//! A `Batch` leaves a worker. It does not wait to find out whether it arrived.
//! The worker is already grabbing the next one off the rack. Somewhere a
//! consumer decodes a `Record`, squints at it, and turns it into a `Point`.
//! Nobody says goodbye. This is a throughput harness, not a family reunion. 🦆
//!
//! Everything in here is plain data. The interesting behaviour lives in the
//! workers and supervisors; these structs just carry the payload between them.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// 🏷️ Workers are numbered, like seats on a plane that never lands.
pub type WorkerId = u32;

/// 📨 One serialized message. `Arc<[u8]>` so a static batch can hold the same
/// bytes ten thousand times without paying for ten thousand allocations.
pub type Message = Arc<[u8]>;

/// 🎯 The logical record every generator emits and every consumer decodes.
///
/// Shaped like a tweet on its way through the queue:
/// an identifier, a timestamp, and a payload that pretends to have feelings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub timestamp_ms: u64,
    pub brand: String,
    pub sentiment: Sentiment,
    pub text: String,
    pub value: f64,
}

/// 😀😐😠 The three moods of synthetic social media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        }
    }
}

/// 📐 The template a generation cycle stamps records from.
///
/// Immutable for the lifetime of a batch pool. Reconfiguring a worker builds a
/// fresh pool from the same template, it never mutates this in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordTemplate {
    /// 🏷️ prefix for generated record ids; the worker id gets appended
    pub identifier: String,
    pub brand: String,
    pub text: String,
    pub sentiment: Sentiment,
    pub value: f64,
}

impl Default for RecordTemplate {
    fn default() -> Self {
        Self {
            identifier: "dstorm".to_string(),
            brand: "SuperCoffee".to_string(),
            text: "SuperCoffee is awesome!".to_string(),
            sentiment: Sentiment::Positive,
            value: 42.0,
        }
    }
}

impl RecordTemplate {
    /// 🏭 Stamp a record out of the template with the current wall clock.
    pub fn stamp(&self, seq: u64) -> Record {
        Record {
            id: format!("{}-{}", self.identifier, seq),
            timestamp_ms: now_millis(),
            brand: self.brand.clone(),
            sentiment: self.sentiment,
            text: self.text.clone(),
            value: self.value,
        }
    }
}

/// 📦 A fixed-size, ordered run of serialized messages sent together.
///
/// Owned by exactly one worker's pool. Handed to the broker behind an `Arc`, so
/// the worker can reuse its slot immediately while the send is still in flight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub messages: Vec<Message>,
}

impl Batch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 📊 Total payload bytes. One iterator, one map, one sum, zero feelings.
    pub fn total_bytes(&self) -> usize {
        self.messages.iter().map(|m| m.len()).sum()
    }
}

/// 📈 A time-series point headed for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp_ms: u64,
}

/// 🔢 Field values the line protocol knows how to say out loud.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
}

/// ✂️ The sink only keeps the first 255 characters of text. Brevity is a feature.
pub const MAX_TEXT_CHARS: usize = 255;

impl Point {
    /// 🐦 Decoded record in, tweet point out.
    pub fn from_record(record: &Record) -> Self {
        let text: String = record.text.chars().take(MAX_TEXT_CHARS).collect();
        Self {
            measurement: "tweets".to_string(),
            tags: vec![
                ("brand".to_string(), record.brand.clone()),
                ("sentiment".to_string(), record.sentiment.as_str().to_string()),
            ],
            fields: vec![
                ("text".to_string(), FieldValue::Str(text)),
                ("count".to_string(), FieldValue::Int(1)),
            ],
            timestamp_ms: record.timestamp_ms,
        }
    }

    /// 📡 Render as one line of line protocol (millisecond precision).
    ///
    /// `measurement,tag=v,tag=v field=v,field=v timestamp`
    pub fn to_line_protocol(&self) -> String {
        let mut line = String::with_capacity(64 + self.fields.len() * 16);
        line.push_str(&escape_key(&self.measurement));
        for (key, value) in &self.tags {
            let _ = write!(line, ",{}={}", escape_key(key), escape_key(value));
        }
        for (i, (key, value)) in self.fields.iter().enumerate() {
            line.push(if i == 0 { ' ' } else { ',' });
            line.push_str(&escape_key(key));
            line.push('=');
            match value {
                FieldValue::Int(v) => {
                    let _ = write!(line, "{v}i");
                }
                FieldValue::Float(v) => {
                    let _ = write!(line, "{v}");
                }
                FieldValue::Str(v) => {
                    line.push('"');
                    line.push_str(&v.replace('\\', "\\\\").replace('"', "\\\""));
                    line.push('"');
                }
            }
        }
        let _ = write!(line, " {}", self.timestamp_ms);
        line
    }
}

// -- 🧹 commas, spaces and equals signs are load-bearing in line protocol, so they get escaped
fn escape_key(raw: &str) -> String {
    raw.replace(',', "\\,").replace(' ', "\\ ").replace('=', "\\=")
}

/// ⏱️ Milliseconds since the epoch. If the clock went backwards we call it zero and move on.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn the_record() -> Record {
        Record {
            id: "r-1".to_string(),
            timestamp_ms: 1_700_000_000_000,
            brand: "SuperCoffee".to_string(),
            sentiment: Sentiment::Negative,
            text: "SuperCoffee tastes \"awful\"".to_string(),
            value: 1.5,
        }
    }

    #[test]
    fn the_one_where_a_record_becomes_a_line_of_protocol() {
        let the_line = Point::from_record(&the_record()).to_line_protocol();
        assert_eq!(
            the_line,
            r#"tweets,brand=SuperCoffee,sentiment=negative text="SuperCoffee tastes \"awful\"",count=1i 1700000000000"#
        );
    }

    #[test]
    fn the_one_where_long_text_gets_a_haircut() {
        let mut the_chatty_record = the_record();
        the_chatty_record.text = "x".repeat(1000);
        let the_point = Point::from_record(&the_chatty_record);
        match &the_point.fields[0].1 {
            FieldValue::Str(text) => assert_eq!(text.chars().count(), MAX_TEXT_CHARS),
            other => panic!("💀 text field should be a string, got {other:?}"),
        }
    }

    #[test]
    fn the_one_where_tags_with_spaces_are_escaped() {
        let mut the_record = the_record();
        the_record.brand = "Super Coffee,Inc".to_string();
        let the_line = Point::from_record(&the_record).to_line_protocol();
        assert!(the_line.starts_with(r"tweets,brand=Super\ Coffee\,Inc,"));
    }

    #[test]
    fn the_one_where_the_template_stamps_sequential_ids() {
        let the_template = RecordTemplate::default();
        assert_eq!(the_template.stamp(7).id, "dstorm-7");
        assert_eq!(the_template.stamp(7).brand, "SuperCoffee");
    }
}
