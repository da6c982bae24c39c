//! CSV backup of message metadata

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::{GmailError, Result};
use crate::models::MessageMetadata;

/// A finished backup held in the job slot until the next download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvExport {
    pub filename: String,
    pub rows: u64,
    pub data: Vec<u8>,
}

impl CsvExport {
    /// Render `messages` into a backup named after `created`
    pub fn build(messages: &[MessageMetadata], created: DateTime<Local>) -> Result<Self> {
        Ok(Self {
            filename: backup_filename(created),
            rows: messages.len() as u64,
            data: write_csv(messages)?,
        })
    }
}

/// `emails-backup-YYYY-MM-DD-HHMMSS.csv`
pub fn backup_filename(created: DateTime<Local>) -> String {
    format!("emails-backup-{}.csv", created.format("%Y-%m-%d-%H%M%S"))
}

#[derive(Serialize)]
struct Row<'a> {
    id: &'a str,
    thread_id: &'a str,
    date: Option<String>,
    from_email: &'a str,
    from_name: &'a str,
    subject: &'a str,
    size_bytes: u64,
    snippet: &'a str,
}

/// One header row, then one row per message in input order
pub fn write_csv(messages: &[MessageMetadata]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    for message in messages {
        writer.serialize(Row {
            id: &message.id,
            thread_id: &message.thread_id,
            date: message.date_received.map(|d| d.to_rfc3339()),
            from_email: &message.sender_email,
            from_name: &message.sender_name,
            subject: &message.subject,
            size_bytes: message.size_estimate,
            snippet: &message.snippet,
        })?;
    }

    if messages.is_empty() {
        writer.write_record([
            "id",
            "thread_id",
            "date",
            "from_email",
            "from_name",
            "subject",
            "size_bytes",
            "snippet",
        ])?;
    }

    writer
        .into_inner()
        .map_err(|e| GmailError::IoError(e.into_error()))
}
