use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use beam_data::Msg;
use beam_session::Stream;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct StreamOutput<'a> {
    id: u32,
    parent_id: Option<u32>,
    headers: BTreeMap<&'a str, Vec<String>>,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

/// Print one received stream: its announcement plus everything read from it.
pub fn print_stream(stream: &Stream, payload: &[u8], format: OutputFormat) {
    let header = stream.header();
    match format {
        OutputFormat::Json => {
            let out = StreamOutput {
                id: stream.id(),
                parent_id: stream.parent_id(),
                headers: header_map(&header),
                payload_size: payload.len(),
                payload: payload_preview(payload),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "PARENT", "HEADERS", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    stream.id().to_string(),
                    stream
                        .parent_id()
                        .map_or_else(|| "-".to_string(), |p| p.to_string()),
                    header.short_string(),
                    payload.len().to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{stream} size={} payload={}",
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => {
            print_raw(payload);
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn header_map(header: &Msg) -> BTreeMap<&str, Vec<String>> {
    header
        .iter()
        .map(|(key, values)| {
            let values = values.iter().map(|v| payload_preview(v)).collect();
            (key, values)
        })
        .collect()
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_payloads_are_summarized() {
        assert_eq!(payload_preview(b"hello"), "hello");
        assert_eq!(payload_preview(&[0xff, 0xfe, 0x00]), "<binary 3 bytes>");
    }

    #[test]
    fn header_map_keeps_every_value() {
        let msg: Msg = [("args", "-l"), ("args", "/tmp"), ("Name", "ls")]
            .into_iter()
            .collect();
        let map = header_map(&msg);
        assert_eq!(map["args"], ["-l", "/tmp"]);
        assert_eq!(map["name"], ["ls"]);
    }
}
