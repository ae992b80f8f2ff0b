use std::io::{self, Write};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::Event;
use crate::settings::OutputFormat;

#[derive(Serialize)]
struct JsonLine<'a> {
    pid: u32,
    comm: &'a str,
    cpu: u32,
    timestamp: DateTime<Utc>,
}

/// Writes one line per event.
pub struct OutputSink<W: Write> {
    writer: W,
    format: OutputFormat,
}

impl<W: Write> OutputSink<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self { writer, format }
    }

    pub fn emit(&mut self, event: &Event, received_at: DateTime<Utc>) -> io::Result<()> {
        match self.format {
            OutputFormat::Plain => writeln!(self.writer, "{}, {}", event.pid, event.comm),
            OutputFormat::Json => {
                let line = JsonLine {
                    pid: event.pid,
                    comm: &event.comm,
                    cpu: event.cpu,
                    timestamp: received_at,
                };
                serde_json::to_writer(&mut self.writer, &line)?;
                self.writer.write_all(b"\n")
            }
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer
    }
}
