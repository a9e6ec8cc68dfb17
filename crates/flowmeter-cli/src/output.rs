//! Output formatting

use anyhow::Result;
use clap::ValueEnum;
use flowmeter::export::to_json;
use flowmeter::{Anonymizer, CsvWriter, FlowStream};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per flow
    Json,
    /// Header plus one row per flow
    Csv,
}

/// Drain the stream to a file, or stdout when no path is given. Returns the
/// number of flows written.
pub fn write(
    stream: FlowStream,
    format: OutputFormat,
    path: Option<PathBuf>,
    anonymizer: Option<&dyn Anonymizer>,
) -> Result<usize> {
    if let (OutputFormat::Csv, Some(path)) = (format, path.as_ref()) {
        return Ok(stream.to_csv(path, anonymizer)?);
    }

    let sink: Box<dyn Write> = match path {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    let mut sink = BufWriter::new(sink);

    let rows = match format {
        OutputFormat::Csv => CsvWriter::new(&mut sink).write_all(stream, anonymizer)?,
        OutputFormat::Json => {
            let mut rows = 0;
            for flow in stream {
                let object = to_json(&flow?, anonymizer);
                serde_json::to_writer(&mut sink, &object)?;
                sink.write_all(b"\n")?;
                rows += 1;
            }
            rows
        }
    };
    sink.flush()?;
    Ok(rows)
}
