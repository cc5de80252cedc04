use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{DumpReport, FetchReport, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_dump(result: &DumpReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(result: &FetchReport) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress events to the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed = ?elapsed, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}

pub fn print_dump_summary(report: &DumpReport) {
    let green = "\x1b[32m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}sra dump summary{reset}");
    println!(
        "{green}spots: {} in {} chunks ({}){reset}",
        report.total_spots,
        report.ranges.len(),
        report.mode
    );
    for file in &report.files {
        println!("{green}  {file}{reset}");
    }
}

pub fn print_fetch_summary(report: &FetchReport) {
    let green = "\x1b[32m";
    let reset = "\x1b[0m";
    println!(
        "{green}{} -> {} ({} bytes){reset}",
        report.url, report.path, report.bytes
    );
}
