//! CSV statistics sink: one `HH:MM:SS,load,rss_bytes` row per usage sample,
//! fsynced so graders see complete rows even when the runner is killed.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use chrono::Local;

pub struct StatsSink {
    file: File,
}

impl StatsSink {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(StatsSink { file })
    }

    pub fn append(&mut self, load: f64, rss_bytes: u64) -> io::Result<()> {
        let row = format_row(&Local::now().format("%H:%M:%S").to_string(), load, rss_bytes);
        self.file.write_all(row.as_bytes())?;
        self.file.sync_data()
    }
}

fn format_row(clock: &str, load: f64, rss_bytes: u64) -> String {
    format!("{},{:.6},{}\n", clock, load, rss_bytes)
}
