//! Progress bars for ingestion, and a log writer that keeps them pinned
//! below interleaved `tracing` output.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}";

static MULTI_PROGRESS: OnceLock<MultiProgress> = OnceLock::new();

fn multi_progress() -> &'static MultiProgress {
    MULTI_PROGRESS.get_or_init(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        mp
    })
}

pub fn add_progress_bar(len: u64) -> ProgressBar {
    multi_progress().add(ProgressBar::new(len))
}

/// Styled bar over `len` items, or `None` when there is nothing to track
pub fn start_progress_bar(len: usize, message: &str) -> Option<ProgressBar> {
    if len == 0 {
        return None;
    }

    let pb = add_progress_bar(len as u64);
    if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
        pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

pub fn advance_progress(pb: &Option<ProgressBar>, delta: usize) {
    if let Some(pb) = pb {
        pb.inc(delta as u64);
    }
}

pub fn finish_progress(pb: Option<ProgressBar>, message: &str) {
    if let Some(pb) = pb {
        pb.finish_with_message(message.to_string());
    }
}

#[derive(Default, Clone)]
pub struct LogWriterFactory;

/// Line-buffered writer that prints complete lines above the progress bars
#[derive(Default)]
pub struct LogWriter {
    pending: Vec<u8>,
}

fn emit_line(bytes: &[u8]) {
    let line = String::from_utf8_lossy(bytes);
    let _ = multi_progress().println(line.trim_end_matches(['\r', '\n']));
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            emit_line(&line);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            emit_line(&self.pending);
            self.pending.clear();
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogWriterFactory {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_work_has_no_bar() {
        assert!(start_progress_bar(0, "Embedding").is_none());
    }

    #[test]
    fn test_bar_tracks_position() {
        let pb = start_progress_bar(10, "Embedding");
        advance_progress(&pb, 4);
        assert_eq!(pb.as_ref().map(|p| p.position()), Some(4));
        finish_progress(pb, "done");
    }

    #[test]
    fn test_log_writer_accepts_partial_lines() {
        let mut writer = LogWriterFactory.make_writer();
        assert_eq!(writer.write(b"half a ").unwrap(), 7);
        assert_eq!(writer.write(b"line\nnext").unwrap(), 9);
        writer.flush().unwrap();
    }
}
