//! Transfer progress reporting
//!
//! Progress is emitted as `tracing` events rather than drawn, so it lands in
//! whatever subscriber the run was configured with.

use std::io::{self, Write};

use super::format::format_bytes;

/// Wraps a writer and reports every 10% of a known total.
pub struct ProgressWriter<W> {
    inner: W,
    label: String,
    total: u64,
    written: u64,
    next_step: u64,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(inner: W, label: impl Into<String>, total: u64) -> Self {
        Self {
            inner,
            label: label.into(),
            total,
            written: 0,
            next_step: 1,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn report(&mut self) {
        if self.total == 0 {
            return;
        }
        let percent = self.written.saturating_mul(100) / self.total;
        if percent >= self.next_step * 10 {
            self.next_step = percent / 10 + 1;
            tracing::info!(
                target: "k3lift::progress",
                "{} {}% ({} / {})",
                self.label,
                percent.min(100),
                format_bytes(self.written),
                format_bytes(self.total)
            );
        }
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        self.report();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
