use std::fmt::Write;
use std::io::stdout;
use std::time::Instant;

use crossterm::cursor::{MoveToColumn, MoveToPreviousLine};
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};

/// Two-line terminal progress display: a status line with the rate, file
/// counts and elapsed time, then the bar itself.
pub struct ProgressBar {
    bar_buf: String,
    buf: String,
    start_instant: Instant,
    bar_width: usize,
}

impl ProgressBar {
    pub fn new(max_width: usize) -> Self {
        let bar_width = crossterm::terminal::size()
            .ok()
            .map(|(cols, _rows)| usize::from(cols))
            .unwrap_or(max_width)
            .min(max_width);
        Self::with_width(bar_width)
    }

    fn with_width(bar_width: usize) -> Self {
        Self {
            buf: String::new(),
            bar_buf: String::new(),
            start_instant: Instant::now(),
            bar_width: bar_width.max(2),
        }
    }

    fn update(&mut self, downloaded: u64, total: u64, speed: u64) -> Result<&str, std::fmt::Error> {
        let progress = if total == 0 {
            0
        } else {
            (downloaded.min(total) * 100 / total) as usize
        };
        let (speed_size, speed_unit) = Self::byte_unit(speed);

        self.bar_buf.clear();
        self.buf.clear();
        let duration = self.start_instant.elapsed();
        write!(self.bar_buf, "{speed_size:.2} {speed_unit}/s - {progress} % - elapsed: {duration:.2?} ")?;
        write!(self.buf, "{downloaded} / {total} files")?;
        let used = self.bar_buf.len() + self.buf.len();
        for _ in used..self.bar_width {
            self.bar_buf.push(' ');
        }
        writeln!(self.bar_buf, "{}", self.buf)?;

        let bar_p_width = self.bar_width - 2;
        let progress_width = progress * bar_p_width / 100;
        self.bar_buf.push('[');
        for _ in 0..progress_width {
            self.bar_buf.push('█');
        }
        for _ in progress_width..bar_p_width {
            self.bar_buf.push(' ');
        }
        self.bar_buf.push(']');

        Ok(&self.bar_buf)
    }

    pub fn print(&mut self, downloaded: u64, total: u64, speed: u64) -> std::io::Result<()> {
        let update_value = self
            .update(downloaded, total, speed)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        execute!(
            stdout(),
            Clear(ClearType::CurrentLine),
            MoveToPreviousLine(1),
            Clear(ClearType::CurrentLine),
            MoveToColumn(0),
            crossterm::style::Print(update_value),
        )
    }

    pub fn byte_unit(bytes_count: u64) -> (f32, &'static str) {
        const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

        let mut i = 0;
        let mut bytes_count = bytes_count as f32;
        while bytes_count >= 1024.0 && i < UNITS.len() - 1 {
            i += 1;
            bytes_count /= 1024.0;
        }
        (bytes_count, UNITS[i])
    }
}
