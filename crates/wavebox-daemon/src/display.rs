//! Status display animation.
//!
//! Runs on a fixed 5 Hz tick, independent of network and audio timing. The
//! renderer only reads device state; all animation bookkeeping (scroll
//! offsets, pause counters, title line position) lives here and is rebuilt
//! from generation tags when the underlying strings change.

use std::time::{Duration, Instant};
use tracing::trace;
use unicode_width::UnicodeWidthChar;
use unicode_width::UnicodeWidthStr;
use wavebox_core::state::{DeviceState, PlaybackPhase};

/// Display tick period (5 Hz).
pub const FRAME_INTERVAL: Duration = Duration::from_millis(200);

/// End-of-travel pause for the station marquee: 1 s.
const END_PAUSE_TICKS: u8 = 5;

/// Vertical title scroll advances one line per 2 s.
const TICKS_PER_TITLE_LINE: u8 = 10;

/// Title rows visible at once.
const TITLE_ROWS: u16 = 2;

// ── drivers ───────────────────────────────────────────────────────────────────

/// Primitive draw calls; pixel/font rendering happens below this boundary.
pub trait DisplayDriver: Send {
    fn clear(&mut self);
    fn text(&mut self, row: u16, col: u16, s: &str);
    /// Horizontal bar across the full row, `fraction` in 0..=1.
    fn bar(&mut self, row: u16, fraction: f64);
    fn set_brightness(&mut self, level: u8);
    fn flush(&mut self) -> anyhow::Result<()>;
}

/// Character-cell frame buffer shared by the concrete drivers.
struct FrameBuffer {
    cols: u16,
    rows: u16,
    cells: Vec<Vec<char>>,
}

impl FrameBuffer {
    fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            cells: vec![vec![' '; cols as usize]; rows as usize],
        }
    }

    fn clear(&mut self) {
        for row in &mut self.cells {
            row.fill(' ');
        }
    }

    fn text(&mut self, row: u16, col: u16, s: &str) {
        if row >= self.rows {
            return;
        }
        let line = &mut self.cells[row as usize];
        let mut x = col as usize;
        for ch in s.chars() {
            let w = ch.width().unwrap_or(0);
            if x + w > self.cols as usize {
                break;
            }
            if w > 0 {
                line[x] = ch;
                // Wide glyphs own their trailing cell.
                for pad in 1..w {
                    line[x + pad] = ' ';
                }
                x += w;
            }
        }
    }

    fn bar(&mut self, row: u16, fraction: f64) {
        if row >= self.rows || self.cols == 0 {
            return;
        }
        // Partial-block fill, eight eighths per cell.
        const BLOCKS: [char; 9] = [' ', '▏', '▎', '▍', '▌', '▋', '▊', '▉', '█'];
        let width = self.cols as usize;
        let eighths = (fraction.clamp(0.0, 1.0) * width as f64 * 8.0) as usize;
        let full = eighths / 8;
        let partial = eighths % 8;

        let line = &mut self.cells[row as usize];
        for x in 0..width {
            line[x] = if x < full {
                '█'
            } else if x == full {
                BLOCKS[partial]
            } else {
                ' '
            };
        }
    }

    fn lines(&self) -> Vec<String> {
        self.cells.iter().map(|r| r.iter().collect()).collect()
    }
}

/// Writes frames to the panel's character device; brightness goes to the
/// backlight attribute when configured.
pub struct DevicePanel {
    frame: FrameBuffer,
    device: String,
    backlight_path: String,
    brightness: u8,
}

impl DevicePanel {
    pub fn new(cols: u16, rows: u16, device: String, backlight_path: String) -> Self {
        Self {
            frame: FrameBuffer::new(cols, rows),
            device,
            backlight_path,
            brightness: 0,
        }
    }
}

impl DisplayDriver for DevicePanel {
    fn clear(&mut self) {
        self.frame.clear();
    }

    fn text(&mut self, row: u16, col: u16, s: &str) {
        self.frame.text(row, col, s);
    }

    fn bar(&mut self, row: u16, fraction: f64) {
        self.frame.bar(row, fraction);
    }

    fn set_brightness(&mut self, level: u8) {
        if level == self.brightness {
            return;
        }
        self.brightness = level;
        if !self.backlight_path.is_empty() {
            if let Err(e) = std::fs::write(&self.backlight_path, format!("{}\n", level)) {
                trace!("backlight write failed: {}", e);
            }
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        // Form feed homes the panel cursor, then one line per row.
        let mut out = String::from("\x0c");
        for line in self.frame.lines() {
            out.push_str(line.trim_end());
            out.push('\n');
        }
        std::fs::write(&self.device, out)?;
        Ok(())
    }
}

/// No panel configured: frames go to the log at trace level.
pub struct LogPanel {
    frame: FrameBuffer,
}

impl LogPanel {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            frame: FrameBuffer::new(cols, rows),
        }
    }
}

impl DisplayDriver for LogPanel {
    fn clear(&mut self) {
        self.frame.clear();
    }

    fn text(&mut self, row: u16, col: u16, s: &str) {
        self.frame.text(row, col, s);
    }

    fn bar(&mut self, row: u16, fraction: f64) {
        self.frame.bar(row, fraction);
    }

    fn set_brightness(&mut self, _level: u8) {}

    fn flush(&mut self) -> anyhow::Result<()> {
        for (i, line) in self.frame.lines().iter().enumerate() {
            trace!("display[{}] |{}|", i, line);
        }
        Ok(())
    }
}

// ── animation state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Travel {
    Out,
    Back,
}

/// Oscillating horizontal marquee: scroll until the tail clears the right
/// edge, hold for the end pause, scroll back, hold, repeat. Not a
/// wrap-around ticker.
#[derive(Debug)]
pub struct Marquee {
    offset: u16,
    travel: Travel,
    pause: u8,
}

impl Marquee {
    pub fn new() -> Self {
        Self {
            offset: 0,
            travel: Travel::Out,
            pause: END_PAUSE_TICKS,
        }
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.travel = Travel::Out;
        self.pause = END_PAUSE_TICKS;
    }

    /// Advance one tick and return the new window offset in columns.
    pub fn tick(&mut self, text_width: u16, view_width: u16) -> u16 {
        if text_width <= view_width {
            self.reset();
            return 0;
        }
        let max = text_width - view_width;
        self.offset = self.offset.min(max);

        if self.pause > 0 {
            self.pause -= 1;
            return self.offset;
        }

        match self.travel {
            Travel::Out => {
                self.offset += 1;
                if self.offset == max {
                    self.travel = Travel::Back;
                    self.pause = END_PAUSE_TICKS;
                }
            }
            Travel::Back => {
                self.offset -= 1;
                if self.offset == 0 {
                    self.travel = Travel::Out;
                    self.pause = END_PAUSE_TICKS;
                }
            }
        }
        self.offset
    }
}

/// Vertical scroller for the multi-line stream title: one line per
/// [`TICKS_PER_TITLE_LINE`] ticks, cycling, reset when the title changes.
#[derive(Debug)]
pub struct LineScroller {
    line: usize,
    ticks: u8,
}

impl LineScroller {
    pub fn new() -> Self {
        Self { line: 0, ticks: 0 }
    }

    pub fn reset(&mut self) {
        self.line = 0;
        self.ticks = 0;
    }

    /// Advance one tick, returning the index of the top visible line.
    pub fn tick(&mut self, line_count: usize) -> usize {
        if line_count <= TITLE_ROWS as usize {
            self.reset();
            return 0;
        }
        self.ticks += 1;
        if self.ticks >= TICKS_PER_TITLE_LINE {
            self.ticks = 0;
            self.line = (self.line + 1) % line_count;
        }
        self.line
    }
}

/// Slice `text` to the `width` columns starting at column `offset`.
pub fn column_window(text: &str, offset: u16, width: u16) -> String {
    let mut skipped = 0u16;
    let mut taken = 0u16;
    let mut out = String::new();
    for ch in text.chars() {
        let w = ch.width().unwrap_or(0) as u16;
        if skipped < offset {
            skipped += w;
            continue;
        }
        if taken + w > width {
            break;
        }
        out.push(ch);
        taken += w;
    }
    out
}

/// Greedy word wrap to `width` columns; overlong words are hard-split.
pub fn wrap_text(text: &str, width: u16) -> Vec<String> {
    let width = width.max(1) as usize;
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let word_w = word.width();
        let current_w = current.width();

        if current_w == 0 && word_w <= width {
            current.push_str(word);
        } else if current_w + 1 + word_w <= width {
            current.push(' ');
            current.push_str(word);
        } else {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            if word_w <= width {
                current.push_str(word);
            } else {
                // Hard-split a word wider than the display.
                let mut piece = String::new();
                for ch in word.chars() {
                    let w = ch.width().unwrap_or(0);
                    if piece.width() + w > width {
                        lines.push(std::mem::take(&mut piece));
                    }
                    piece.push(ch);
                }
                current = piece;
            }
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

// ── screen ────────────────────────────────────────────────────────────────────

/// Per-frame renderer state. Consumes generation tags from the observed
/// metadata; owns no device state.
pub struct Screen {
    cols: u16,
    marquee: Marquee,
    title_scroll: LineScroller,
    station_cursor: wavebox_core::tagged::ChangeCursor,
    title_cursor: wavebox_core::tagged::ChangeCursor,
    title_lines: Vec<String>,
}

impl Screen {
    pub fn new(cols: u16) -> Self {
        Self {
            cols,
            marquee: Marquee::new(),
            title_scroll: LineScroller::new(),
            station_cursor: wavebox_core::tagged::ChangeCursor::new(),
            title_cursor: wavebox_core::tagged::ChangeCursor::new(),
            title_lines: Vec::new(),
        }
    }

    /// Advance the animation one tick and draw the frame.
    pub fn tick(
        &mut self,
        st: &DeviceState,
        now: Instant,
        drv: &mut dyn DisplayDriver,
    ) -> anyhow::Result<()> {
        drv.set_brightness(st.brightness);
        drv.clear();

        // Row 0: station name marquee, or the phase when nothing is named.
        let headline = self.headline(st);
        if self.station_cursor.consume(&st.observed.station) {
            self.marquee.reset();
        }
        let offset = self.marquee.tick(headline.width() as u16, self.cols);
        drv.text(0, 0, &column_window(&headline, offset, self.cols));

        // Rows 1..=2: stream title window, scrolling vertically.
        if self.title_cursor.consume(&st.observed.stream_title) {
            self.title_lines = wrap_text(st.observed.stream_title.get(), self.cols);
            self.title_scroll.reset();
        }
        let top = self.title_scroll.tick(self.title_lines.len());
        for row in 0..TITLE_ROWS {
            let idx = top + row as usize;
            let line = if self.title_lines.len() > TITLE_ROWS as usize {
                // Cycle through the lines.
                self.title_lines.get(idx % self.title_lines.len().max(1))
            } else {
                self.title_lines.get(idx)
            };
            if let Some(line) = line {
                drv.text(1 + row, 0, line);
            }
        }

        // Row 3: telemetry.
        let bitrate = *st.observed.bitrate.get();
        let mut telemetry = String::new();
        if bitrate > 0 {
            telemetry.push_str(&format!("{}k ", bitrate));
        }
        telemetry.push_str(&format!("buf {:3}% ", st.observed.buffer_fill_pct));
        telemetry.push_str(st.connectivity.label());
        drv.text(3, 0, &telemetry);

        // Rows 4-5: overlay. Update progress wins over the volume window.
        if let Some(update) = st.update {
            drv.text(4, 0, &format!("updating {:3}%", update.percent));
            drv.bar(5, update.percent as f64 / 100.0);
        } else if st.volume.overlay_visible(now) {
            drv.text(
                4,
                0,
                &format!("vol {}/{}", st.volume.logical(), st.volume.max_volume()),
            );
            drv.bar(
                5,
                st.volume.logical() as f64 / st.volume.max_volume().max(1) as f64,
            );
        }

        drv.flush()
    }

    fn headline(&self, st: &DeviceState) -> String {
        let station = st.observed.station.get();
        if !station.is_empty() {
            return station.clone();
        }
        match st.phase {
            PlaybackPhase::Idle => "idle".to_string(),
            PlaybackPhase::Connecting => "connecting…".to_string(),
            PlaybackPhase::Recovering => "reconnecting…".to_string(),
            PlaybackPhase::Playing => st.intent.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wavebox_core::state::UpdateProgress;
    use wavebox_core::volume::VolumeState;

    #[test]
    fn test_marquee_oscillates_with_end_pauses() {
        let mut m = Marquee::new();
        // text 30 cols, view 20 → travel 10.
        let mut offsets = Vec::new();
        for _ in 0..45 {
            offsets.push(m.tick(30, 20));
        }

        // Initial dwell at the start.
        assert_eq!(&offsets[..5], &[0, 0, 0, 0, 0]);
        // Scroll left one column per tick until fully visible.
        assert_eq!(&offsets[5..15], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        // 1 s hold at the far end.
        assert_eq!(&offsets[15..20], &[10, 10, 10, 10, 10]);
        // Scroll back to the start.
        assert_eq!(&offsets[20..30], &[9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);
        // Hold again, then repeat indefinitely.
        assert_eq!(&offsets[30..35], &[0, 0, 0, 0, 0]);
        assert_eq!(offsets[35], 1);
    }

    #[test]
    fn test_marquee_static_when_text_fits() {
        let mut m = Marquee::new();
        for _ in 0..20 {
            assert_eq!(m.tick(12, 20), 0);
        }
    }

    #[test]
    fn test_marquee_handles_shrinking_text() {
        let mut m = Marquee::new();
        for _ in 0..25 {
            m.tick(40, 20);
        }
        // Text replaced by something barely wider than the view.
        assert!(m.tick(21, 20) <= 1);
    }

    #[test]
    fn test_line_scroller_advances_every_two_seconds() {
        let mut s = LineScroller::new();
        let mut tops = Vec::new();
        for _ in 0..30 {
            tops.push(s.tick(4));
        }
        assert_eq!(tops[8], 0);
        assert_eq!(tops[9], 1); // 10th tick = 2 s
        assert_eq!(tops[19], 2);
        assert_eq!(tops[29], 3);
    }

    #[test]
    fn test_line_scroller_short_titles_do_not_scroll() {
        let mut s = LineScroller::new();
        for _ in 0..30 {
            assert_eq!(s.tick(2), 0);
        }
    }

    #[test]
    fn test_column_window() {
        assert_eq!(column_window("hello world", 0, 5), "hello");
        assert_eq!(column_window("hello world", 6, 5), "world");
        assert_eq!(column_window("hi", 0, 10), "hi");
    }

    #[test]
    fn test_wrap_text() {
        let lines = wrap_text("one two three four", 9);
        assert_eq!(lines, vec!["one two", "three", "four"]);

        let lines = wrap_text("extraordinarily", 6);
        assert!(lines.iter().all(|l| l.width() <= 6));
    }

    /// Capturing driver for renderer tests.
    #[derive(Default)]
    struct Capture {
        texts: Vec<(u16, u16, String)>,
        bars: Vec<(u16, f64)>,
        brightness: u8,
    }

    impl DisplayDriver for Capture {
        fn clear(&mut self) {
            self.texts.clear();
            self.bars.clear();
        }
        fn text(&mut self, row: u16, col: u16, s: &str) {
            self.texts.push((row, col, s.to_string()));
        }
        fn bar(&mut self, row: u16, fraction: f64) {
            self.bars.push((row, fraction));
        }
        fn set_brightness(&mut self, level: u8) {
            self.brightness = level;
        }
        fn flush(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn device(now: Instant) -> DeviceState {
        DeviceState::new(VolumeState::new(100, now), now)
    }

    #[test]
    fn test_title_scroll_resets_only_on_change() {
        let now = Instant::now();
        let mut st = device(now);
        st.observed
            .stream_title
            .set("a very long title that wraps across several display lines easily".into());

        let mut screen = Screen::new(21);
        let mut drv = Capture::default();

        // Run well past the first line advance.
        for i in 0..12 {
            screen
                .tick(&st, now + Duration::from_millis(200 * i), &mut drv)
                .unwrap();
        }
        let advanced = screen.title_scroll.line;
        assert!(advanced > 0);

        // Same title re-announced: no reset.
        st.observed
            .stream_title
            .set("a very long title that wraps across several display lines easily".into());
        screen.tick(&st, now, &mut drv).unwrap();
        assert_eq!(screen.title_scroll.line, advanced);

        // New title: scroll restarts from the top.
        st.observed.stream_title.set("different song".into());
        screen.tick(&st, now, &mut drv).unwrap();
        assert_eq!(screen.title_scroll.line, 0);
    }

    #[test]
    fn test_volume_overlay_window_and_update_override() {
        let t0 = Instant::now();
        let mut st = device(t0);
        st.volume.set(60, t0);

        let mut screen = Screen::new(21);
        let mut drv = Capture::default();

        // Inside the 5 s window: volume overlay shown.
        screen.tick(&st, t0 + Duration::from_secs(2), &mut drv).unwrap();
        assert!(drv.texts.iter().any(|(r, _, s)| *r == 4 && s.starts_with("vol ")));

        // After the window: hidden.
        screen.tick(&st, t0 + Duration::from_secs(6), &mut drv).unwrap();
        assert!(!drv.texts.iter().any(|(r, _, _)| *r == 4));

        // Firmware update pins the overlay regardless of the window.
        st.update = Some(UpdateProgress { percent: 40 });
        screen.tick(&st, t0 + Duration::from_secs(60), &mut drv).unwrap();
        assert!(drv.texts.iter().any(|(r, _, s)| *r == 4 && s.contains("updating")));
        assert_eq!(drv.bars.last().unwrap().0, 5);
    }

    #[test]
    fn test_framebuffer_bar_partial_blocks() {
        let mut fb = FrameBuffer::new(10, 1);
        fb.bar(0, 0.5);
        let line = fb.lines().remove(0);
        assert_eq!(line.chars().filter(|&c| c == '█').count(), 5);

        fb.bar(0, 1.0);
        let line = fb.lines().remove(0);
        assert_eq!(line.chars().filter(|&c| c == '█').count(), 10);
    }
}
