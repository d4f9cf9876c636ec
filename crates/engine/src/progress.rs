//! Progress parsing for encoder diagnostic output.
//!
//! ffmpeg reports progress on stderr as free-form text. A `Duration:` line is
//! printed once while the input is probed, then `frame=... time=...` records
//! are rewritten in place with carriage returns. [`StreamParser`] consumes the
//! stream in arbitrary chunks and turns it into progress ratios.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

/// Prefix of the duration declaration ffmpeg prints for each input.
const DURATION_MARKER: &str = "  Duration";

/// Prefix of a progress record.
const PROGRESS_MARKER: &str = "frame=";

/// Value ffmpeg prints when a timestamp is unknown.
const UNKNOWN_TIME: &str = "N/A";

static DURATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Duration: (N/A|[0-9.:]+)").expect("valid duration pattern"));

// Spaces after '=' are padding: "frame=  120" means frame=120.
static PADDED_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"=\s+").expect("valid padding pattern"));

/// Errors raised while parsing the diagnostic stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// A duration line that does not carry a readable duration.
    #[error("Malformed duration declaration: {0:?}")]
    MalformedDuration(String),
}

/// Converts an `HH:MM:SS[.frac]` timestamp into seconds.
///
/// `N/A` is read as zero. Returns `None` for anything else that does not
/// have three numeric fields.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let value = value.trim();
    if value == UNKNOWN_TIME {
        return Some(0.0);
    }

    let mut fields = value.split(':');
    let hours: f64 = fields.next()?.parse().ok()?;
    let minutes: f64 = fields.next()?.parse().ok()?;
    let seconds: f64 = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }

    Some((hours * 60.0 + minutes) * 60.0 + seconds)
}

/// Computes a progress ratio from a position and a total duration.
///
/// Returns `None` when the ratio is not a finite number, which covers zero
/// and unknown durations. Valid ratios are clamped to `[0, 1]`.
pub fn progress_ratio(time_secs: f64, duration_secs: f64) -> Option<f64> {
    let ratio = time_secs / duration_secs;
    if ratio.is_finite() {
        Some(ratio.clamp(0.0, 1.0))
    } else {
        None
    }
}

/// Splits a progress record into its `key=value` fields.
fn parse_record(line: &str) -> HashMap<&str, &str> {
    line.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .collect()
}

/// Incremental parser for one encoder process.
///
/// Feed it raw stderr chunks in the order they are read. Bytes are buffered
/// until a full line is available, so chunk boundaries may fall anywhere,
/// including inside a multi-byte character.
#[derive(Debug, Default)]
pub struct StreamParser {
    carry: Vec<u8>,
    duration: Option<String>,
    progress: f64,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last valid progress ratio, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Duration as declared by the encoder, if one was seen.
    pub fn duration(&self) -> Option<&str> {
        self.duration.as_deref()
    }

    /// Consumes a chunk and returns one progress value per complete
    /// progress record it finished.
    ///
    /// A malformed duration declaration is an error; everything parsed
    /// before it in the same chunk is discarded with it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<f64>, ParseError> {
        self.carry
            .extend(chunk.iter().map(|&b| if b == b'\r' { b'\n' } else { b }));

        let Some(last_newline) = self.carry.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };

        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);

        let mut updates = Vec::new();
        for raw in complete.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            if let Some(progress) = self.process_line(&line)? {
                updates.push(progress);
            }
        }
        Ok(updates)
    }

    /// Handles one complete line, returning the progress to report if the
    /// line was a progress record.
    fn process_line(&mut self, line: &str) -> Result<Option<f64>, ParseError> {
        if line.starts_with(PROGRESS_MARKER) {
            let normalized = PADDED_VALUE.replace_all(line, "=");
            let record = parse_record(&normalized);

            let ratio = record.get("time").and_then(|time| {
                let time_secs = parse_timestamp(time)?;
                let duration_secs = parse_timestamp(self.duration.as_deref()?)?;
                progress_ratio(time_secs, duration_secs)
            });
            if let Some(ratio) = ratio {
                self.progress = ratio;
            }
            return Ok(Some(self.progress));
        }

        if line.starts_with(DURATION_MARKER) {
            let captures = DURATION_PATTERN
                .captures(line)
                .ok_or_else(|| ParseError::MalformedDuration(line.to_string()))?;
            self.duration = Some(captures[1].to_string());
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DURATION_LINE: &str =
        "  Duration: 00:00:10.00, start: 0.000000, bitrate: 1205 kb/s\n";

    fn parser_with_duration(duration_line: &str) -> StreamParser {
        let mut parser = StreamParser::new();
        assert!(parser.feed(duration_line.as_bytes()).unwrap().is_empty());
        parser
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:00:05.00"), Some(5.0));
        assert_eq!(parse_timestamp("01:02:03.5"), Some(3723.5));
        assert_eq!(parse_timestamp("N/A"), Some(0.0));
        assert_eq!(parse_timestamp("00:10"), None);
        assert_eq!(parse_timestamp("1:2:3:4"), None);
        assert_eq!(parse_timestamp("ab:cd:ef"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn test_split_chunk_reconstructs_progress_line() {
        let mut parser = parser_with_duration(DURATION_LINE);

        assert!(parser.feed(b"fra").unwrap().is_empty());
        let updates = parser.feed(b"me=120 time=00:00:05.00\n").unwrap();

        assert_eq!(updates, vec![0.5]);
        assert_eq!(parser.progress(), 0.5);
    }

    #[test]
    fn test_carriage_returns_separate_records() {
        let mut parser = parser_with_duration(DURATION_LINE);

        let updates = parser
            .feed(b"frame=  10 fps=0.0 time=00:00:01.00 speed=1x\rframe=  20 fps=0.0 time=00:00:02.50 speed=1x\r")
            .unwrap();

        assert_eq!(updates, vec![0.1, 0.25]);
    }

    #[test]
    fn test_padded_values_are_tolerated() {
        let mut parser = parser_with_duration(DURATION_LINE);

        let updates = parser
            .feed(b"frame=  120 fps= 24 q=28.0 size=    256kB time= 00:00:07.50 bitrate= 279.6kbits/s speed=2.01x\n")
            .unwrap();

        assert_eq!(updates, vec![0.75]);
    }

    #[test]
    fn test_unknown_duration_keeps_last_progress() {
        let mut parser = parser_with_duration("  Duration: N/A, start: 0.000000, bitrate: N/A\n");
        assert_eq!(parser.duration(), Some("N/A"));

        let updates = parser.feed(b"frame=1 time=00:00:03.00\n").unwrap();

        // Still reported, but the ratio stays at its previous value
        assert_eq!(updates, vec![0.0]);
        assert!(!parser.progress().is_nan());
    }

    #[test]
    fn test_malformed_time_keeps_last_progress() {
        let mut parser = parser_with_duration(DURATION_LINE);
        assert_eq!(parser.feed(b"frame=1 time=00:00:04.00\n").unwrap(), vec![0.4]);

        assert_eq!(parser.feed(b"frame=2 time=garbage\n").unwrap(), vec![0.4]);
        assert_eq!(parser.feed(b"frame=3 size=10kB\n").unwrap(), vec![0.4]);
    }

    #[test]
    fn test_progress_before_duration_is_ignored() {
        let mut parser = StreamParser::new();
        assert_eq!(parser.feed(b"frame=1 time=00:00:04.00\n").unwrap(), vec![0.0]);
    }

    #[test]
    fn test_overshoot_is_clamped() {
        let mut parser = parser_with_duration(DURATION_LINE);
        assert_eq!(parser.feed(b"frame=1 time=00:00:12.00\n").unwrap(), vec![1.0]);
    }

    #[test]
    fn test_malformed_duration_is_an_error() {
        let mut parser = StreamParser::new();
        let err = parser.feed(b"  Duration unknown\n").unwrap_err();
        assert!(matches!(err, ParseError::MalformedDuration(line) if line.contains("unknown")));
    }

    #[test]
    fn test_other_lines_are_ignored() {
        let mut parser = StreamParser::new();
        let updates = parser
            .feed(b"ffmpeg version 6.1\nInput #0, mov,mp4, from 'a.mov':\n  Stream #0:0: Video: h264\n")
            .unwrap();
        assert!(updates.is_empty());
        assert_eq!(parser.duration(), None);
    }

    #[test]
    fn test_multibyte_characters_split_across_chunks() {
        let mut parser = StreamParser::new();
        let line = "Input #0, from 'vidéo.mov':\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        assert!(parser.feed(&line[..split]).unwrap().is_empty());
        assert!(parser.feed(&line[split..]).unwrap().is_empty());
        assert!(parser.carry.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // Whatever the readings, progress stays a number inside [0, 1].
        #[test]
        fn prop_progress_is_clamped(
            duration in prop_oneof![Just("N/A".to_string()), "[0-9]{1,2}:[0-9]{1,2}:[0-9]{1,2}(\\.[0-9]{1,2})?"],
            times in proptest::collection::vec("[0-9:.NA/a-z-]{0,12}", 1..10),
        ) {
            let mut parser = parser_with_duration(&format!("  Duration: {}, start: 0.0\n", duration));
            for time in times {
                let updates = parser.feed(format!("frame=1 time={}\r", time).as_bytes()).unwrap();
                for value in updates {
                    prop_assert!(!value.is_nan());
                    prop_assert!((0.0..=1.0).contains(&value));
                }
            }
        }

        // The parse result does not depend on where the stream is cut.
        #[test]
        fn prop_chunking_does_not_change_result(split in 0usize..120) {
            let stream = format!("{}frame=  42 time=00:00:02.50 bitrate=N/A\rframe=  84 time=00:00:05.00\n", DURATION_LINE);
            let bytes = stream.as_bytes();
            let split = split.min(bytes.len());

            let mut whole = StreamParser::new();
            let expected = whole.feed(bytes).unwrap();

            let mut parts = StreamParser::new();
            let mut got = parts.feed(&bytes[..split]).unwrap();
            got.extend(parts.feed(&bytes[split..]).unwrap());

            prop_assert_eq!(got, expected);
            prop_assert_eq!(parts.progress(), 0.5);
        }

        #[test]
        fn prop_timestamp_conversion(h in 0u32..100, m in 0u32..60, s in 0u32..60, cs in 0u32..100) {
            let text = format!("{:02}:{:02}:{:02}.{:02}", h, m, s, cs);
            let expected = ((h * 60 + m) * 60 + s) as f64 + cs as f64 / 100.0;
            let parsed = parse_timestamp(&text).unwrap();
            prop_assert!((parsed - expected).abs() < 1e-6);
        }
    }
}
