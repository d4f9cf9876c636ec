//! Shared helpers for tests that drive a stand-in encoder.
//!
//! The stand-in is a POSIX shell script run through `sh`, so no executable
//! bit or freshly written binary is involved. It receives the same arguments
//! ffmpeg would: `$1`=-threads `$2`=N `$3`=-i `$4`=source ... last=destination.

use crate::encode::Encoder;
use crate::presets::PresetCatalog;
use crate::runner::RunContext;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Writes `body` as a script in `dir` and returns an encoder running it.
pub(crate) fn script_encoder(dir: &Path, body: &str) -> Encoder {
    let script = dir.join("fake-ffmpeg.sh");
    fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
    Encoder::new("sh").with_global_args(vec![script.to_string_lossy().into_owned()])
}

/// A well-behaved encoder.
///
/// Reports a 10 second duration and two progress records, sleeps `delay`
/// seconds in between, then writes its thread count to the destination.
/// When the `crash` preset is part of the chain it writes partial output
/// and exits with `crash_code` instead.
pub(crate) fn standard_script(delay: &str, crash_code: i32) -> String {
    format!(
        r#"threads="$2"
crash=0
for arg; do
  if [ "$arg" = "crash_ok_thanks" ]; then crash=1; fi
  last="$arg"
done
printf 'ffmpeg version fake\n' >&2
printf '  Duration: 00:00:10.00, start: 0.000000, bitrate: 1 kb/s\n' >&2
printf 'frame=  120 fps=0.0 q=-1.0 size=       0kB time=00:00:05.00 bitrate=N/A speed=10x\r' >&2
sleep {delay}
if [ "$crash" = 1 ]; then
  printf 'partial' > "$last"
  printf '\nUnknown encoder crash_ok_thanks\nConversion failed!\n' >&2
  exit {crash_code}
fi
printf '%s' "$threads" > "$last"
printf 'frame=  240 fps=0.0 q=-1.0 size=       1kB time=00:00:10.00 bitrate=N/A speed=10x\n' >&2
exit 0"#,
        delay = delay,
        crash_code = crash_code,
    )
}

/// Run context around a script encoder and the stock preset catalog.
pub(crate) fn script_context(dir: &Path, body: &str) -> RunContext {
    RunContext::new(script_encoder(dir, body), Arc::new(PresetCatalog::new()))
}
