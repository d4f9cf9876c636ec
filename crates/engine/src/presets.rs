//! Preset catalog for fconv
//!
//! Turns preset tokens given on the command line into encoder argument
//! fragments and an optional target extension.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Resolved form of one preset token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedPreset {
    /// Arguments spliced into the encoder command line.
    pub args: Vec<String>,
    /// Extension of the container this preset produces, if it decides one.
    pub extension: Option<String>,
}

/// Source of encoder arguments for preset tokens.
///
/// The scheduler only depends on this trait, so tests and alternative
/// catalogs can supply their own mapping.
pub trait PresetResolver: Send + Sync {
    /// Resolve a token, or `None` if it is not a preset.
    fn resolve(&self, token: &str) -> Option<ResolvedPreset>;

    /// Flatten the arguments of a preset chain in chain order.
    ///
    /// Unknown tokens contribute nothing.
    fn chain_args(&self, tokens: &[String]) -> Vec<String> {
        tokens
            .iter()
            .filter_map(|token| self.resolve(token))
            .flat_map(|preset| preset.args)
            .collect()
    }

    /// Target extension of a chain: the last preset that declares one wins.
    fn chain_extension(&self, tokens: &[String]) -> Option<String> {
        tokens
            .iter()
            .filter_map(|token| self.resolve(token))
            .filter_map(|preset| preset.extension)
            .last()
    }
}

/// A preset selected by literal name.
#[derive(Debug, Clone, Copy)]
pub struct FixedPreset {
    pub names: &'static [&'static str],
    pub description: &'static str,
    pub extension: Option<&'static str>,
    pub args: &'static [&'static str],
}

/// A preset whose token carries parameters, e.g. `1280x720`.
///
/// `{placeholder}` markers in `args` are replaced by the capture groups of
/// `pattern`, matched by position against `placeholders`.
#[derive(Debug)]
pub struct PatternPreset {
    pub display: &'static str,
    pub description: &'static str,
    pub pattern: Regex,
    pub placeholders: &'static [&'static str],
    pub args: &'static [&'static str],
}

const MP4_ARGS: &[&str] = &[
    "-c:v", "libx264", "-preset", "veryslow", "-crf", "20", "-pix_fmt", "yuv420p",
    "-c:a", "aac", "-strict", "experimental",
];

const MP4_FAST_ARGS: &[&str] = &[
    "-c:v", "libx264", "-preset", "veryfast", "-crf", "20", "-pix_fmt", "yuv420p",
    "-c:a", "aac", "-strict", "experimental",
];

static FIXED_PRESETS: &[FixedPreset] = &[
    FixedPreset {
        names: &["mp4"],
        description: "Highly optimized MP4 video with very small file size, but VERY SLOW.",
        extension: Some("mp4"),
        args: MP4_ARGS,
    },
    FixedPreset {
        names: &["mp4-fast"],
        description: "Optimized MP4 video. Faster than mp4, but a larger file.",
        extension: Some("mp4"),
        args: MP4_FAST_ARGS,
    },
    FixedPreset {
        names: &["mp3"],
        description: "MP3 audio.",
        extension: Some("mp3"),
        args: &["-ab", "320k"],
    },
    FixedPreset {
        names: &["png"],
        description: "PNG image.",
        extension: Some("png"),
        args: &[],
    },
    FixedPreset {
        names: &["jpeg", "jpg"],
        description: "JPEG image.",
        extension: Some("jpeg"),
        args: &[],
    },
    FixedPreset {
        names: &["4k"],
        description: "Resizes video to 3840 pixels wide (keeps source aspect ratio).",
        extension: None,
        args: &["-vf", "scale=3840:-1"],
    },
    FixedPreset {
        names: &["1080p"],
        description: "Resizes video to 1920 pixels wide (keeps source aspect ratio).",
        extension: None,
        args: &["-vf", "scale=1920:-1"],
    },
    FixedPreset {
        names: &["720p"],
        description: "Resizes video to 1280 pixels wide (keeps source aspect ratio).",
        extension: None,
        args: &["-vf", "scale=1280:-1"],
    },
    FixedPreset {
        names: &["crash"],
        description: "Makes the encoder fail. Useful for checking failure handling.",
        extension: None,
        args: &["-c:v", "crash_ok_thanks"],
    },
];

// Anchored patterns; a token must match as a whole.
static PATTERN_PRESETS: Lazy<Vec<PatternPreset>> = Lazy::new(|| {
    vec![
        PatternPreset {
            display: "{scale}x",
            description: "Resizes video to {scale} times the size of the original.",
            pattern: Regex::new(r"^(\d*\.?\d+)x$").expect("valid scale pattern"),
            placeholders: &["scale"],
            args: &["-vf", "scale=iw*{scale}:-2"],
        },
        PatternPreset {
            display: "{width}w",
            description: "Resizes video to {width} pixels wide.",
            pattern: Regex::new(r"^(\d+)w$").expect("valid width pattern"),
            placeholders: &["width"],
            args: &["-vf", "scale={width}:-2"],
        },
        PatternPreset {
            display: "{height}h",
            description: "Resizes video to {height} pixels tall.",
            pattern: Regex::new(r"^(\d+)h$").expect("valid height pattern"),
            placeholders: &["height"],
            args: &["-vf", "scale=-2:{height}"],
        },
        PatternPreset {
            display: "{width}x{height}",
            description: "Resizes video to the custom resolution {width}x{height}.",
            pattern: Regex::new(r"^(\d+)x(\d+)$").expect("valid resolution pattern"),
            placeholders: &["width", "height"],
            args: &["-vf", "scale={width}:{height}"],
        },
    ]
});

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-zA-Z0-9_.-]+)\}").expect("valid placeholder pattern"));

impl FixedPreset {
    fn resolve(&self) -> ResolvedPreset {
        ResolvedPreset {
            args: self.args.iter().map(|a| a.to_string()).collect(),
            extension: self.extension.map(str::to_string),
        }
    }
}

impl PatternPreset {
    fn resolve(&self, token: &str) -> Option<ResolvedPreset> {
        let captures = self.pattern.captures(token)?;
        let args = self
            .args
            .iter()
            .map(|template| self.substitute(template, &captures))
            .collect();
        Some(ResolvedPreset {
            args,
            extension: None,
        })
    }

    /// Unknown placeholders are left as written.
    fn substitute(&self, template: &str, captures: &Captures<'_>) -> String {
        PLACEHOLDER
            .replace_all(template, |marker: &Captures<'_>| {
                let name = &marker[1];
                self.placeholders
                    .iter()
                    .position(|p| *p == name)
                    .and_then(|i| captures.get(i + 1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| marker[0].to_string())
            })
            .into_owned()
    }
}

/// One line of the preset listing shown by `--list-presets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetListing {
    pub names: String,
    pub description: &'static str,
}

/// The built-in preset catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct PresetCatalog;

impl PresetCatalog {
    pub fn new() -> Self {
        Self
    }

    /// All presets in display order.
    pub fn listing(&self) -> Vec<PresetListing> {
        let fixed = FIXED_PRESETS.iter().map(|p| PresetListing {
            names: p.names.join(", "),
            description: p.description,
        });
        let patterns = PATTERN_PRESETS.iter().map(|p| PresetListing {
            names: p.display.to_string(),
            description: p.description,
        });
        fixed.chain(patterns).collect()
    }
}

impl PresetResolver for PresetCatalog {
    fn resolve(&self, token: &str) -> Option<ResolvedPreset> {
        if let Some(preset) = FIXED_PRESETS.iter().find(|p| p.names.contains(&token)) {
            return Some(preset.resolve());
        }
        PATTERN_PRESETS.iter().find_map(|p| p.resolve(token))
    }
}
