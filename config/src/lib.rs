// SPDX-License-Identifier: MPL-2.0-only

use cosmic_config::{Config as CosmicConfig, ConfigGet, ConfigSet};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const NAME: &str = "com.system76.CosmicFrames";
pub const ENTRY_KEY: &str = "animation";

/// Default delay between two presented frames.
pub const DEFAULT_FRAME_DURATION_MS: u64 = 200;

/// Default number of pixel buffers circulating between decode and render.
pub const DEFAULT_BUFFER_COUNT: usize = 2;

/// Configuration for the animation's output
#[derive(Debug, Deserialize, Serialize, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[serde(deny_unknown_fields)]
#[must_use]
pub enum Output {
    /// show the animation on a specific output
    Name(String),
    /// show the animation on all outputs
    All,
}

impl Output {
    /// Whether an output with the given name is covered by this setting.
    #[must_use]
    pub fn matches(&self, name: Option<&str>) -> bool {
        match self {
            Output::All => true,
            Output::Name(wanted) => name == Some(wanted.as_str()),
        }
    }
}

impl std::fmt::Display for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Output::All => f.write_str("all"),
            Output::Name(name) => write!(f, "output.{name}"),
        }
    }
}

/// How many times the sequence is played again after the first pass.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum Repeat {
    /// loop until stopped
    #[default]
    Infinite,
    /// replay the sequence this many extra times
    Times(u32),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Setters)]
#[serde(deny_unknown_fields)]
#[must_use]
pub struct Entry {
    /// the configured output
    #[setters(skip)]
    pub output: Output,
    /// directory of frame images, or a single image
    #[setters(skip)]
    pub source: PathBuf,
    /// delay between two frames in milliseconds
    #[serde(default = "default_frame_duration")]
    pub frame_duration_ms: u64,
    /// repeat behavior once the last frame was shown
    #[serde(default)]
    pub repeat: Repeat,
    /// number of decoded frames buffered ahead of presentation
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// extra decode attempts before a frame is skipped
    #[serde(default = "default_decode_retries")]
    pub decode_retries: u32,
    /// how long the renderer waits on the decoder before warning
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_ms: u64,
    /// filter used to scale frames
    #[serde(default)]
    pub filter_method: FilterMethod,
    /// mode used to scale frames,
    #[serde(default)]
    pub scaling_mode: ScalingMode,
}

fn default_frame_duration() -> u64 {
    DEFAULT_FRAME_DURATION_MS
}

fn default_buffer_count() -> usize {
    DEFAULT_BUFFER_COUNT
}

fn default_decode_retries() -> u32 {
    2
}

fn default_stall_timeout() -> u64 {
    2000
}

impl Entry {
    /// Define an animation for a given output device.
    pub fn new(output: Output, source: PathBuf) -> Self {
        Self {
            output,
            source,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            repeat: Repeat::default(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            decode_retries: default_decode_retries(),
            stall_timeout_ms: default_stall_timeout(),
            filter_method: FilterMethod::default(),
            scaling_mode: ScalingMode::default(),
        }
    }

    /// Fallback in case config and default schema can't be loaded
    pub fn fallback() -> Self {
        let source = dirs::data_local_dir()
            .map(|dir| dir.join("cosmic-frames/frames"))
            .unwrap_or_else(|| PathBuf::from("/usr/share/cosmic-frames/frames"));

        Self::new(Output::All, source)
    }

    /// Returns this entry with a different frame source.
    pub fn with_source(mut self, source: PathBuf) -> Self {
        self.source = source;
        self
    }

    /// Rejects settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Fails on a zero frame duration or a zero buffer count.
    pub fn validate(&self) -> Result<(), Error> {
        if self.frame_duration_ms == 0 {
            return Err(Error::Invalid("frame_duration_ms must be positive"));
        }
        if self.buffer_count == 0 {
            return Err(Error::Invalid("buffer_count must be at least 1"));
        }
        Ok(())
    }

    #[must_use]
    pub fn key(&self) -> String {
        self.output.to_string()
    }
}

/// Image filtering method
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterMethod {
    // nearest neighbor filtering
    Nearest,
    // linear filtering
    Linear,
    // lanczos filtering with window 3
    #[default]
    Lanczos,
}

#[cfg(feature = "scaler")]
impl From<FilterMethod> for fast_image_resize::ResizeAlg {
    fn from(method: FilterMethod) -> Self {
        use fast_image_resize::{FilterType, ResizeAlg};
        match method {
            FilterMethod::Nearest => ResizeAlg::Nearest,
            FilterMethod::Linear => ResizeAlg::Convolution(FilterType::Bilinear),
            FilterMethod::Lanczos => ResizeAlg::Convolution(FilterType::Lanczos3),
        }
    }
}

/// Frame scaling mode
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub enum ScalingMode {
    // Fit the frame and fill the rest of the area with the given RGB color
    Fit([f32; 3]),
    /// Stretch the frame ignoring any aspect ratio to fit the area
    Stretch,
    /// Zoom the frame so that it fill the whole area
    Zoom,
}

impl Default for ScalingMode {
    fn default() -> Self {
        ScalingMode::Fit([0.0, 0.0, 0.0])
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cosmic-config: {0:?}")]
    Cosmic(cosmic_config::Error),
    #[error("failed to read {path}: {why}")]
    Read {
        path: PathBuf,
        why: std::io::Error,
    },
    #[error("failed to parse {path}: {why}")]
    Parse {
        path: PathBuf,
        why: ron::error::SpannedError,
    },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

impl From<cosmic_config::Error> for Error {
    fn from(why: cosmic_config::Error) -> Self {
        Error::Cosmic(why)
    }
}

/// Convenience function for cosmic-config
///
/// # Errors
///
/// Fails if cosmic-config paths are missing or cannot be created.
pub fn helper() -> Result<CosmicConfig, cosmic_config::Error> {
    CosmicConfig::new(NAME, 1)
}

/// Load the animation entry from cosmic-config.
///
/// # Errors
///
/// Fails if the entry is missing, fails to parse, or is invalid.
pub fn load(context: &CosmicConfig) -> Result<Entry, Error> {
    let entry = context.get::<Entry>(ENTRY_KEY)?;
    entry.validate()?;
    Ok(entry)
}

/// Applies the entry to cosmic-config.
///
/// # Errors
///
/// Fails if the config could not be set in cosmic-config.
pub fn save(context: &CosmicConfig, entry: &Entry) -> Result<(), cosmic_config::Error> {
    context.set(ENTRY_KEY, entry.clone())
}

/// Load an entry from a RON file, as written by hand or exported with [`to_ron`].
///
/// # Errors
///
/// Fails if the file cannot be read, does not parse, or is invalid.
pub fn load_file(path: &Path) -> Result<Entry, Error> {
    let text = std::fs::read_to_string(path).map_err(|why| Error::Read {
        path: path.to_path_buf(),
        why,
    })?;

    let entry = ron::from_str::<Entry>(&text).map_err(|why| Error::Parse {
        path: path.to_path_buf(),
        why,
    })?;

    entry.validate()?;
    Ok(entry)
}

/// Serialize an entry in the same format [`load_file`] reads.
///
/// # Errors
///
/// Fails if the entry cannot be represented in RON.
pub fn to_ron(entry: &Entry) -> Result<String, ron::Error> {
    ron::ser::to_string_pretty(entry, ron::ser::PrettyConfig::default())
}

/// Resolve the entry the way the daemon does at startup: cosmic-config first,
/// then the fallback.
pub fn load_or_fallback() -> Entry {
    match helper().map_err(Error::from).and_then(|context| load(&context)) {
        Ok(entry) => entry,
        Err(why) => {
            tracing::warn!(%why, "config error, falling back to defaults");
            Entry::fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrips_through_ron_with_defaults() {
        let text = r#"(
            output: All,
            source: "/tmp/frames",
            repeat: Times(3),
        )"#;

        let entry: Entry = ron::from_str(text).unwrap();
        assert_eq!(entry.output, Output::All);
        assert_eq!(entry.repeat, Repeat::Times(3));
        assert_eq!(entry.frame_duration_ms, DEFAULT_FRAME_DURATION_MS);
        assert_eq!(entry.buffer_count, DEFAULT_BUFFER_COUNT);
        assert_eq!(entry.scaling_mode, ScalingMode::Fit([0.0, 0.0, 0.0]));

        let written = to_ron(&entry).unwrap();
        assert_eq!(ron::from_str::<Entry>(&written).unwrap(), entry);
    }

    #[test]
    fn validate_rejects_zero_duration_and_buffers() {
        let entry = Entry::new(Output::All, PathBuf::from("/tmp"));
        assert!(entry.validate().is_ok());
        assert!(entry.clone().frame_duration_ms(0u64).validate().is_err());
        assert!(entry.buffer_count(0usize).validate().is_err());
    }

    #[test]
    fn load_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ron");
        std::fs::write(&path, "(output: Nowhere)").unwrap();

        assert!(matches!(load_file(&path), Err(Error::Parse { .. })));
    }

    #[test]
    fn output_matching() {
        assert!(Output::All.matches(None));
        assert!(Output::Name("DP-1".into()).matches(Some("DP-1")));
        assert!(!Output::Name("DP-1".into()).matches(Some("HDMI-A-1")));
        assert_eq!(Output::Name("DP-1".into()).to_string(), "output.DP-1");
    }
}
