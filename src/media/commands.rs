use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::FfwatchError;
use crate::process::LaunchSpec;

/// Encoding options of a conversion, serialised into arguments by [`MediaCommand::options`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionOptions {
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub crf: Option<u8>,
    /// e.g. `"2500k"`
    #[serde(default)]
    pub video_bitrate: Option<String>,
    #[serde(default)]
    pub audio_bitrate: Option<String>,
    /// Scale filter geometry, e.g. `"1280:-2"`
    #[serde(default)]
    pub scale: Option<String>,
    #[serde(default)]
    pub frame_rate: Option<f64>,
    /// Passed through verbatim before the output path
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_overwrite() -> bool {
    true
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            preset: None,
            crf: None,
            video_bitrate: None,
            audio_bitrate: None,
            scale: None,
            frame_rate: None,
            extra_args: Vec::new(),
            overwrite: default_overwrite(),
        }
    }
}

impl ConversionOptions {
    /// Apply a preset profile on top of these options. Codecs are kept.
    pub fn with_profile(mut self, profile: ConversionProfile) -> Self {
        match profile {
            ConversionProfile::HighQuality => {
                self.preset = Some("slow".to_string());
                self.crf = Some(18);
            }
            ConversionProfile::Fast => {
                self.preset = Some("ultrafast".to_string());
            }
            ConversionProfile::WebOptimized => {
                self.extra_args.extend(
                    ["-movflags", "+faststart", "-pix_fmt", "yuv420p"]
                        .into_iter()
                        .map(String::from),
                );
            }
        }
        self
    }
}

/// Preset profiles for common conversions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversionProfile {
    HighQuality,
    Fast,
    WebOptimized,
}

impl fmt::Display for ConversionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversionProfile::HighQuality => "high-quality",
            ConversionProfile::Fast => "fast",
            ConversionProfile::WebOptimized => "web-optimized",
        };
        f.write_str(name)
    }
}

impl FromStr for ConversionProfile {
    type Err = FfwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "high-quality" => Ok(ConversionProfile::HighQuality),
            "fast" => Ok(ConversionProfile::Fast),
            "web-optimized" | "web" => Ok(ConversionProfile::WebOptimized),
            other => Err(FfwatchError::Config(format!("unknown profile '{}'", other))),
        }
    }
}

/// Abstract media processing command representation
#[derive(Debug, Clone, PartialEq)]
pub struct MediaCommand {
    pub binary_path: PathBuf,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    /// Create a new media processing command
    pub fn new<P: AsRef<Path>, S: Into<String>>(binary_path: P, description: S) -> Self {
        Self {
            binary_path: binary_path.as_ref().to_path_buf(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    /// Fail instead of overwriting an existing output
    pub fn no_overwrite(self) -> Self {
        self.arg("-n")
    }

    /// Suppress the build banner at the top of the diagnostic stream
    pub fn hide_banner(self) -> Self {
        self.arg("-hide_banner")
    }

    pub fn video_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:v").arg(codec)
    }

    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    pub fn video_bitrate<S: Into<String>>(self, bitrate: S) -> Self {
        self.arg("-b:v").arg(bitrate)
    }

    pub fn audio_bitrate<S: Into<String>>(self, bitrate: S) -> Self {
        self.arg("-b:a").arg(bitrate)
    }

    pub fn frame_rate(self, fps: f64) -> Self {
        self.arg("-r").arg(fps.to_string())
    }

    /// Add video filter
    pub fn video_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-vf").arg(filter)
    }

    /// Append every argument implied by `options`, in a fixed order
    pub fn options(self, options: &ConversionOptions) -> Self {
        let mut cmd = self.video_codec(&options.video_codec);
        if let Some(preset) = &options.preset {
            cmd = cmd.arg("-preset").arg(preset);
        }
        if let Some(crf) = options.crf {
            cmd = cmd.arg("-crf").arg(crf.to_string());
        }
        if let Some(bitrate) = &options.video_bitrate {
            cmd = cmd.video_bitrate(bitrate);
        }
        if let Some(scale) = &options.scale {
            cmd = cmd.video_filter(format!("scale={}", scale));
        }
        if let Some(fps) = options.frame_rate {
            cmd = cmd.frame_rate(fps);
        }
        cmd = cmd.audio_codec(&options.audio_codec);
        if let Some(bitrate) = &options.audio_bitrate {
            cmd = cmd.audio_bitrate(bitrate);
        }
        cmd.args(options.extra_args.iter().cloned())
    }

    /// Serialise the arguments into one flat string, quoting where needed.
    pub fn command_line(&self) -> String {
        self.args
            .iter()
            .map(|arg| quote_argument(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_launch_spec(&self, timeout: Option<Duration>) -> LaunchSpec {
        let spec = LaunchSpec::new(&self.binary_path).arguments(self.command_line());
        match timeout {
            Some(limit) => spec.timeout(limit),
            None => spec,
        }
    }
}

fn needs_quoting(arg: &str) -> bool {
    arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'))
}

#[cfg(not(windows))]
fn quote_argument(arg: &str) -> String {
    if !needs_quoting(arg) {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

// Command-line parsing rules of the Microsoft C runtime: backslashes are literal
// unless they precede a quote.
#[cfg(windows)]
fn quote_argument(arg: &str) -> String {
    if !needs_quoting(arg) {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => {
                backslashes += 1;
                continue;
            }
            '"' => quoted.extend(std::iter::repeat_n('\\', backslashes * 2 + 1)),
            _ => quoted.extend(std::iter::repeat_n('\\', backslashes)),
        }
        quoted.push(c);
        backslashes = 0;
    }
    quoted.extend(std::iter::repeat_n('\\', backslashes * 2));
    quoted.push('"');
    quoted
}

/// Builder for common media processing operations
#[derive(Debug, Clone)]
pub struct MediaCommandBuilder {
    binary_path: PathBuf,
}

impl MediaCommandBuilder {
    pub fn new<P: AsRef<Path>>(binary_path: P) -> Self {
        Self {
            binary_path: binary_path.as_ref().to_path_buf(),
        }
    }

    /// Build conversion command
    pub fn convert<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input: P,
        output: Q,
        options: &ConversionOptions,
    ) -> MediaCommand {
        let cmd = MediaCommand::new(&self.binary_path, "Conversion");
        let cmd = if options.overwrite {
            cmd.overwrite()
        } else {
            cmd.no_overwrite()
        };
        cmd.hide_banner()
            .input(input)
            .options(options)
            .output(output)
    }

    /// Build probe command: input only, so the tool prints the stream preamble and exits 1
    pub fn probe<P: AsRef<Path>>(&self, input: P) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Probe")
            .hide_banner()
            .input(input)
    }

    /// Build version check command
    pub fn version_check(&self) -> MediaCommand {
        MediaCommand::new(&self.binary_path, "Version check").arg("-version")
    }

    /// Build custom command
    pub fn custom<S: Into<String>>(&self, description: S) -> MediaCommand {
        MediaCommand::new(&self.binary_path, description.into())
    }
}
