//! Pattern index for ffmpeg diagnostic lines.
//!
//! Every matcher is a pure function of the line: it either returns `None` (no match),
//! the typed fields it extracted, or a parse error when the line has the shape of a
//! known fact but its contents cannot be interpreted.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{FfwatchError, Result};
use crate::media::{AudioStream, VideoStream};

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+:\d{2}:\d{2}(?:\.\d+)?)").expect("invalid duration regex")
});
static VIDEO_STREAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Stream #\d+:\d+.*?: Video: ([^\s,]+)(.*)").expect("invalid video stream regex")
});
static AUDIO_STREAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Stream #\d+:\d+.*?: Audio: ([^\s,]+)(.*)").expect("invalid audio stream regex")
});
static RESOLUTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{2,5})x(\d{2,5})\b").expect("invalid resolution regex"));
static FPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?) fps").expect("invalid fps regex"));
static KBPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) kb/s").expect("invalid bitrate regex"));
static SAMPLE_RATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) Hz(?:,\s*([^,]+))?").expect("invalid sample rate regex"));
static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:frame|size)=\s*\S+.*?\btime=\s*(-?\d+:\d{2}:\d{2}(?:\.\d+)?)")
        .expect("invalid progress regex")
});
static FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)=\s*(\S+)").expect("invalid field regex"));
static COMPLETION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"video:\s*\d+(?:\.\d+)?\w*B\s+audio:\s*\d+(?:\.\d+)?\w*B.*muxing overhead")
        .expect("invalid completion regex")
});

/// Numeric fields of one progress line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressFields {
    pub elapsed: Duration,
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub quality: Option<f64>,
    pub size_kb: Option<u64>,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f64>,
}

/// Parse an `HH:MM:SS(.fraction)` timestamp.
pub fn parse_timestamp(text: &str) -> Result<Duration> {
    let malformed = || FfwatchError::Parse(format!("malformed timestamp '{}'", text));

    let mut parts = text.trim().split(':');
    let (Some(hours), Some(minutes), Some(seconds), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };

    let hours: u64 = hours.parse().map_err(|_| malformed())?;
    let minutes: u64 = minutes.parse().map_err(|_| malformed())?;
    let seconds: f64 = seconds.parse().map_err(|_| malformed())?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return Err(malformed());
    }

    let whole = hours
        .checked_mul(3600)
        .and_then(|h| h.checked_add(minutes * 60))
        .ok_or_else(malformed)?;
    let fraction = Duration::try_from_secs_f64(seconds).map_err(|_| malformed())?;
    Duration::from_secs(whole)
        .checked_add(fraction)
        .ok_or_else(malformed)
}

/// `Duration: 00:01:30.00, start: ...` from the input preamble.
pub fn match_duration(line: &str) -> Result<Option<Duration>> {
    match DURATION_RE.captures(line) {
        Some(caps) => parse_timestamp(&caps[1]).map(Some),
        None => Ok(None),
    }
}

pub fn match_video_stream(line: &str) -> Option<VideoStream> {
    let caps = VIDEO_STREAM_RE.captures(line)?;
    let rest = caps.get(2).map_or("", |m| m.as_str());

    let (width, height) = RESOLUTION_RE
        .captures(rest)
        .map(|r| (r[1].parse().ok(), r[2].parse().ok()))
        .unwrap_or((None, None));

    Some(VideoStream {
        codec: caps[1].to_string(),
        width,
        height,
        fps: FPS_RE.captures(rest).and_then(|c| c[1].parse().ok()),
        bitrate_kbps: KBPS_RE.captures(rest).and_then(|c| c[1].parse().ok()),
    })
}

pub fn match_audio_stream(line: &str) -> Option<AudioStream> {
    let caps = AUDIO_STREAM_RE.captures(line)?;
    let rest = caps.get(2).map_or("", |m| m.as_str());

    let (sample_rate, channels) = SAMPLE_RATE_RE
        .captures(rest)
        .map(|c| {
            (
                c[1].parse().ok(),
                c.get(2).map(|m| m.as_str().trim().to_string()),
            )
        })
        .unwrap_or((None, None));

    Some(AudioStream {
        codec: caps[1].to_string(),
        sample_rate,
        channels,
        bitrate_kbps: KBPS_RE.captures(rest).and_then(|c| c[1].parse().ok()),
    })
}

/// `frame=  240 fps= 48 q=28.0 size=    1024kB time=00:00:10.00 bitrate= 838.9kbits/s speed=1.99x`
///
/// Fields reported as `N/A` are left empty. A negative `time=` (seen right after the
/// encoder starts) counts as zero.
pub fn match_progress(line: &str) -> Result<Option<ProgressFields>> {
    let Some(caps) = PROGRESS_RE.captures(line) else {
        return Ok(None);
    };

    let time = &caps[1];
    let elapsed = match time.strip_prefix('-') {
        Some(negative) => {
            parse_timestamp(negative)?;
            Duration::ZERO
        }
        None => parse_timestamp(time)?,
    };

    let mut fields = ProgressFields {
        elapsed,
        ..Default::default()
    };
    for field in FIELD_RE.captures_iter(line) {
        let value = &field[2];
        match &field[1] {
            "frame" => fields.frame = value.parse().ok(),
            "fps" => fields.fps = value.parse().ok(),
            "q" => fields.quality = value.parse().ok(),
            "size" | "Lsize" => fields.size_kb = leading_number(value).and_then(|n| n.parse().ok()),
            "bitrate" => fields.bitrate_kbps = leading_number(value).and_then(|n| n.parse().ok()),
            "speed" => fields.speed = value.trim_end_matches('x').parse().ok(),
            _ => {}
        }
    }
    Ok(Some(fields))
}

/// Final summary line, e.g. `video:1234kB audio:128kB subtitle:0kB ... muxing overhead: 0.5%`.
pub fn is_completion(line: &str) -> bool {
    COMPLETION_RE.is_match(line)
}

fn leading_number(value: &str) -> Option<&str> {
    let end = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    (end > 0).then(|| &value[..end])
}
