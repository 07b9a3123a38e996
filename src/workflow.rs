use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{FfwatchError, Result};
use crate::events::EventEmitter;
use crate::media::{ConversionJob, ConversionOptions, ConversionReport, MediaProcessorTrait};

const MEDIA_EXTENSIONS: [&str; 10] = [
    "mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v", "mpg", "ts",
];

/// Outcome of a batch conversion. Individual failures do not stop the batch.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub converted: Vec<ConversionReport>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub input: PathBuf,
    pub error: String,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.converted.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Workflow {
    media: Box<dyn MediaProcessorTrait>,
    options: ConversionOptions,
    timeout: Option<Duration>,
}

impl Workflow {
    /// Conversions use the options from `config`.
    pub fn new(config: &Config, media: Box<dyn MediaProcessorTrait>) -> Self {
        Self {
            media,
            options: config.conversion.clone(),
            timeout: None,
        }
    }

    pub fn with_options(mut self, options: ConversionOptions) -> Self {
        self.options = options;
        self
    }

    /// Per-file time limit, overriding the configured one
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn media(&self) -> &dyn MediaProcessorTrait {
        self.media.as_ref()
    }

    pub fn events(&self) -> Arc<EventEmitter> {
        self.media.events()
    }

    /// Convert `input` into exactly `output`
    pub async fn convert_file<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input: P,
        output: Q,
    ) -> Result<ConversionReport> {
        let mut job = ConversionJob::new(input, output, self.options.clone());
        job.timeout = self.timeout;
        self.media.convert(&job).await
    }

    /// Convert a single file into `output_dir` (default: next to the input) as `<stem>.<format>`
    pub async fn convert_single<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input_path: P,
        output_dir: Option<Q>,
        format: &str,
    ) -> Result<ConversionReport> {
        let input_path = input_path.as_ref();
        info!("Converting single file: {}", input_path.display());

        if !input_path.exists() {
            return Err(FfwatchError::FileNotFound(input_path.display().to_string()));
        }

        let output_dir = match output_dir {
            Some(dir) => dir.as_ref().to_path_buf(),
            None => input_path
                .parent()
                .ok_or_else(|| FfwatchError::Config("Cannot determine output directory".to_string()))?
                .to_path_buf(),
        };
        fs::create_dir_all(&output_dir).await?;

        let output = output_path(input_path, &output_dir, format)?;
        self.convert_file(input_path, output).await
    }

    /// Convert every media file under `input_dir`, mirroring sub-directories under `output_dir`
    pub async fn convert_batch<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input_dir: P,
        output_dir: Option<Q>,
        format: &str,
    ) -> Result<BatchSummary> {
        let input_dir = input_dir.as_ref();
        info!("Converting directory: {}", input_dir.display());

        if !input_dir.is_dir() {
            return Err(FfwatchError::Config("Input path is not a directory".to_string()));
        }

        let output_dir = match output_dir {
            Some(dir) => dir.as_ref().to_path_buf(),
            None => input_dir.to_path_buf(),
        };
        fs::create_dir_all(&output_dir).await?;

        let media_files = find_media_files(input_dir);
        info!("Found {} media files to convert", media_files.len());

        let mut summary = BatchSummary::default();
        for input in media_files {
            let target_dir = input
                .parent()
                .and_then(|parent| pathdiff::diff_paths(parent, input_dir))
                .map(|relative| output_dir.join(relative))
                .unwrap_or_else(|| output_dir.clone());

            let result = match output_path(&input, &target_dir, format) {
                Ok(output) => self.convert_file(&input, output).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(report) => {
                    info!("Successfully converted: {}", input.display());
                    summary.converted.push(report);
                }
                Err(e) => {
                    warn!("Failed to convert {}: {}", input.display(), e);
                    summary.failed.push(BatchFailure {
                        input,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Batch finished: {} converted, {} failed",
            summary.converted.len(),
            summary.failed.len()
        );
        Ok(summary)
    }
}

fn find_media_files(input_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(input_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// `<output_dir>/<stem>.<format>`, suffixed with `_converted` when it would overwrite the input.
fn output_path(input: &Path, output_dir: &Path, format: &str) -> Result<PathBuf> {
    let stem = input
        .file_stem()
        .ok_or_else(|| FfwatchError::Config("Invalid media filename".to_string()))?
        .to_string_lossy();
    let format = format.trim_start_matches('.');

    let candidate = output_dir.join(format!("{}.{}", stem, format));
    if candidate == input {
        return Ok(output_dir.join(format!("{}_converted.{}", stem, format)));
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaFile, MockMediaProcessorTrait};
    use assert_fs::prelude::*;
    use assert_fs::TempDir;

    fn report(job: &ConversionJob) -> ConversionReport {
        ConversionReport {
            media: MediaFile::new(&job.input),
            output: job.output.clone(),
            exit_code: Some(0),
            total_duration: Duration::from_secs(1),
            elapsed: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_output_path() {
        let dir = Path::new("/videos");
        assert_eq!(
            output_path(Path::new("/videos/a.mkv"), dir, "mp4").unwrap(),
            PathBuf::from("/videos/a.mp4")
        );
        assert_eq!(
            output_path(Path::new("/videos/a.mp4"), dir, ".mp4").unwrap(),
            PathBuf::from("/videos/a_converted.mp4")
        );
    }

    #[tokio::test]
    async fn test_convert_single_defaults_to_input_directory() {
        let dir = TempDir::new().unwrap();
        let input = dir.child("clip.mov");
        input.write_str("").unwrap();

        let mut media = MockMediaProcessorTrait::new();
        let expected = dir.child("clip.mp4").path().to_path_buf();
        media
            .expect_convert()
            .withf(move |job| job.output == expected && job.timeout == Some(Duration::from_secs(9)))
            .times(1)
            .returning(|job| Ok(report(job)));

        let workflow = Workflow::new(&Config::default(), Box::new(media))
            .with_timeout(Some(Duration::from_secs(9)));
        let report = workflow
            .convert_single(input.path(), None::<&Path>, "mp4")
            .await
            .unwrap();
        assert_eq!(report.output, dir.child("clip.mp4").path());
    }

    #[tokio::test]
    async fn test_convert_single_missing_input() {
        let mut media = MockMediaProcessorTrait::new();
        media.expect_convert().never();

        let workflow = Workflow::new(&Config::default(), Box::new(media));
        let err = workflow
            .convert_single("/no/such/clip.mov", None::<&Path>, "mp4")
            .await
            .unwrap_err();
        assert!(matches!(err, FfwatchError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_convert_batch_mirrors_tree_and_continues_past_failures() {
        let input_dir = TempDir::new().unwrap();
        input_dir.child("a.mkv").write_str("").unwrap();
        input_dir.child("season1/b.avi").write_str("").unwrap();
        input_dir.child("season1/broken.mov").write_str("").unwrap();
        input_dir.child("notes.txt").write_str("").unwrap();
        let output_dir = TempDir::new().unwrap();

        let mut media = MockMediaProcessorTrait::new();
        media.expect_convert().times(3).returning(|job| {
            if job.input.ends_with("broken.mov") {
                Err(FfwatchError::Parse("bad input".to_string()))
            } else {
                Ok(report(job))
            }
        });

        let options = ConversionOptions {
            crf: Some(30),
            ..Default::default()
        };
        let workflow = Workflow::new(&Config::default(), Box::new(media)).with_options(options);
        let summary = workflow
            .convert_batch(input_dir.path(), Some(output_dir.path()), "webm")
            .await
            .unwrap();

        assert_eq!(summary.total(), 3);
        assert!(!summary.is_success());
        let outputs: Vec<PathBuf> = summary.converted.iter().map(|r| r.output.clone()).collect();
        assert_eq!(
            outputs,
            vec![
                output_dir.child("a.webm").path().to_path_buf(),
                output_dir.child("season1/b.webm").path().to_path_buf(),
            ]
        );
        assert!(summary.failed[0].input.ends_with("broken.mov"));
        assert!(summary.failed[0].error.contains("bad input"));
    }

    #[tokio::test]
    async fn test_convert_batch_rejects_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.child("a.mp4");
        file.write_str("").unwrap();

        let workflow = Workflow::new(&Config::default(), Box::new(MockMediaProcessorTrait::new()));
        assert!(workflow
            .convert_batch(file.path(), None::<&Path>, "mp4")
            .await
            .is_err());
    }
}
