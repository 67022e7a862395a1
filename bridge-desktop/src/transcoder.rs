//! External-process transcoder.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    transcode::{TranscodeTarget, Transcoder},
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Runs an ffmpeg-compatible encoder binary for each file.
///
/// The output container is passed explicitly with `-f` because the core
/// writes to a staging path whose extension does not name the format.
pub struct CommandTranscoder {
    program: PathBuf,
}

impl CommandTranscoder {
    /// Use `ffmpeg` from `PATH`.
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
        }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn muxer_for(extension: &str) -> &str {
        match extension {
            "m4a" | "aac" => "ipod",
            "opus" => "ogg",
            other => other,
        }
    }

    fn build_args(input: &Path, output: &Path, target: &TranscodeTarget) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-vn".to_string(),
            "-map_metadata".to_string(),
            "0".to_string(),
            "-c:a".to_string(),
            target.codec.clone(),
            "-b:a".to_string(),
            format!("{}k", target.bitrate_kbps),
            "-f".to_string(),
            Self::muxer_for(&target.extension).to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }
}

impl Default for CommandTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transcoder for CommandTranscoder {
    fn name(&self) -> &str {
        "command"
    }

    #[instrument(skip(self, target), fields(profile = %target.name))]
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        target: &TranscodeTarget,
    ) -> Result<()> {
        let args = Self::build_args(input, output, target);
        debug!(program = ?self.program, "Spawning encoder");

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    BridgeError::NotAvailable(format!(
                        "encoder {} not found",
                        self.program.display()
                    ))
                } else {
                    BridgeError::Io(e)
                }
            })?;

        if result.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let reason = stderr.lines().last().unwrap_or("no output").trim();
            Err(BridgeError::OperationFailed(format!(
                "encoder exited with {}: {}",
                result.status, reason
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_name_the_container() {
        let target = TranscodeTarget::default();
        let args = CommandTranscoder::build_args(
            Path::new("/music/a.flac"),
            Path::new("/cache/a.ogg.part"),
            &target,
        );

        let f = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f + 1], "ogg");
        assert!(args.contains(&"libopus".to_string()));
        assert!(args.contains(&"128k".to_string()));
        assert_eq!(args.last().unwrap(), "/cache/a.ogg.part");
    }

    #[test]
    fn test_m4a_uses_ipod_muxer() {
        assert_eq!(CommandTranscoder::muxer_for("m4a"), "ipod");
        assert_eq!(CommandTranscoder::muxer_for("mp3"), "mp3");
    }

    #[tokio::test]
    async fn test_missing_program_is_not_available() {
        let transcoder = CommandTranscoder::with_program("/definitely/not/an/encoder");
        let err = transcoder
            .transcode(
                Path::new("in.flac"),
                Path::new("out.ogg"),
                &TranscodeTarget::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotAvailable(_)));
    }
}
