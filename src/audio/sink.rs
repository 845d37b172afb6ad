//! Playback of synthesized audio through external players.

use crate::error::BridgeError;
use async_trait::async_trait;
use std::io::Write;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

/// A sink that plays encoded audio while it is still arriving.
#[async_trait]
pub trait StreamingSink: Send + Sync {
    /// Starts a playback session. `SinkUnavailable` means the sink cannot be
    /// used at all and the caller should fall back to buffered playback.
    async fn open(&self) -> Result<Box<dyn SinkSession>, BridgeError>;
}

#[async_trait]
pub trait SinkSession: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), BridgeError>;

    /// Signals end of input and waits for playback to finish.
    async fn finish(self: Box<Self>) -> Result<(), BridgeError>;

    /// Stops playback immediately.
    async fn abort(self: Box<Self>);
}

/// Plays a complete audio buffer, returning when playback has finished.
#[async_trait]
pub trait BufferedPlayer: Send + Sync {
    async fn play(&self, audio: &[u8]) -> Result<(), BridgeError>;
}

fn split_command(command: &[String]) -> Result<(&String, &[String]), BridgeError> {
    command
        .split_first()
        .ok_or_else(|| BridgeError::Config("empty player command".to_string()))
}

/// Feeds audio to a player's stdin, e.g. `mpv --no-video --no-terminal -`.
#[derive(Debug, Clone)]
pub struct ProcessStreamSink {
    command: Vec<String>,
}

impl ProcessStreamSink {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl StreamingSink for ProcessStreamSink {
    async fn open(&self) -> Result<Box<dyn SinkSession>, BridgeError> {
        let (program, args) = split_command(&self.command)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::SinkUnavailable(format!("{}: {}", program, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::SinkUnavailable(format!("{}: no stdin", program)))?;
        debug!("[Playback] Started streaming player '{}'.", program);
        Ok(Box::new(ProcessSession {
            child,
            stdin: Some(stdin),
        }))
    }
}

struct ProcessSession {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl SinkSession for ProcessSession {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), BridgeError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| BridgeError::Playback("player input already closed".to_string()))?;
        stdin
            .write_all(chunk)
            .await
            .map_err(|e| BridgeError::Playback(format!("player write failed: {}", e)))
    }

    async fn finish(mut self: Box<Self>) -> Result<(), BridgeError> {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                warn!("[Playback] Closing player input failed: {}", e);
            }
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| BridgeError::Playback(format!("player wait failed: {}", e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(BridgeError::Playback(format!("player exited with {}", status)))
        }
    }

    async fn abort(mut self: Box<Self>) {
        self.stdin.take();
        if let Err(e) = self.child.kill().await {
            debug!("[Playback] Killing player failed: {}", e);
        }
    }
}

/// Writes the audio to a temporary `.mp3` file and runs a player on it,
/// e.g. `mpg123 <path>`.
#[derive(Debug, Clone)]
pub struct TempFilePlayer {
    command: Vec<String>,
}

impl TempFilePlayer {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl BufferedPlayer for TempFilePlayer {
    async fn play(&self, audio: &[u8]) -> Result<(), BridgeError> {
        let (program, args) = split_command(&self.command)?;
        let mut file = tempfile::Builder::new()
            .suffix(".mp3")
            .tempfile()
            .map_err(|e| BridgeError::Playback(format!("temp file: {}", e)))?;
        file.write_all(audio)
            .and_then(|_| file.flush())
            .map_err(|e| BridgeError::Playback(format!("temp file write: {}", e)))?;

        info!(
            "[Playback] Playing {} bytes via '{}' fallback.",
            audio.len(),
            program
        );
        let status = Command::new(program)
            .args(args)
            .arg(file.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| BridgeError::SinkUnavailable(format!("{}: {}", program, e)))?;
        // `file` is removed on drop, after the player has exited.
        if status.success() {
            Ok(())
        } else {
            Err(BridgeError::Playback(format!("{} exited with {}", program, status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn missing_stream_player_is_unavailable() {
        let sink = ProcessStreamSink::new(cmd(&["definitely-not-a-player-binary"]));
        assert!(matches!(
            sink.open().await,
            Err(BridgeError::SinkUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn empty_command_is_config_error() {
        let sink = ProcessStreamSink::new(Vec::new());
        assert!(matches!(sink.open().await, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn stream_player_receives_chunks() {
        let sink = ProcessStreamSink::new(cmd(&["cat"]));
        let mut session = sink.open().await.unwrap();
        session.write(b"abc").await.unwrap();
        session.write(b"def").await.unwrap();
        session.finish().await.unwrap();
    }

    #[tokio::test]
    async fn aborted_session_does_not_hang() {
        let sink = ProcessStreamSink::new(cmd(&["cat"]));
        let mut session = sink.open().await.unwrap();
        session.write(b"abc").await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), session.abort())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fallback_player_gets_a_file_path() {
        let player = TempFilePlayer::new(cmd(&["test", "-s"]));
        player.play(b"ID3").await.unwrap();
        assert!(matches!(
            player.play(b"").await,
            Err(BridgeError::Playback(_))
        ));
    }

    #[tokio::test]
    async fn missing_fallback_player_is_unavailable() {
        let player = TempFilePlayer::new(cmd(&["definitely-not-a-player-binary"]));
        assert!(matches!(
            player.play(b"ID3").await,
            Err(BridgeError::SinkUnavailable(_))
        ));
    }
}
