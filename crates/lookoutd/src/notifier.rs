//! Greeting delivery: an unbounded queue drained by one consumer task.
//!
//! Producers never block. Messages are delivered in order, one at a time.
//! A failed delivery is logged and dropped.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
    },
}

/// Where greetings end up.
pub trait NotificationSink: Send + 'static {
    fn deliver(&mut self, text: &str) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Runs an external TTS program with the greeting as its last argument.
#[derive(Debug, Clone)]
pub struct SpeechSink {
    program: String,
    args: Vec<String>,
}

impl SpeechSink {
    /// `command` is split on whitespace into program and leading arguments.
    pub fn from_command(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl NotificationSink for SpeechSink {
    async fn deliver(&mut self, text: &str) -> Result<(), DeliveryError> {
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(std::process::Stdio::null())
            .status()
            .await
            .map_err(|source| DeliveryError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(DeliveryError::Failed {
                program: self.program.clone(),
                status,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    async fn deliver(&mut self, text: &str) -> Result<(), DeliveryError> {
        tracing::info!(text, "greeting");
        Ok(())
    }
}

/// Sink chosen from configuration at startup.
#[derive(Debug, Clone)]
pub enum GreetingSink {
    Speech(SpeechSink),
    Log(LogSink),
}

impl GreetingSink {
    pub fn from_command(command: Option<&str>) -> Self {
        match command.and_then(SpeechSink::from_command) {
            Some(speech) => Self::Speech(speech),
            None => Self::Log(LogSink),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Speech(s) => format!("speech:{}", s.program),
            Self::Log(_) => "log".into(),
        }
    }
}

impl NotificationSink for GreetingSink {
    async fn deliver(&mut self, text: &str) -> Result<(), DeliveryError> {
        match self {
            Self::Speech(s) => s.deliver(text).await,
            Self::Log(s) => s.deliver(text).await,
        }
    }
}

/// Cheap producer handle.
#[derive(Debug, Clone)]
pub struct NotificationSender {
    tx: mpsc::UnboundedSender<String>,
}

impl NotificationSender {
    /// Queue `text`; false once the channel has shut down.
    pub fn send(&self, text: String) -> bool {
        match self.tx.send(text) {
            Ok(()) => true,
            Err(mpsc::error::SendError(text)) => {
                tracing::debug!(text = %text, "notification channel closed; dropped");
                false
            }
        }
    }
}

impl From<mpsc::UnboundedSender<String>> for NotificationSender {
    fn from(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<String>>,
    task: JoinHandle<usize>,
}

impl Notifier {
    /// Start the consumer task on the current tokio runtime.
    pub fn spawn<S: NotificationSink>(mut sink: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(async move {
            let mut delivered = 0usize;
            while let Some(text) = rx.recv().await {
                match sink.deliver(&text).await {
                    Ok(()) => delivered += 1,
                    Err(err) => tracing::warn!(error = %err, text = %text, "greeting delivery failed"),
                }
            }
            tracing::debug!(delivered, "notification consumer exiting");
            delivered
        });
        Self { tx: Some(tx), task }
    }

    pub fn sender(&self) -> Option<NotificationSender> {
        self.tx.clone().map(NotificationSender::from)
    }

    /// Close the queue and let the consumer drain it.
    ///
    /// Every other sender must already be dropped for the drain to finish.
    /// After `timeout` the consumer is aborted and remaining messages lost.
    pub async fn shutdown(mut self, timeout: Duration) {
        drop(self.tx.take());
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(delivered)) => tracing::info!(delivered, "notification channel drained"),
            Ok(Err(err)) => tracing::error!(error = %err, "notification consumer failed"),
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs_f32(), "notification drain timed out");
                self.task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records deliveries; fails any text containing "fail".
    #[derive(Clone, Default)]
    struct RecordingSink {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl NotificationSink for RecordingSink {
        async fn deliver(&mut self, text: &str) -> Result<(), DeliveryError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if text.contains("fail") {
                return Err(DeliveryError::Spawn {
                    program: "recording".into(),
                    source: std::io::Error::other("scripted failure"),
                });
            }
            self.seen.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_order() {
        let sink = RecordingSink::default();
        let notifier = Notifier::spawn(sink.clone());
        let sender = notifier.sender().unwrap();
        for name in ["Alice", "Bob", "Carol"] {
            assert!(sender.send(format!("Hello {name}!")));
        }
        drop(sender);

        notifier.shutdown(Duration::from_secs(5)).await;
        assert_eq!(
            *sink.seen.lock().unwrap(),
            ["Hello Alice!", "Hello Bob!", "Hello Carol!"]
        );
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_consumer() {
        let sink = RecordingSink::default();
        let notifier = Notifier::spawn(sink.clone());
        let sender = notifier.sender().unwrap();
        sender.send("please fail".into());
        sender.send("after".into());
        drop(sender);

        notifier.shutdown(Duration::from_secs(5)).await;
        assert_eq!(*sink.seen.lock().unwrap(), ["after"]);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_rejected() {
        let notifier = Notifier::spawn(LogSink);
        let sender = notifier.sender().unwrap();
        let straggler = sender.clone();
        drop(sender);

        // The straggler keeps the channel open, so the drain times out.
        notifier.shutdown(Duration::from_millis(50)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!straggler.send("too late".into()));
    }

    #[tokio::test]
    async fn test_speech_sink_reports_exit_status() {
        let mut ok = SpeechSink::from_command("true").unwrap();
        assert!(ok.deliver("hello").await.is_ok());

        let mut failing = SpeechSink::from_command("false").unwrap();
        assert!(matches!(
            failing.deliver("hello").await,
            Err(DeliveryError::Failed { .. })
        ));

        let mut missing = SpeechSink::from_command("lookout-no-such-tts --voice en").unwrap();
        assert!(matches!(
            missing.deliver("hello").await,
            Err(DeliveryError::Spawn { .. })
        ));
    }

    #[test]
    fn test_sink_selection() {
        assert!(matches!(GreetingSink::from_command(None), GreetingSink::Log(_)));
        assert!(matches!(GreetingSink::from_command(Some("   ")), GreetingSink::Log(_)));
        let sink = GreetingSink::from_command(Some("espeak-ng -v en"));
        assert_eq!(sink.describe(), "speech:espeak-ng");
    }
}
