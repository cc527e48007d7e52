//! Outbound writer: owns the transport while a session runs
//!
//! The run loop never awaits a send. Captured audio and tool results are queued here
//! and written by a separate task, so a stalled socket cannot hold up transcript
//! handling, barge-in or `stop()`. Closing the writer drops any send in progress and
//! hands the transport back for teardown.

use crate::codec::WireAudio;
use crate::tools::ToolResult;
use crate::transport::Transport;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Captured frames allowed to queue behind a slow transport before new ones are dropped.
pub const AUDIO_QUEUE_FRAMES: usize = 32;

/// What the writer reports back to the run loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A tool result reached the transport.
    ToolResult(ToolResult),
    /// A send failed; the writer stops sending.
    Failed(String),
}

/// Run-loop side of the writer task.
pub struct Outbound {
    audio_tx: mpsc::Sender<WireAudio>,
    results_tx: mpsc::UnboundedSender<ToolResult>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Box<dyn Transport>>>,
}

impl Outbound {
    pub fn spawn(transport: Box<dyn Transport>) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_FRAMES);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (delivery_tx, deliveries) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();

        let writer = Writer {
            transport,
            audio_rx,
            results_rx,
            deliveries: delivery_tx,
        };
        Self {
            audio_tx,
            results_tx,
            deliveries,
            close_tx: Some(close_tx),
            task: Some(tokio::spawn(writer.run(close_rx))),
        }
    }

    /// Queue a captured frame. Dropped with a warning when the queue is full.
    pub fn send_audio(&self, audio: WireAudio) {
        match self.audio_tx.try_send(audio) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(audio)) => {
                warn!("Transport backed up, dropping {} bytes of audio", audio.data.len());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("writer gone, audio dropped"),
        }
    }

    /// Queue a tool result. Results are never dropped while the writer runs.
    pub fn send_tool_result(&self, result: ToolResult) {
        if self.results_tx.send(result).is_err() {
            debug!("writer gone, tool result dropped");
        }
    }

    /// Next delivery report. Pending forever once the writer has exited.
    pub async fn delivery(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// Stop the writer and close the transport, each step bounded by `timeout`.
    /// Safe to call more than once.
    pub async fn close(&mut self, timeout: Duration) {
        if let Some(close_tx) = self.close_tx.take() {
            // Fails only if the writer already exited.
            let _ = close_tx.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };

        let mut transport = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                warn!("Transport writer ended abnormally: {}", e);
                return;
            }
            Err(_) => {
                warn!("Transport writer did not stop within {} ms", timeout.as_millis());
                task.abort();
                return;
            }
        };

        match tokio::time::timeout(timeout, transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to close transport: {}", e),
            Err(_) => warn!("Timed out closing transport after {} ms", timeout.as_millis()),
        }
    }
}

struct Writer {
    transport: Box<dyn Transport>,
    audio_rx: mpsc::Receiver<WireAudio>,
    results_rx: mpsc::UnboundedReceiver<ToolResult>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Writer {
    /// Every await races the close signal, so closing never waits on a send.
    async fn run(mut self, mut close_rx: oneshot::Receiver<()>) -> Box<dyn Transport> {
        loop {
            let outcome = tokio::select! {
                biased;

                _ = &mut close_rx => return self.transport,

                Some(result) = self.results_rx.recv() => tokio::select! {
                    biased;
                    _ = &mut close_rx => return self.transport,
                    sent = self.transport.send_tool_result(result.clone()) => match sent {
                        Ok(()) => Delivery::ToolResult(result),
                        Err(e) => Delivery::Failed(format!("Failed to send tool result: {}", e)),
                    },
                },

                Some(audio) = self.audio_rx.recv() => tokio::select! {
                    biased;
                    _ = &mut close_rx => return self.transport,
                    sent = self.transport.send_audio(audio) => match sent {
                        Ok(()) => continue,
                        Err(e) => Delivery::Failed(format!("Failed to send audio: {}", e)),
                    },
                },
            };

            let failed = matches!(outcome, Delivery::Failed(_));
            // The run loop may already be tearing down.
            let _ = self.deliveries.send(outcome);
            if failed {
                let _ = close_rx.await;
                return self.transport;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Wire {
        audio: Mutex<Vec<WireAudio>>,
        closed: Mutex<bool>,
    }

    struct StallingTransport {
        wire: Arc<Wire>,
        stall: bool,
    }

    #[async_trait]
    impl Transport for StallingTransport {
        async fn send_audio(&mut self, audio: WireAudio) -> Result<(), TransportError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.wire.audio.lock().push(audio);
            Ok(())
        }

        async fn send_tool_result(&mut self, _result: ToolResult) -> Result<(), TransportError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            Err(TransportError::Send("socket reset".to_string()))
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            *self.wire.closed.lock() = true;
            Ok(())
        }
    }

    fn audio(len: usize) -> WireAudio {
        WireAudio {
            data: vec![0; len],
            sample_rate: 16_000,
            mime_type: "audio/pcm;rate=16000".to_string(),
        }
    }

    fn result() -> ToolResult {
        ToolResult {
            correlation_id: "call-1".to_string(),
            name: "web_search".to_string(),
            payload: "ok".to_string(),
        }
    }

    #[tokio::test]
    async fn test_writes_in_order_and_closes_transport() {
        let wire = Arc::new(Wire::default());
        let mut outbound = Outbound::spawn(Box::new(StallingTransport {
            wire: Arc::clone(&wire),
            stall: false,
        }));

        outbound.send_audio(audio(2));
        outbound.send_audio(audio(4));
        tokio::task::yield_now().await;
        outbound.close(Duration::from_secs(1)).await;

        let lens: Vec<usize> = wire.audio.lock().iter().map(|a| a.data.len()).collect();
        assert_eq!(lens, vec![2, 4]);
        assert!(*wire.closed.lock());

        // Second close is a no-op.
        outbound.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let wire = Arc::new(Wire::default());
        let mut outbound = Outbound::spawn(Box::new(StallingTransport {
            wire: Arc::clone(&wire),
            stall: false,
        }));

        outbound.send_tool_result(result());
        let delivery = outbound.delivery().await.unwrap();
        assert_eq!(
            delivery,
            Delivery::Failed("Failed to send tool result: Send failed: socket reset".to_string())
        );

        outbound.close(Duration::from_secs(1)).await;
        assert!(*wire.closed.lock());
    }

    #[tokio::test]
    async fn test_close_interrupts_stalled_sends() {
        let wire = Arc::new(Wire::default());
        let mut outbound = Outbound::spawn(Box::new(StallingTransport {
            wire: Arc::clone(&wire),
            stall: true,
        }));

        outbound.send_tool_result(result());
        outbound.send_audio(audio(2));
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(2), outbound.close(Duration::from_secs(1)))
            .await
            .expect("close waited on a stalled send");
        assert!(*wire.closed.lock());
        assert!(wire.audio.lock().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_audio() {
        let wire = Arc::new(Wire::default());
        let mut outbound = Outbound::spawn(Box::new(StallingTransport {
            wire: Arc::clone(&wire),
            stall: true,
        }));

        // One frame is held by the stalled send; the rest fill the queue and overflow.
        for _ in 0..AUDIO_QUEUE_FRAMES * 2 {
            outbound.send_audio(audio(2));
        }
        outbound.close(Duration::from_secs(1)).await;
        assert!(wire.audio.lock().is_empty());
    }
}
