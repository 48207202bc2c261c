//! Flush -> decode hand-off.
//!
//! The reader side pushes [`FlushEvent`]s into a bounded tokio channel without ever
//! blocking ([`FlushQueue::submit`]). A single [`DecodeWorker`] task drains the channel in
//! order, decodes each snapshot, optionally runs the analysis service on it, and forwards
//! the result to the consumer.
//!
//! If the worker falls behind and the queue is full, the newest flush is dropped and
//! counted as an overrun rather than stalling the transport reader.

use log::{debug, info, warn};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::analysis::{analyse, AnalysisReport, AnalysisService};
use crate::buffer::FlushEvent;
use crate::decoder::{DecodedBlock, SampleDecoder};
use crate::errors::{DriverError, Result};
use crate::profile::SessionConfig;

/// Producer side of the flush -> decode queue.
#[derive(Debug)]
pub struct FlushQueue {
    tx: mpsc::Sender<FlushEvent>,
    overruns: u64,
}

/// Create a bounded flush queue of `depth` entries.
pub fn flush_channel(depth: usize) -> (FlushQueue, mpsc::Receiver<FlushEvent>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (FlushQueue { tx, overruns: 0 }, rx)
}

impl FlushQueue {
    /// Enqueue a flush without blocking.
    ///
    /// Fails only once the decode side has gone away.
    pub fn submit(&mut self, flush: FlushEvent) -> Result<()> {
        match self.tx.try_send(flush) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                self.overruns += 1;
                warn!(
                    "decode queue full, dropping flush: sequence={}, overruns={}",
                    dropped.sequence, self.overruns
                );
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(DriverError::QueueClosed),
        }
    }

    /// Flushes dropped because the queue was full.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

/// A decoded block with the analysis results computed for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedOutput {
    pub block: DecodedBlock,
    pub analysis: Option<AnalysisReport>,
}

/// Consumer side: decodes flushes in arrival order.
pub struct DecodeWorker {
    decoder: SampleDecoder,
    analysis: Option<Box<dyn AnalysisService>>,
    sample_rate_hz: f32,
    calibrated: bool,
}

impl DecodeWorker {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            decoder: SampleDecoder::new(config),
            analysis: None,
            sample_rate_hz: config.sample_rate_hz,
            calibrated: false,
        }
    }

    pub fn with_analysis(mut self, service: Box<dyn AnalysisService>) -> Self {
        self.analysis = Some(service);
        self
    }

    /// Decode one flush and run the analysis service on it.
    ///
    /// Analysis failures are logged and leave `analysis` empty; the block is still
    /// delivered.
    pub fn process(&mut self, flush: &FlushEvent) -> Result<DecodedOutput> {
        let block = self.decoder.decode(flush)?;
        let analysis = match self.analysis.as_deref_mut() {
            Some(service) => {
                match analyse(service, &block.channels, self.sample_rate_hz, !self.calibrated) {
                    Ok(report) => {
                        self.calibrated = true;
                        Some(report)
                    }
                    Err(e) => {
                        warn!("analysis failed: sequence={}, error={}", block.sequence, e);
                        None
                    }
                }
            }
            None => None,
        };
        Ok(DecodedOutput { block, analysis })
    }

    /// Drain `rx` until the producer side is dropped or the consumer goes away.
    pub async fn run(mut self, mut rx: mpsc::Receiver<FlushEvent>, out: mpsc::Sender<DecodedOutput>) {
        let mut decoded = 0u64;
        while let Some(flush) = rx.recv().await {
            match self.process(&flush) {
                Ok(output) => {
                    decoded += 1;
                    if out.send(output).await.is_err() {
                        debug!("decoded output receiver dropped, stopping worker");
                        break;
                    }
                }
                Err(e) => warn!("failed to decode flush: sequence={}, error={}", flush.sequence, e),
            }
        }
        info!("decode worker finished: blocks={}", decoded);
    }

    /// Run the worker as a task on `handle`.
    pub fn spawn(
        self,
        handle: &Handle,
        rx: mpsc::Receiver<FlushEvent>,
        out: mpsc::Sender<DecodedOutput>,
    ) -> JoinHandle<()> {
        handle.spawn(self.run(rx, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::CalibrationParams;

    fn flush(sequence: u64, word: [u8; 2]) -> FlushEvent {
        FlushEvent {
            sequence,
            bytes: [word, word].concat(),
            interpolated_slots: 0,
        }
    }

    struct FixedAnalysis;

    impl AnalysisService for FixedAnalysis {
        fn calibrate(&mut self, channels: &[Vec<f32>], _: f32) -> Result<CalibrationParams> {
            Ok(CalibrationParams {
                offsets: vec![0.0; channels.len()],
                scales: vec![1.0; channels.len()],
            })
        }

        fn quality(&mut self, channels: &[Vec<f32>], _: f32) -> Result<Vec<f32>> {
            Ok(channels
                .iter()
                .map(|row| if row.iter().any(|v| v.is_nan()) { 0.0 } else { 1.0 })
                .collect())
        }

        fn relaxation_index(&mut self, _: &[Vec<f32>], _: f32) -> Result<f32> {
            Ok(0.5)
        }
    }

    struct FailingAnalysis;

    impl AnalysisService for FailingAnalysis {
        fn calibrate(&mut self, _: &[Vec<f32>], _: f32) -> Result<CalibrationParams> {
            Err(DriverError::Analysis("not calibrated".into()))
        }

        fn quality(&mut self, _: &[Vec<f32>], _: f32) -> Result<Vec<f32>> {
            Err(DriverError::Analysis("no quality".into()))
        }

        fn relaxation_index(&mut self, _: &[Vec<f32>], _: f32) -> Result<f32> {
            Err(DriverError::Analysis("no index".into()))
        }
    }

    #[test]
    fn test_queue_counts_overruns() {
        let (mut queue, mut rx) = flush_channel(2);
        for i in 0..5 {
            queue.submit(flush(i, [0, 1])).unwrap();
        }
        assert_eq!(queue.overruns(), 3);
        assert_eq!(rx.try_recv().unwrap().sequence, 0);
        assert_eq!(rx.try_recv().unwrap().sequence, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_queue_reports_closed_consumer() {
        let (mut queue, rx) = flush_channel(2);
        drop(rx);
        assert!(matches!(queue.submit(flush(0, [0, 1])), Err(DriverError::QueueClosed)));
    }

    #[test]
    fn test_process_calibrates_once() {
        let mut worker = DecodeWorker::new(&SessionConfig::default())
            .with_analysis(Box::new(FixedAnalysis));
        let first = worker.process(&flush(0, [0x01, 0x12])).unwrap();
        let second = worker.process(&flush(1, [0xFF, 0xFF])).unwrap();

        let first = first.analysis.unwrap();
        assert!(first.calibration.is_some());
        assert_eq!(first.quality, vec![1.0, 1.0]);

        let second = second.analysis.unwrap();
        assert!(second.calibration.is_none());
        assert_eq!(second.quality, vec![0.0, 0.0]);
        assert_eq!(second.relaxation_index, 0.5);
    }

    #[test]
    fn test_analysis_failure_keeps_block() {
        let mut worker =
            DecodeWorker::new(&SessionConfig::default()).with_analysis(Box::new(FailingAnalysis));
        let output = worker.process(&flush(0, [0x01, 0x12])).unwrap();
        assert!(output.analysis.is_none());
        assert_eq!(output.block.sample_count(), 1);
    }

    #[tokio::test]
    async fn test_worker_preserves_order() {
        let (mut queue, rx) = flush_channel(32);
        let (out_tx, mut out_rx) = mpsc::channel(32);
        let worker = DecodeWorker::new(&SessionConfig::default());
        let handle = worker.spawn(&Handle::current(), rx, out_tx);

        for i in 0..20 {
            queue.submit(flush(i, [0x01, 0x12])).unwrap();
        }
        drop(queue);
        handle.await.unwrap();

        let mut sequences = Vec::new();
        while let Some(output) = out_rx.recv().await {
            sequences.push(output.block.sequence);
        }
        assert_eq!(sequences, (0..20).collect::<Vec<_>>());
    }
}
