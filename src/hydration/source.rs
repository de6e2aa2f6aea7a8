use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::hydration::{BarBuffer, HydrationStatus};
use crate::types::{Bar, BarSource, Instrument, StreamKey};

/// Bulk historical bar provider used during pre-hydration and restart reconstruction.
#[async_trait]
pub trait HistoricalBarSource: Send + Sync {
    async fn request(
        &self,
        instrument: &Instrument,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Bar>>;
}

/// Serves bars from memory. Used for replays and tests.
#[derive(Default)]
pub struct InMemoryBarSource {
    bars: Mutex<Vec<Bar>>,
    fail: Mutex<bool>,
}

impl InMemoryBarSource {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self {
            bars: Mutex::new(bars),
            fail: Mutex::new(false),
        }
    }

    pub fn push(&self, bar: Bar) {
        self.bars.lock().push(bar);
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl HistoricalBarSource for InMemoryBarSource {
    async fn request(
        &self,
        instrument: &Instrument,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Bar>> {
        if *self.fail.lock() {
            anyhow::bail!("historical source unavailable");
        }
        Ok(self
            .bars
            .lock()
            .iter()
            .filter(|b| &b.instrument == instrument)
            .filter(|b| b.open_timestamp_utc >= from && b.open_timestamp_utc < to)
            .map(|b| Bar {
                source: BarSource::HistoricalRequest,
                ..b.clone()
            })
            .collect())
    }
}

/// One bulk request for a stream's window.
#[derive(Clone, Debug)]
pub struct HydrationJob {
    pub stream: StreamKey,
    pub instrument: Instrument,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Spawns historical requests on the tokio runtime and feeds the results into
/// the stream's buffer.
#[derive(Clone)]
pub struct Hydrator {
    source: Arc<dyn HistoricalBarSource>,
}

impl Hydrator {
    pub fn new(source: Arc<dyn HistoricalBarSource>) -> Self {
        Self { source }
    }

    pub fn spawn(
        &self,
        job: HydrationJob,
        buffer: Arc<BarBuffer>,
        status: Arc<HydrationStatus>,
    ) -> JoinHandle<()> {
        let source = self.source.clone();
        tokio::spawn(async move {
            match source.request(&job.instrument, job.from, job.to).await {
                Ok(bars) => {
                    let received = bars.len();
                    let accepted = bars
                        .into_iter()
                        .map(|bar| buffer.admit(bar, job.to))
                        .filter(|a| a.accepted())
                        .count();
                    info!(
                        stream = %job.stream,
                        instrument = %job.instrument,
                        from = %job.from,
                        to = %job.to,
                        received,
                        accepted,
                        "hydration complete"
                    );
                    status.mark_completed();
                }
                Err(err) => {
                    warn!(
                        stream = %job.stream,
                        instrument = %job.instrument,
                        error = %err,
                        "historical request failed; continuing on live bars"
                    );
                    status.mark_failed();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydration::{AdmissionPolicy, HydrationOutcome};
    use chrono::{NaiveDate, TimeZone};

    fn bar(m: u32) -> Bar {
        Bar {
            instrument: Instrument("ES".into()),
            open_timestamp_utc: Utc.with_ymd_and_hms(2025, 7, 1, 13, m, 0).unwrap(),
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.5,
            source: BarSource::FileReplay,
        }
    }

    fn buffer() -> Arc<BarBuffer> {
        Arc::new(BarBuffer::new(AdmissionPolicy {
            trading_date: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            bar_period: chrono::Duration::seconds(60),
            tz: chrono_tz::America::Chicago,
        }))
    }

    fn job() -> HydrationJob {
        HydrationJob {
            stream: StreamKey {
                trading_date: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
                stream_id: crate::types::StreamId("ES1".into()),
            },
            instrument: Instrument("ES".into()),
            from: Utc.with_ymd_and_hms(2025, 7, 1, 13, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2025, 7, 1, 13, 5, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn hydrator_fills_buffer_and_completes() {
        let source = Arc::new(InMemoryBarSource::new((0..10).map(bar).collect()));
        let hydrator = Hydrator::new(source);
        let buf = buffer();
        let status = Arc::new(HydrationStatus::pending());
        hydrator.spawn(job(), buf.clone(), status.clone()).await.unwrap();
        // [13:00, 13:05) only; relabelled as historical.
        assert_eq!(buf.len(), 5);
        assert_eq!(status.outcome(), HydrationOutcome::Completed);
    }

    #[tokio::test]
    async fn failed_request_marks_failed() {
        let source = Arc::new(InMemoryBarSource::new(vec![bar(0)]));
        source.set_failing(true);
        let hydrator = Hydrator::new(source);
        let buf = buffer();
        let status = Arc::new(HydrationStatus::pending());
        hydrator.spawn(job(), buf.clone(), status.clone()).await.unwrap();
        assert!(buf.is_empty());
        assert_eq!(status.outcome(), HydrationOutcome::Failed);
    }
}
