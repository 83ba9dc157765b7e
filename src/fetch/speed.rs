use serde::Serialize;
use std::time::{Duration, Instant};

/// Network quality tier driving the worker pool's concurrency bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkTier {
    Slow,
    Medium,
    Fast,
}

impl NetworkTier {
    pub fn max_concurrency(&self) -> usize {
        match self {
            NetworkTier::Slow => 5,
            NetworkTier::Medium => 8,
            NetworkTier::Fast => 15,
        }
    }
}

/// Tier classification from measured latency and bandwidth.
///
/// Slow: latency over 200 ms or under 1 Mbps. Medium: latency over 100 ms
/// or under 10 Mbps. Fast otherwise.
pub fn classify(latency_ms: u64, mbps: f64) -> NetworkTier {
    if latency_ms > 200 || mbps < 1.0 {
        NetworkTier::Slow
    } else if latency_ms > 100 || mbps < 10.0 {
        NetworkTier::Medium
    } else {
        NetworkTier::Fast
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Small rotation so one CDN having a bad day does not skew the result
const PROBE_URLS: &[&str] = &[
    "https://www.gstatic.com/generate_204",
    "https://cp.cloudflare.com/generate_204",
    "https://captive.apple.com/hotspot-detect.html",
];
/// A known ~1 MB asset for the bandwidth sample
const BANDWIDTH_URL: &str = "https://speed.cloudflare.com/__down?bytes=1000000";

/// Probes the network at startup and on demand.
pub struct SpeedDetector {
    client: reqwest::Client,
}

impl SpeedDetector {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Measure and classify. Any probe failure falls back to Medium — a
    /// wrong guess only mis-sizes the pool, it must never block ingestion.
    pub async fn detect(&self) -> NetworkTier {
        let latency_ms = match self.measure_latency().await {
            Some(ms) => ms,
            None => {
                tracing::warn!("latency probe failed, keeping medium defaults");
                return NetworkTier::Medium;
            }
        };

        let mbps = match self.measure_bandwidth().await {
            Some(mbps) => mbps,
            None => {
                tracing::warn!("bandwidth probe failed, keeping medium defaults");
                return NetworkTier::Medium;
            }
        };

        let tier = classify(latency_ms, mbps);
        tracing::info!(
            latency_ms = latency_ms,
            mbps = format!("{mbps:.1}"),
            tier = ?tier,
            max_concurrency = tier.max_concurrency(),
            "network speed detected"
        );
        tier
    }

    /// Best HEAD round-trip across the probe rotation.
    async fn measure_latency(&self) -> Option<u64> {
        let mut best: Option<u64> = None;
        for url in PROBE_URLS {
            let started = Instant::now();
            let result =
                tokio::time::timeout(PROBE_TIMEOUT, self.client.head(*url).send()).await;
            if matches!(result, Ok(Ok(_))) {
                let elapsed = started.elapsed().as_millis() as u64;
                best = Some(best.map_or(elapsed, |b| b.min(elapsed)));
            }
        }
        best
    }

    async fn measure_bandwidth(&self) -> Option<f64> {
        let started = Instant::now();
        let response = tokio::time::timeout(PROBE_TIMEOUT, self.client.get(BANDWIDTH_URL).send())
            .await
            .ok()?
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let bytes = tokio::time::timeout(PROBE_TIMEOUT, response.bytes())
            .await
            .ok()?
            .ok()?;

        let seconds = started.elapsed().as_secs_f64();
        if seconds <= 0.0 || bytes.is_empty() {
            return None;
        }
        Some(bytes.len() as f64 * 8.0 / seconds / 1_000_000.0)
    }
}
