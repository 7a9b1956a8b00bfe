use hdrhistogram::Histogram;

/// Latency quantiles published for every summary series.
pub const QUANTILES: [f64; 3] = [0.5, 0.9, 0.99];

#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    hist: Histogram<u64>,
    sum_ms: u64,
}

impl LatencyHistogram {
    /// Create an empty latency histogram with three significant digits.
    ///
    /// # Errors
    ///
    /// Returns an error if the histogram cannot be created.
    pub fn new() -> Result<Self, String> {
        let hist = Histogram::<u64>::new(3)
            .map_err(|err| format!("Failed to create histogram: {}", err))?;
        Ok(Self { hist, sum_ms: 0 })
    }

    /// Record a latency reported in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be recorded.
    pub fn record(&mut self, latency_ms: f64) -> Result<(), String> {
        let clamped = if latency_ms.is_finite() {
            latency_ms.max(0.0)
        } else {
            0.0
        };
        let rounded = clamped.round() as u64;
        self.hist
            .record(rounded.max(1))
            .map_err(|err| format!("Failed to record latency: {}", err))?;
        self.sum_ms = self.sum_ms.saturating_add(rounded);
        Ok(())
    }

    #[must_use]
    pub fn quantile(&self, quantile: f64) -> u64 {
        if self.count() == 0 {
            return 0;
        }
        self.hist.value_at_quantile(quantile)
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    /// Sum of recorded latencies, rounded to whole milliseconds.
    #[must_use]
    pub const fn sum_ms(&self) -> u64 {
        self.sum_ms
    }
}
