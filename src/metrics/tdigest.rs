//! A bounded-memory percentile sketch over per-item latencies.
//!
//! This is a centroid-merging approximation of a t-digest: samples are
//! folded into weighted centroids, and once the centroid count exceeds
//! [`TDigest::MAX_CENTROIDS`] the two closest centroids are merged
//! repeatedly until back under the cap. Memory is therefore bounded by
//! `MAX_CENTROIDS` regardless of how many samples are inserted.

#[derive(Debug, Clone, Copy, PartialEq)]
struct Centroid {
    mean: f64,
    count: u64,
}

/// A streaming sketch supporting `insert`, `quantile`, and `merge`.
#[derive(Debug, Clone)]
pub struct TDigest {
    centroids: Vec<Centroid>,
    min: f64,
    max: f64,
    count: u64,
}

impl TDigest {
    /// Upper bound on the number of centroids retained, and thus the
    /// sketch's memory footprint.
    pub const MAX_CENTROIDS: usize = 100;

    /// Builds an empty sketch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            centroids: Vec::new(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0,
        }
    }

    /// Total number of samples ever inserted (including merged-away ones).
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Smallest sample seen.
    #[must_use]
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest sample seen.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Records one sample.
    pub fn insert(&mut self, sample: f64) {
        self.count += 1;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);

        let pos = self
            .centroids
            .partition_point(|c| c.mean < sample);
        self.centroids.insert(pos, Centroid { mean: sample, count: 1 });

        self.compress();
    }

    /// Merges another sketch's centroids into this one.
    pub fn merge(&mut self, other: &TDigest) {
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.centroids.extend_from_slice(&other.centroids);
        self.centroids.sort_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap());
        self.compress();
    }

    /// Estimates the value at quantile `q` (`0.0..=1.0`). Returns `None` for
    /// an empty sketch.
    #[must_use]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.centroids.is_empty() {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        let target = q * self.count as f64;

        let mut cumulative = 0.0;
        for (i, centroid) in self.centroids.iter().enumerate() {
            let next_cumulative = cumulative + centroid.count as f64;
            if target <= next_cumulative || i == self.centroids.len() - 1 {
                return Some(centroid.mean);
            }
            cumulative = next_cumulative;
        }
        self.centroids.last().map(|c| c.mean)
    }

    fn compress(&mut self) {
        while self.centroids.len() > Self::MAX_CENTROIDS {
            let mut closest_pair = 0;
            let mut closest_distance = f64::INFINITY;
            for i in 0..self.centroids.len() - 1 {
                let distance = self.centroids[i + 1].mean - self.centroids[i].mean;
                if distance < closest_distance {
                    closest_distance = distance;
                    closest_pair = i;
                }
            }
            let right = self.centroids.remove(closest_pair + 1);
            let left = &mut self.centroids[closest_pair];
            let total = left.count + right.count;
            left.mean = (left.mean * left.count as f64 + right.mean * right.count as f64) / total as f64;
            left.count = total;
        }
    }
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new()
    }
}
