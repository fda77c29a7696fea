#[cfg(test)]
mod digest_test;

/// Upper bound on clusters kept after a merge pass.
pub const MAX_MERGED_CLUSTERS: usize = 200;
/// Singleton clusters buffered between merge passes.
pub const MAX_UNMERGED_CLUSTERS: usize = 50;

const MAX_CLUSTERS: usize = MAX_MERGED_CLUSTERS + MAX_UNMERGED_CLUSTERS;
const MERGE_RETRY_LIMIT: u32 = 5;
/// Output positions on each tail whose clusters stay singletons, keeping
/// the extreme percentiles sharp.
const TAIL_CLUSTERS: usize = MAX_MERGED_CLUSTERS * 2 / 100;

#[derive(Debug, Copy, Clone)]
struct Cluster {
    mean: f64,
    sum: f64,
    samples: u64,
}

impl Cluster {
    fn singleton(value: f64) -> Self {
        Cluster {
            mean: value,
            sum: value,
            samples: 1,
        }
    }

    fn absorb(&mut self, other: &Cluster) {
        self.sum += other.sum;
        self.samples += other.samples;
        self.mean = self.sum / self.samples as f64;
    }
}

/// Streaming percentile estimator with bounded memory.
///
/// Samples are appended as singleton clusters; once the buffer fills, a
/// merge pass sorts by mean and absorbs neighbours under a triangular
/// per-position limit, so cluster resolution is highest at the tails.
#[derive(Debug)]
pub struct TDigest {
    clusters: Vec<Cluster>,
    merged: usize,
    total_samples: u64,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        TDigest::new()
    }
}

impl TDigest {
    pub fn new() -> Self {
        TDigest {
            clusters: Vec::with_capacity(MAX_CLUSTERS),
            merged: 0,
            total_samples: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn count(&self) -> u64 {
        self.total_samples
    }

    pub fn min(&self) -> Option<f64> {
        (self.total_samples > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.total_samples > 0).then_some(self.max)
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn reset(&mut self) {
        self.clusters.clear();
        self.merged = 0;
        self.total_samples = 0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
    }

    pub fn add(&mut self, value: f64) {
        self.total_samples += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.clusters.push(Cluster::singleton(value));
        if self.clusters.len() >= MAX_CLUSTERS {
            self.merge();
        }
    }

    /// Percentile in `[0, 100]`; `None` until a sample has been added.
    ///
    /// 0 and 100 return the tracked global minimum and maximum exactly;
    /// everything in between interpolates linearly between cluster
    /// midpoints.
    pub fn percentile(&mut self, p: f64) -> Option<f64> {
        if self.total_samples == 0 {
            return None;
        }
        if p <= 0.0 {
            return Some(self.min);
        }
        if p >= 100.0 {
            return Some(self.max);
        }

        self.merge();

        let total = self.total_samples as f64;
        let target = p / 100.0 * total;

        let mut cum = 0.0;
        let mut prev_position = 0.0;
        let mut prev_mean = self.min;
        for cluster in &self.clusters[..self.merged] {
            let mid = cum + cluster.samples as f64 / 2.0;
            if target <= mid {
                let span = mid - prev_position;
                let frac = if span > 0.0 {
                    (target - prev_position) / span
                } else {
                    1.0
                };
                return Some(prev_mean + frac * (cluster.mean - prev_mean));
            }
            cum += cluster.samples as f64;
            prev_position = mid;
            prev_mean = cluster.mean;
        }

        let span = total - prev_position;
        let frac = if span > 0.0 {
            (target - prev_position) / span
        } else {
            1.0
        };
        Some(prev_mean + frac * (self.max - prev_mean))
    }

    /// Consolidates every pending singleton into the merged prefix.
    fn merge(&mut self) {
        if self.clusters.len() == self.merged {
            return;
        }

        self.clusters
            .sort_unstable_by(|a, b| a.mean.total_cmp(&b.mean));

        for fail_count in 0..MERGE_RETRY_LIMIT {
            if let Some(out) = Self::try_merge(&self.clusters, self.total_samples, fail_count) {
                self.merged = out.len();
                self.clusters = out;
                return;
            }
        }

        // Should be unreachable: the relaxed limits grow linearly with the
        // retry count while the input stays fixed.
        log::error!(
            "latency digest failed to merge {} clusters after {} attempts",
            self.clusters.len(),
            MERGE_RETRY_LIMIT
        );
        self.clusters.truncate(MAX_MERGED_CLUSTERS);
        self.merged = self.clusters.len();
    }

    fn try_merge(input: &[Cluster], total_samples: u64, fail_count: u32) -> Option<Vec<Cluster>> {
        let mut out: Vec<Cluster> = Vec::with_capacity(MAX_MERGED_CLUSTERS);
        for cluster in input {
            let index = out.len().saturating_sub(1);
            if let Some(current) = out.last_mut() {
                let limit = Self::cluster_limit(index, total_samples, fail_count);
                if current.samples + cluster.samples <= limit {
                    current.absorb(cluster);
                    continue;
                }
            }
            if out.len() == MAX_MERGED_CLUSTERS {
                return None;
            }
            out.push(*cluster);
        }
        Some(out)
    }

    /// Triangular approximation of the t-digest scale function: generous in
    /// the middle, pinned to singletons on the outer 2% of each tail.
    fn cluster_limit(index: usize, total_samples: u64, fail_count: u32) -> u64 {
        if index < TAIL_CLUSTERS || index >= MAX_MERGED_CLUSTERS - TAIL_CLUSTERS {
            return 1;
        }
        let tri = (index + 1).min(MAX_MERGED_CLUSTERS - index) as f64;
        let limit = (4.0 * total_samples as f64 * f64::from(fail_count + 1) * tri
            / (MAX_MERGED_CLUSTERS * MAX_MERGED_CLUSTERS) as f64)
            .ceil() as u64;
        limit.max(1)
    }
}
