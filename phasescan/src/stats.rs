//! Averaging for repeated monitor reads

/// Mean and population standard deviation of a set of reads
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadStats {
    /// Arithmetic mean
    pub mean: f64,
    /// Population standard deviation (divides by N)
    pub rms: f64,
}

impl ReadStats {
    /// Compute statistics, or `None` for an empty slice
    pub fn from_reads(reads: &[f64]) -> Option<Self> {
        if reads.is_empty() {
            return None;
        }
        let n = reads.len() as f64;
        let mean = reads.iter().sum::<f64>() / n;
        let variance = reads.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            rms: variance.sqrt(),
        })
    }
}
