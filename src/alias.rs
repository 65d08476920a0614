//! Walker alias table for O(1) discrete sampling.
//!
//! Built in O(n) from non-negative weights with the small/large worklist
//! construction; `draw` returns index `i` with probability `w_i / sum(w)`.
//! Weights only need proportionality, and zero-weight entries are never
//! returned.

use rand::Rng;

use crate::errinput;
use crate::error::Result;

/// An alias table over a fixed weight vector.
#[derive(Debug, Clone)]
pub struct Alias {
    prob: Vec<f64>,
    alias: Vec<usize>,
}

impl Alias {
    /// Build the table. Fails on an empty weight vector, a negative weight,
    /// or a non-positive total.
    pub fn new(weights: &[f64]) -> Result<Self> {
        if weights.is_empty() {
            return Err(errinput!("alias table requires at least one weight"));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(errinput!("alias weights must be finite and non-negative"));
        }
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(errinput!("alias table requires a positive total weight"));
        }

        let n = weights.len();
        let mut scaled: Vec<f64> = weights.iter().map(|w| w * n as f64 / total).collect();
        let mut prob = vec![1.0; n];
        let mut alias: Vec<usize> = (0..n).collect();

        let mut small = Vec::new();
        let mut large = Vec::new();
        for (i, &s) in scaled.iter().enumerate() {
            if s < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while let (Some(s), Some(l)) = (small.pop(), large.pop()) {
            prob[s] = scaled[s];
            alias[s] = l;
            // Move the donor's leftover mass back onto a worklist.
            scaled[l] = (scaled[l] + scaled[s]) - 1.0;
            if scaled[l] < 1.0 {
                small.push(l);
            } else {
                large.push(l);
            }
        }

        // Leftover entries hold probability 1 up to float rounding.
        Ok(Self { prob, alias })
    }

    /// Draw an index in O(1).
    pub fn draw<R: Rng>(&self, rng: &mut R) -> usize {
        let i = rng.gen_range(0..self.prob.len());
        if rng.gen::<f64>() < self.prob[i] {
            i
        } else {
            self.alias[i]
        }
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.prob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prob.is_empty()
    }
}
