//! In-process linear projection onto the top two principal components.
//!
//! Components come from power iteration on the covariance, applied implicitly
//! as `Xᵀ(Xv)` so the D×D matrix is never built. The start vectors are drawn
//! from a seeded RNG and each component's sign is fixed so that its largest
//! coordinate is positive, which makes the layout reproducible.

use super::Projector;
use crate::error::{PapermapError, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_ITERATIONS: usize = 500;
const TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct PcaProjector {
    seed: u64,
}

impl PcaProjector {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(v: &mut [f64]) -> f64 {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    norm
}

/// Remove the components of `v` along each of `basis` (assumed orthonormal).
fn orthogonalize(v: &mut [f64], basis: &[Vec<f64>]) {
    for b in basis {
        let proj = dot(v, b);
        v.iter_mut().zip(b).for_each(|(x, bi)| *x -= proj * bi);
    }
}

/// `Xᵀ X v` for the centered data `x`.
fn covariance_apply(x: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; v.len()];
    for row in x {
        let s = dot(row, v);
        out.iter_mut().zip(row).for_each(|(o, r)| *o += s * r);
    }
    out
}

/// Top `k` principal directions of centered data; zero vectors where the
/// data has no remaining variance.
fn principal_components(x: &[Vec<f64>], dim: usize, k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut components: Vec<Vec<f64>> = Vec::with_capacity(k);
    for _ in 0..k {
        let mut v: Vec<f64> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        orthogonalize(&mut v, &components);
        if normalize(&mut v) == 0.0 {
            components.push(vec![0.0; dim]);
            continue;
        }

        for _ in 0..MAX_ITERATIONS {
            let mut next = covariance_apply(x, &v);
            orthogonalize(&mut next, &components);
            if normalize(&mut next) == 0.0 {
                v = vec![0.0; dim];
                break;
            }
            let delta: f64 = next.iter().zip(&v).map(|(a, b)| (a - b).abs()).sum();
            v = next;
            if delta < TOLERANCE {
                break;
            }
        }

        if let Some(pivot) = v
            .iter()
            .copied()
            .max_by(|a, b| a.abs().total_cmp(&b.abs()))
            && pivot < 0.0
        {
            v.iter_mut().for_each(|c| *c = -*c);
        }
        components.push(v);
    }
    components
}

/// Project embeddings onto their top two principal components.
pub fn pca_2d(embeddings: &[Vec<f32>], seed: u64) -> Result<Vec<[f32; 2]>> {
    let Some(first) = embeddings.first() else {
        return Ok(Vec::new());
    };
    let dim = first.len();
    if let Some(bad) = embeddings.iter().position(|e| e.len() != dim) {
        return Err(PapermapError::projection(format!(
            "embedding {bad} has dimension {}, expected {dim}",
            embeddings[bad].len()
        )));
    }

    let n = embeddings.len() as f64;
    let mut mean = vec![0.0f64; dim];
    for e in embeddings {
        mean.iter_mut().zip(e).for_each(|(m, v)| *m += f64::from(*v) / n);
    }
    let centered: Vec<Vec<f64>> = embeddings
        .iter()
        .map(|e| e.iter().zip(&mean).map(|(v, m)| f64::from(*v) - m).collect())
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let components = principal_components(&centered, dim, 2, &mut rng);
    Ok(centered
        .iter()
        .map(|row| [dot(row, &components[0]) as f32, dot(row, &components[1]) as f32])
        .collect())
}

#[async_trait]
impl Projector for PcaProjector {
    fn method(&self) -> &str {
        "pca"
    }

    fn seed(&self) -> u64 {
        self.seed
    }

    async fn project(&self, embeddings: &[Vec<f32>]) -> Result<Vec<[f32; 2]>> {
        pca_2d(embeddings, self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_recovers_dominant_axis() {
        // Points spread along (1, 1, 0) with a little uncorrelated spread along z.
        let data: Vec<Vec<f32>> = (-5..=5)
            .map(|t| {
                let t = t as f32;
                vec![t, t, 0.1 * ((t * t) % 3.0)]
            })
            .collect();
        let coords = pca_2d(&data, 42).unwrap();
        assert_eq!(coords.len(), data.len());
        // First axis carries the line: x grows monotonically with t.
        for w in coords.windows(2) {
            assert!(w[1][0] > w[0][0]);
        }
        assert!(close(coords[10][0], 5.0 * 2f32.sqrt()));
    }

    #[test]
    fn test_same_seed_same_layout() {
        let data: Vec<Vec<f32>> = (0..20)
            .map(|i| {
                let i = i as f32;
                vec![i.sin(), i.cos(), (i * 0.3).sin(), i * 0.01]
            })
            .collect();
        let a = pca_2d(&data, 7).unwrap();
        let b = pca_2d(&data, 7).unwrap();
        for (p, q) in a.iter().zip(&b) {
            assert!(close(p[0], q[0]) && close(p[1], q[1]));
        }
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(pca_2d(&[], 1).unwrap().is_empty());
        assert_eq!(pca_2d(&[vec![3.0, 4.0]], 1).unwrap(), vec![[0.0, 0.0]]);
        let identical = vec![vec![1.0, 2.0]; 3];
        assert!(pca_2d(&identical, 1).unwrap().iter().all(|c| c == &[0.0, 0.0]));
        // One-dimensional embeddings have no second component.
        let line = vec![vec![1.0], vec![2.0], vec![3.0]];
        assert!(pca_2d(&line, 1).unwrap().iter().all(|c| c[1] == 0.0));
    }

    #[test]
    fn test_mixed_dimensions_rejected() {
        assert!(pca_2d(&[vec![1.0, 2.0], vec![1.0]], 1).is_err());
    }
}
