//! Entropy reductions over small statevectors.
//!
//! Qubit order is little-endian: bit `q` of a basis index is qubit `q`.

use nalgebra::{DMatrix, SymmetricEigen};
use num_complex::Complex64;

/// Eigenvalues at or below this are treated as numerical noise.
pub const EIGEN_CUTOFF: f64 = 1e-12;

/// Square complex matrix, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct CMatrix {
    pub dim: usize,
    pub data: Vec<Complex64>,
}

impl CMatrix {
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            data: vec![Complex64::new(0.0, 0.0); dim * dim],
        }
    }

    pub fn get(&self, row: usize, col: usize) -> Complex64 {
        self.data[row * self.dim + col]
    }

    fn add_at(&mut self, row: usize, col: usize, v: Complex64) {
        self.data[row * self.dim + col] += v;
    }

    pub fn trace(&self) -> Complex64 {
        (0..self.dim).map(|i| self.get(i, i)).sum()
    }
}

/// `|psi><psi|`.
pub fn density_matrix(state: &[Complex64]) -> CMatrix {
    let dim = state.len();
    let mut rho = CMatrix::zeros(dim);
    for i in 0..dim {
        for j in 0..dim {
            rho.data[i * dim + j] = state[i] * state[j].conj();
        }
    }
    rho
}

/// Reduced density matrix of the qubits in `keep`, tracing out the rest.
/// `keep[0]` becomes bit 0 of the reduced index. Indices outside
/// `0..n_qubits` and repeats are ignored.
pub fn partial_trace(state: &[Complex64], n_qubits: usize, keep: &[usize]) -> CMatrix {
    let mut kept: Vec<usize> = Vec::new();
    for q in keep {
        if *q < n_qubits && !kept.contains(q) {
            kept.push(*q);
        }
    }
    let traced: Vec<usize> = (0..n_qubits).filter(|q| !kept.contains(q)).collect();
    let dim_a = 1usize << kept.len();
    let dim_b = 1usize << traced.len();

    let mut blocks = vec![Complex64::new(0.0, 0.0); dim_a * dim_b];
    for (idx, amp) in state.iter().enumerate().take(1usize << n_qubits) {
        let a = gather_bits(idx, &kept);
        let b = gather_bits(idx, &traced);
        blocks[b * dim_a + a] = *amp;
    }

    let mut rho = CMatrix::zeros(dim_a);
    for b in 0..dim_b {
        let row = &blocks[b * dim_a..(b + 1) * dim_a];
        for i in 0..dim_a {
            for j in 0..dim_a {
                rho.add_at(i, j, row[i] * row[j].conj());
            }
        }
    }
    rho
}

fn gather_bits(index: usize, qubits: &[usize]) -> usize {
    qubits
        .iter()
        .enumerate()
        .fold(0, |acc, (pos, q)| acc | (((index >> q) & 1) << pos))
}

/// Eigenvalues of a Hermitian matrix, descending.
///
/// Decomposes the real-symmetric embedding `[[Re, -Im], [Im, Re]]`, whose
/// spectrum is the Hermitian spectrum with every value doubled.
pub fn hermitian_eigenvalues(m: &CMatrix) -> Vec<f64> {
    let n = m.dim;
    if n == 0 {
        return Vec::new();
    }
    let embedded = DMatrix::from_fn(2 * n, 2 * n, |r, c| {
        let z = m.get(r % n, c % n);
        match (r < n, c < n) {
            (true, true) | (false, false) => z.re,
            (true, false) => -z.im,
            (false, true) => z.im,
        }
    });
    let mut eig: Vec<f64> = SymmetricEigen::new(embedded)
        .eigenvalues
        .iter()
        .copied()
        .collect();
    eig.sort_by(|x, y| y.total_cmp(x));
    eig.into_iter().step_by(2).collect()
}

/// `-sum p log2 p` over eigenvalues above [`EIGEN_CUTOFF`].
pub fn von_neumann_entropy(rho: &CMatrix) -> f64 {
    let s: f64 = hermitian_eigenvalues(rho)
        .into_iter()
        .filter(|p| *p > EIGEN_CUTOFF)
        .map(|p| -p * p.log2())
        .sum();
    s.max(0.0)
}

pub fn entanglement_entropy(state: &[Complex64], n_qubits: usize, subset: &[usize]) -> f64 {
    von_neumann_entropy(&partial_trace(state, n_qubits, subset))
}

/// `S(A) + S(B) - S(AB)`.
pub fn mutual_information(state: &[Complex64], n_qubits: usize, a: &[usize], b: &[usize]) -> f64 {
    let mut ab: Vec<usize> = a.iter().chain(b).copied().collect();
    ab.sort_unstable();
    ab.dedup();
    entanglement_entropy(state, n_qubits, a) + entanglement_entropy(state, n_qubits, b)
        - entanglement_entropy(state, n_qubits, &ab)
}

/// Shannon entropy in bits of a (not necessarily normalized) weight vector.
pub fn shannon_entropy(weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if total <= 0.0 {
        return 0.0;
    }
    weights
        .iter()
        .filter(|w| **w > 0.0)
        .map(|w| {
            let p = w / total;
            -p * p.log2()
        })
        .sum()
}
