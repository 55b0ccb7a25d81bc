use serde::{Deserialize, Serialize};

/// Row-major dense matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self { rows, cols, data }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// `self * v`; `v` must have `cols` entries.
    pub fn mul_vec(&self, v: &[f64]) -> Vec<f64> {
        (0..self.rows)
            .map(|r| self.row(r).iter().zip(v).map(|(a, b)| a * b).sum())
            .collect()
    }
}

/// Snapshot of an agent's mutable parameters at one point in simulated time.
///
/// Snapshots own their arrays; restoring one into an agent copies them again,
/// so two agents restored from the same snapshot never share storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternState {
    pub internal_state: Vec<f64>,
    pub self_model_state: Vec<f64>,
    pub w: Matrix,
    pub w_sm: Matrix,
}

impl PatternState {
    /// All arrays concatenated in the fixed order internal, self-model, W, W_sm.
    pub fn flatten(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(
            self.internal_state.len()
                + self.self_model_state.len()
                + self.w.data.len()
                + self.w_sm.data.len(),
        );
        out.extend_from_slice(&self.internal_state);
        out.extend_from_slice(&self.self_model_state);
        out.extend_from_slice(&self.w.data);
        out.extend_from_slice(&self.w_sm.data);
        out
    }

    /// Same shapes, every entry zero.
    pub fn zeroed_like(&self) -> Self {
        Self {
            internal_state: vec![0.0; self.internal_state.len()],
            self_model_state: vec![0.0; self.self_model_state.len()],
            w: Matrix::zeros(self.w.rows, self.w.cols),
            w_sm: Matrix::zeros(self.w_sm.rows, self.w_sm.cols),
        }
    }

    /// Applies `f` to every scalar, producing a new snapshot.
    pub fn map(&self, mut f: impl FnMut(f64) -> f64) -> Self {
        Self {
            internal_state: self.internal_state.iter().map(|v| f(*v)).collect(),
            self_model_state: self.self_model_state.iter().map(|v| f(*v)).collect(),
            w: Matrix {
                rows: self.w.rows,
                cols: self.w.cols,
                data: self.w.data.iter().map(|v| f(*v)).collect(),
            },
            w_sm: Matrix {
                rows: self.w_sm.rows,
                cols: self.w_sm.cols,
                data: self.w_sm.data.iter().map(|v| f(*v)).collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_follows_field_order() {
        let state = PatternState {
            internal_state: vec![1.0],
            self_model_state: vec![2.0],
            w: Matrix::from_fn(1, 2, |_, c| 3.0 + c as f64),
            w_sm: Matrix::from_fn(1, 1, |_, _| 5.0),
        };
        assert_eq!(state.flatten(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(state.zeroed_like().flatten().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn mul_vec_is_row_major() {
        let m = Matrix::from_fn(2, 2, |r, c| (r * 2 + c) as f64);
        assert_eq!(m.mul_vec(&[1.0, 1.0]), vec![1.0, 5.0]);
    }
}
