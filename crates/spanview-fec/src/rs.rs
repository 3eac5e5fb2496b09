//! Systematic Reed–Solomon erasure codec over equal-length byte shards.
//!
//! The generator matrix is the `(k+m)×k` Vandermonde matrix transformed to
//! systematic form by right-multiplying with the inverse of its top `k×k`
//! block, so the first `k` rows reproduce the data shards untouched.

use crate::error::FecError;
use crate::gf256::Gf256;

/// Maximum total shard count (data + parity).
pub const MAX_SHARDS: usize = 255;

/// Row-major matrix over GF(2⁸).
#[derive(Clone)]
struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    fn zero(rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: vec![0; rows * cols] }
    }

    fn identity(n: usize) -> Self {
        let mut m = Self::zero(n, n);
        for i in 0..n {
            m.set(i, i, 1);
        }
        m
    }

    fn vandermonde(gf: &Gf256, rows: usize, cols: usize) -> Self {
        let mut m = Self::zero(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                m.set(r, c, gf.pow(r as u8, c));
            }
        }
        m
    }

    #[inline]
    fn get(&self, r: usize, c: usize) -> u8 {
        self.data[r * self.cols + c]
    }

    #[inline]
    fn set(&mut self, r: usize, c: usize, v: u8) {
        self.data[r * self.cols + c] = v;
    }

    fn row(&self, r: usize) -> &[u8] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    fn mul(&self, gf: &Gf256, rhs: &Matrix) -> Matrix {
        debug_assert_eq!(self.cols, rhs.rows);
        let mut out = Matrix::zero(self.rows, rhs.cols);
        for r in 0..self.rows {
            for c in 0..rhs.cols {
                let mut acc = 0u8;
                for i in 0..self.cols {
                    acc ^= gf.mul(self.get(r, i), rhs.get(i, c));
                }
                out.set(r, c, acc);
            }
        }
        out
    }

    /// Gauss–Jordan inversion. Fails with `Singular` when no pivot exists.
    fn invert(&self, gf: &Gf256) -> Result<Matrix, FecError> {
        debug_assert_eq!(self.rows, self.cols);
        let n = self.rows;
        let mut work = self.clone();
        let mut out = Matrix::identity(n);

        for col in 0..n {
            // Find a pivot row at or below the diagonal.
            let pivot = (col..n)
                .find(|&r| work.get(r, col) != 0)
                .ok_or(FecError::Singular)?;
            if pivot != col {
                for c in 0..n {
                    let (a, b) = (work.get(col, c), work.get(pivot, c));
                    work.set(col, c, b);
                    work.set(pivot, c, a);
                    let (a, b) = (out.get(col, c), out.get(pivot, c));
                    out.set(col, c, b);
                    out.set(pivot, c, a);
                }
            }

            // Scale the pivot row to 1.
            let scale = gf.inv(work.get(col, col));
            for c in 0..n {
                work.set(col, c, gf.mul(work.get(col, c), scale));
                out.set(col, c, gf.mul(out.get(col, c), scale));
            }

            // Eliminate the column everywhere else.
            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = work.get(r, col);
                if factor == 0 {
                    continue;
                }
                for c in 0..n {
                    let w = work.get(r, c) ^ gf.mul(factor, work.get(col, c));
                    work.set(r, c, w);
                    let o = out.get(r, c) ^ gf.mul(factor, out.get(col, c));
                    out.set(r, c, o);
                }
            }
        }

        Ok(out)
    }
}

/// Reed–Solomon codec for a fixed `(data_shards, parity_shards)` geometry.
pub struct ReedSolomon {
    data_shards: usize,
    parity_shards: usize,
    gf: Gf256,
    /// Systematic generator, `(k+m)×k`: identity on top, parity rows below.
    matrix: Matrix,
}

impl ReedSolomon {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, FecError> {
        if data_shards == 0
            || parity_shards == 0
            || data_shards + parity_shards > MAX_SHARDS
        {
            return Err(FecError::InvalidShardCount { data: data_shards, parity: parity_shards });
        }

        let gf = Gf256::new();
        let total = data_shards + parity_shards;
        let vandermonde = Matrix::vandermonde(&gf, total, data_shards);

        // Top k×k block of a Vandermonde matrix over distinct points is
        // always invertible.
        let mut top = Matrix::zero(data_shards, data_shards);
        for r in 0..data_shards {
            for c in 0..data_shards {
                top.set(r, c, vandermonde.get(r, c));
            }
        }
        let matrix = vandermonde.mul(&gf, &top.invert(&gf)?);

        Ok(Self { data_shards, parity_shards, gf, matrix })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Compute the parity shards. `shards[..k]` must hold the data;
    /// `shards[k..]` are overwritten. All shards must share one length.
    pub fn encode(&self, shards: &mut [Vec<u8>]) -> Result<(), FecError> {
        self.check_geometry(shards)?;
        let len = shards[0].len();

        for p in 0..self.parity_shards {
            let row = self.matrix.row(self.data_shards + p).to_vec();
            let mut parity = vec![0u8; len];
            for (c, coeff) in row.iter().copied().enumerate() {
                if coeff == 0 {
                    continue;
                }
                let data = &shards[c];
                for (out, &byte) in parity.iter_mut().zip(data.iter()) {
                    *out ^= self.gf.mul(coeff, byte);
                }
            }
            shards[self.data_shards + p] = parity;
        }

        Ok(())
    }

    /// Reconstruct every missing shard in place. `present[i]` marks shard
    /// `i` as intact; at least `k` shards must be present. Missing entries
    /// of `shards` are overwritten (their previous contents are ignored).
    pub fn reconstruct(&self, shards: &mut [Vec<u8>], present: &[bool]) -> Result<(), FecError> {
        if shards.len() != self.total_shards() || present.len() != shards.len() {
            return Err(FecError::InvalidShardCount {
                data: self.data_shards,
                parity: self.parity_shards,
            });
        }

        let available = present.iter().filter(|&&p| p).count();
        if available < self.data_shards {
            return Err(FecError::TooFewShards { present: available, needed: self.data_shards });
        }
        if present.iter().all(|&p| p) {
            return Ok(());
        }

        let len = shards
            .iter()
            .zip(present)
            .find(|(_, &p)| p)
            .map(|(s, _)| s.len())
            .unwrap_or(0);
        for (shard, &p) in shards.iter().zip(present) {
            if p && shard.len() != len {
                return Err(FecError::ShardSizeMismatch);
            }
        }

        // Solve for the data from the first k present rows.
        let mut sub = Matrix::zero(self.data_shards, self.data_shards);
        let mut sources: Vec<usize> = Vec::with_capacity(self.data_shards);
        for (idx, &p) in present.iter().enumerate() {
            if !p {
                continue;
            }
            let r = sources.len();
            for c in 0..self.data_shards {
                sub.set(r, c, self.matrix.get(idx, c));
            }
            sources.push(idx);
            if sources.len() == self.data_shards {
                break;
            }
        }
        let decode = sub.invert(&self.gf)?;

        // Recover missing data shards.
        for d in 0..self.data_shards {
            if present[d] {
                continue;
            }
            let mut out = vec![0u8; len];
            for (c, &src) in sources.iter().enumerate() {
                let coeff = decode.get(d, c);
                if coeff == 0 {
                    continue;
                }
                for (o, &byte) in out.iter_mut().zip(shards[src].iter()) {
                    *o ^= self.gf.mul(coeff, byte);
                }
            }
            shards[d] = out;
        }

        // Re-encode any missing parity rows from the (now complete) data.
        for p in 0..self.parity_shards {
            let idx = self.data_shards + p;
            if present[idx] {
                continue;
            }
            let mut out = vec![0u8; len];
            for c in 0..self.data_shards {
                let coeff = self.matrix.get(idx, c);
                if coeff == 0 {
                    continue;
                }
                for (o, &byte) in out.iter_mut().zip(shards[c].iter()) {
                    *o ^= self.gf.mul(coeff, byte);
                }
            }
            shards[idx] = out;
        }

        Ok(())
    }

    fn check_geometry(&self, shards: &[Vec<u8>]) -> Result<(), FecError> {
        if shards.len() != self.total_shards() {
            return Err(FecError::InvalidShardCount {
                data: self.data_shards,
                parity: self.parity_shards,
            });
        }
        let len = shards[0].len();
        for shard in &shards[..self.data_shards] {
            if shard.len() != len {
                return Err(FecError::ShardSizeMismatch);
            }
        }
        Ok(())
    }
}
