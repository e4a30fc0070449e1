//! Metaparameters: per-source count scales and per-order discount
//! constants, their file format, and the reparameterization that maps an
//! unconstrained vector onto the feasible region.

use crate::error::{Error, Result};
use itertools::Itertools;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// The four discount constants of one order, strictly ordered
/// 1 > D1 > D2 > D3 > D4 > 0.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Discounts {
    /// Discount slope for counts up to 1.
    pub d1: f64,
    /// Discount slope for counts in (1, 2].
    pub d2: f64,
    /// Discount slope for counts in (2, 3].
    pub d3: f64,
    /// Discount slope for counts above 3.
    pub d4: f64,
}

/// A full metaparameter assignment: K count scales and N−1 discount
/// quadruples (orders 2..=N). The same shape doubles as the container for
/// derivatives w.r.t. each metaparameter.
#[derive(Clone, Debug, PartialEq)]
pub struct Metaparams {
    /// `scales[n - 1]` scales training source n.
    pub scales: Vec<f64>,
    /// `discounts[o - 2]` holds the constants of order o.
    pub discounts: Vec<Discounts>,
}

impl Metaparams {
    /// Number of training sources K.
    #[must_use]
    pub fn num_train_sets(&self) -> usize {
        self.scales.len()
    }

    /// The n-gram order N.
    #[must_use]
    pub fn order(&self) -> usize {
        self.discounts.len() + 1
    }

    /// Dimension of the flat vector: K + 4·(N−1).
    #[must_use]
    pub fn dim(&self) -> usize {
        self.scales.len() + 4 * self.discounts.len()
    }

    /// Flattens in file order: scales, then D1..D4 per order.
    #[must_use]
    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = self.scales.clone();
        for d in &self.discounts {
            flat.extend_from_slice(&[d.d1, d.d2, d.d3, d.d4]);
        }
        flat
    }

    /// Inverse of [`Metaparams::to_flat`].
    ///
    /// # Panics
    ///
    /// Panics if `flat.len() != num_train_sets + 4 * (order - 1)`.
    #[must_use]
    pub fn from_flat(flat: &[f64], num_train_sets: usize, order: usize) -> Self {
        assert_eq!(flat.len(), num_train_sets + 4 * (order - 1));
        let scales = flat[..num_train_sets].to_vec();
        let discounts = flat[num_train_sets..]
            .chunks_exact(4)
            .map(|c| Discounts { d1: c[0], d2: c[1], d3: c[2], d4: c[3] })
            .collect();
        Self { scales, discounts }
    }

    /// Default starting point: all source weights at 0.5 (or the supplied
    /// per-source weights), made unique and centered in (0, 1), and the
    /// usual modified Kneser-Ney constants per order.
    #[must_use]
    pub fn initialize(num_train_sets: usize, order: usize, weights: Option<&[f64]>) -> Self {
        let mut scales = match weights {
            Some(w) => w.to_vec(),
            None => vec![0.5; num_train_sets],
        };
        // ties would make the derivative backpropagation arbitrary
        let mut seen: Vec<f64> = Vec::new();
        for w in &mut scales {
            let mut value = *w;
            while seen.iter().any(|&s| s == value) {
                value += 0.01;
            }
            seen.push(value);
            *w = value;
        }
        let min = scales.iter().copied().fold(f64::INFINITY, f64::min);
        if min < 0.01 {
            for w in &mut scales {
                *w += 0.01 - min;
            }
        }
        let min = scales.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scales.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        // place min and max at equal distances from the ends of (0, 1)
        let scale = 1.0 / (min + max);
        for w in &mut scales {
            *w *= scale;
        }
        Self {
            scales,
            discounts: vec![Discounts { d1: 0.8, d2: 0.4, d3: 0.2, d4: 0.1 }; order - 1],
        }
    }

    /// Checks feasibility: scales in (0, 1), discounts strictly ordered
    /// 1 > D1 > D2 > D3 > D4 > 0.
    #[must_use]
    pub fn is_feasible(&self) -> bool {
        self.scales.iter().all(|&s| s > 0.0 && s < 1.0)
            && self.discounts.iter().all(|d| {
                1.0 > d.d1 && d.d1 > d.d2 && d.d2 > d.d3 && d.d3 > d.d4 && d.d4 > 0.0
            })
    }

    /// Asserts feasibility. The reparameterization makes every optimizer
    /// point feasible, so a failure here is an internal error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InfeasibleMetaparameters`] when violated.
    pub fn check_feasible(&self) -> Result<()> {
        if self.is_feasible() {
            Ok(())
        } else {
            Err(Error::InfeasibleMetaparameters(format!("{self:?}")))
        }
    }

    /// The `name` column of the file format, in order.
    fn names(num_train_sets: usize, order: usize) -> Vec<String> {
        let mut names: Vec<String> =
            (1..=num_train_sets).map(|n| format!("count_scale_{n}")).collect();
        for o in 2..=order {
            for k in 1..=4 {
                names.push(format!("order{o}_D{k}"));
            }
        }
        names
    }

    /// Writes the metaparameters file: one `name value` line per entry with
    /// 15 decimal digits. Values are floored and ceilinged a hair inside
    /// (0, 1) so the printed form can never break the reparameterization.
    ///
    /// # Errors
    ///
    /// Fails on I/O trouble.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut floors = vec![1.0e-10; self.scales.len()];
        let mut ceilings = vec![1.0 - 1.0e-6; self.scales.len()];
        for _ in &self.discounts {
            floors.extend_from_slice(&[1.0e-10, 1.0e-11, 1.0e-12, 1.0e-13]);
            // ceilings distinct from 1 and from each other in single precision
            ceilings.extend_from_slice(&[
                1.0 - 0.25e-5,
                1.0 - 0.5e-5,
                1.0 - 0.75e-5,
                1.0 - 1.0e-5,
            ]);
        }
        let names = Self::names(self.num_train_sets(), self.order());
        let mut writer = BufWriter::new(File::create(path)?);
        for (((name, value), floor), ceiling) in
            names.iter().zip_eq(self.to_flat()).zip_eq(floors).zip_eq(ceilings)
        {
            writeln!(writer, "{name} {:.15}", value.clamp(floor, ceiling))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Writes a derivative vector in the same format, full precision and
    /// without the floors.
    ///
    /// # Errors
    ///
    /// Fails on I/O trouble.
    pub fn write_derivs(&self, path: &Path) -> Result<()> {
        let names = Self::names(self.num_train_sets(), self.order());
        let mut writer = BufWriter::new(File::create(path)?);
        for (name, value) in names.iter().zip_eq(self.to_flat()) {
            writeln!(writer, "{name} {value}")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a metaparameters (or derivatives) file, checking the names and
    /// the field count.
    ///
    /// # Errors
    ///
    /// Fails if the file does not have exactly the expected lines.
    pub fn read(path: &Path, num_train_sets: usize, order: usize) -> Result<Self> {
        let names = Self::names(num_train_sets, order);
        let reader = BufReader::new(File::open(path)?);
        let mut flat = Vec::with_capacity(names.len());
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let name = fields
                .next()
                .ok_or_else(|| Error::malformed(path, format!("empty line {}", i + 1)))?;
            let value: f64 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| Error::malformed(path, format!("bad value on line {}", i + 1)))?;
            if fields.next().is_some() {
                return Err(Error::malformed(path, format!("trailing fields on line {}", i + 1)));
            }
            if i >= names.len() || name != names[i] {
                return Err(Error::malformed(
                    path,
                    format!("unexpected field {name:?} on line {}", i + 1),
                ));
            }
            flat.push(value);
        }
        if flat.len() != names.len() {
            return Err(Error::malformed(
                path,
                format!("expected {} fields, found {}", names.len(), flat.len()),
            ));
        }
        Ok(Self::from_flat(&flat, num_train_sets, order))
    }

    /// Reads and validates a metaparameters file (a derivatives file would
    /// fail the feasibility check).
    ///
    /// # Errors
    ///
    /// Fails as [`Metaparams::read`], or with [`Error::InputMalformed`] if
    /// the values are infeasible.
    pub fn read_validated(path: &Path, num_train_sets: usize, order: usize) -> Result<Self> {
        let params = Self::read(path, num_train_sets, order)?;
        if !params.is_feasible() {
            return Err(Error::malformed(
                path,
                "metaparameters are infeasible; scales must lie in (0,1) and discounts must \
                 satisfy 1 > D1 > D2 > D3 > D4 > 0",
            ));
        }
        Ok(params)
    }
}

/// Numerically safe logistic sigmoid.
#[must_use]
pub fn sigmoid(x: f64) -> f64 {
    if x > 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (e + 1.0)
    }
}

/// Inverse sigmoid, saturating at ±100 for inputs rounded to 0 or 1.
#[must_use]
pub fn logit(y: f64) -> f64 {
    if y == 0.0 {
        log::warn!("logit of 0, saturating at -100");
        -100.0
    } else if y == 1.0 {
        log::warn!("logit of 1, saturating at 100");
        100.0
    } else {
        (y / (1.0 - y)).ln()
    }
}

/// Maps an unconstrained vector to the feasible region. Scales go through
/// the sigmoid; each order's discounts are cumulative products of sigmoids,
/// which yields the strict ordering by construction.
///
/// # Panics
///
/// Panics if `x.len() != num_train_sets + 4 * (order - 1)`.
#[must_use]
pub fn unconstrained_to_constrained(x: &[f64], num_train_sets: usize, order: usize) -> Metaparams {
    assert_eq!(x.len(), num_train_sets + 4 * (order - 1));
    let scales = x[..num_train_sets].iter().map(|&v| sigmoid(v)).collect();
    let discounts = x[num_train_sets..]
        .chunks_exact(4)
        .map(|c| {
            let s1 = sigmoid(c[0]);
            let s2 = sigmoid(c[1]);
            let s3 = sigmoid(c[2]);
            let s4 = sigmoid(c[3]);
            Discounts { d1: s1, d2: s1 * s2, d3: s1 * s2 * s3, d4: s1 * s2 * s3 * s4 }
        })
        .collect();
    Metaparams { scales, discounts }
}

/// Maps constrained metaparameters back to the unconstrained space.
#[must_use]
pub fn constrained_to_unconstrained(y: &Metaparams) -> Vec<f64> {
    backprop_to_unconstrained(y, None).0
}

/// As [`constrained_to_unconstrained`], also transforming a derivative
/// vector df/dy (given in the constrained space, same shape as `y`) into
/// df/dx.
#[must_use]
pub fn backprop_to_unconstrained(
    y: &Metaparams,
    df_dy: Option<&Metaparams>,
) -> (Vec<f64>, Vec<f64>) {
    let mut x = Vec::with_capacity(y.dim());
    let mut df_dx = Vec::with_capacity(y.dim());
    let zeros = Discounts { d1: 0.0, d2: 0.0, d3: 0.0, d4: 0.0 };
    for (i, &s) in y.scales.iter().enumerate() {
        x.push(logit(s));
        let g = df_dy.map_or(0.0, |d| d.scales[i]);
        df_dx.push(g * s * (1.0 - s));
    }
    for (i, d) in y.discounts.iter().enumerate() {
        let g = df_dy.map_or(zeros, |dd| dd.discounts[i]);
        let s1 = d.d1;
        let s2 = d.d2 / d.d1;
        let s3 = d.d3 / d.d2;
        let s4 = d.d4 / d.d3;
        // backprop through d1 = s1, d2 = s1 s2, d3 = s1 s2 s3, d4 = s1 s2 s3 s4
        let df_ds1 = g.d1 + g.d2 * s2 + g.d3 * s2 * s3 + g.d4 * s2 * s3 * s4;
        let df_ds2 = g.d2 * s1 + g.d3 * s1 * s3 + g.d4 * s1 * s3 * s4;
        let df_ds3 = g.d3 * s1 * s2 + g.d4 * s1 * s2 * s4;
        let df_ds4 = g.d4 * s1 * s2 * s3;
        x.extend_from_slice(&[logit(s1), logit(s2), logit(s3), logit(s4)]);
        df_dx.push(df_ds1 * s1 * (1.0 - s1));
        df_dx.push(df_ds2 * s2 * (1.0 - s2));
        df_dx.push(df_ds3 * s3 * (1.0 - s3));
        df_dx.push(df_ds4 * s4 * (1.0 - s4));
    }
    (x, df_dx)
}
