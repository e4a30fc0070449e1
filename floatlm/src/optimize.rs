//! The metaparameter optimization driver: wires the estimation pipeline
//! into the BFGS minimizer through the reparameterization, persists every
//! evaluation under an increasing iteration id, and supports warm starts
//! from a previous run's result.

use crate::bfgs::{minimize, BfgsOptions};
use crate::count::TrainingCounts;
use crate::error::{Error, Result};
use crate::metaparams::{
    backprop_to_unconstrained, constrained_to_unconstrained, unconstrained_to_constrained,
    Metaparams,
};
use crate::pipeline::objf_and_derivs;
use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Optimization knobs.
#[derive(Clone, Debug)]
pub struct OptimizerConfig {
    /// Gradient-norm termination tolerance, in the unconstrained space.
    pub gradient_tolerance: f64,
    /// Amortized objective-progress termination tolerance.
    pub progress_tolerance: f64,
    /// Shards for the underlying pipeline runs.
    pub num_shards: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            gradient_tolerance: 1.25e-4,
            progress_tolerance: 1.0e-6,
            num_shards: 1,
        }
    }
}

/// What the optimizer settled on.
pub struct OptimizeOutcome {
    /// The optimized metaparameters.
    pub metaparams: Metaparams,
    /// Final inverse-Hessian approximation, for warm-starting later runs.
    pub inv_hessian: Array2<f64>,
    /// Dev log-probability per word at the starting point.
    pub initial_objf: f64,
    /// Dev log-probability per word at the final point.
    pub final_objf: f64,
    /// Number of pipeline evaluations spent.
    pub evaluations: usize,
}

/// Maximizes the dev-set log-probability per word over the metaparameters.
/// Every evaluation writes `<i>.metaparams`, `<i>.derivs` and `<i>.objf`
/// into `work_dir`; the result lands in `final.metaparams` and
/// `final.inv_hessian`. When `work_dir` still holds those files from an
/// earlier, partially finished run, evaluations whose metaparameters are
/// unchanged reuse the cached derivatives and objective instead of
/// rerunning the pipeline.
///
/// The `cancel` flag is checked at every evaluation boundary; raising it
/// aborts the run.
///
/// # Errors
///
/// Propagates pipeline errors; fails when cancelled or when a warm-start
/// Hessian has the wrong shape.
pub fn optimize(
    counts: &TrainingCounts,
    initial: &Metaparams,
    init_inv_hessian: Option<Array2<f64>>,
    work_dir: &Path,
    config: &OptimizerConfig,
    cancel: &AtomicBool,
) -> Result<OptimizeOutcome> {
    std::fs::create_dir_all(work_dir)?;
    // rewriting an identical file would bump its timestamp and defeat the
    // evaluation cache below
    write_metaparams_if_changed(&work_dir.join("0.metaparams"), initial)?;
    let x0 = Array1::from(constrained_to_unconstrained(initial));
    let num_train_sets = counts.num_train_sets;
    let order = counts.order;
    let mut iteration = 0_usize;
    let mut initial_objf = None;
    let evaluate = |x: &Array1<f64>| -> Result<(f64, Array1<f64>)> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::ResourceFailure("optimization cancelled".into()));
        }
        let y = unconstrained_to_constrained(x.as_slice().expect("contiguous"), num_train_sets, order);
        let metaparameter_file = work_dir.join(format!("{iteration}.metaparams"));
        let deriv_file = work_dir.join(format!("{iteration}.derivs"));
        let objf_file = work_dir.join(format!("{iteration}.objf"));
        let changed_or_new = write_metaparams_if_changed(&metaparameter_file, &y)?;
        let (objf, derivs) = if !changed_or_new
            && cached_evaluation_is_fresh(&metaparameter_file, &deriv_file, &objf_file)
        {
            log::info!(
                "reusing objective and derivatives from {} and {}, presumably \
                 rerunning after a partially finished run",
                objf_file.display(),
                deriv_file.display()
            );
            let derivs = Metaparams::read(&deriv_file, num_train_sets, order)?;
            (read_objf(&objf_file)?, derivs)
        } else {
            let result = objf_and_derivs(counts, &y, config.num_shards)?;
            result.derivs.write_derivs(&deriv_file)?;
            write_objf(&objf_file, result.objf)?;
            (result.objf, result.derivs)
        };
        iteration += 1;
        let (x2, df_dx) = backprop_to_unconstrained(&y, Some(&derivs));
        let drift: f64 = x
            .iter()
            .zip(&x2)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        if drift > 0.001 {
            log::warn!("reparameterization round trip drifted by {drift}");
        }
        log::info!(
            "evaluation {iteration}: objf {objf:.6}, deriv magnitude {:.6}",
            df_dx.iter().map(|d| d * d).sum::<f64>().sqrt()
        );
        if initial_objf.is_none() {
            initial_objf = Some(objf);
        }
        // minimization convention
        Ok((-objf, Array1::from(df_dx.into_iter().map(|d| -d).collect::<Vec<_>>())))
    };
    let options = BfgsOptions {
        gradient_tolerance: config.gradient_tolerance,
        progress_tolerance: config.progress_tolerance,
        progress_num_iters: 3,
        init_inv_hessian,
    };
    let outcome = minimize(x0, evaluate, |_| true, &options)?;
    let metaparams =
        unconstrained_to_constrained(outcome.x.as_slice().expect("contiguous"), num_train_sets, order);
    if metaparams.discounts.last().is_some_and(|d| d.d1 < 0.1) {
        log::warn!(
            "the top order's D1 optimized below 0.1; your dev set is probably \
             contained in your training data"
        );
    }
    metaparams.write(&work_dir.join("final.metaparams"))?;
    write_inv_hessian(&work_dir.join("final.inv_hessian"), &outcome.inv_hessian)?;
    let initial_objf = initial_objf.expect("at least one evaluation ran");
    let final_objf = -outcome.value;
    log::info!(
        "dev log-prob per word went from {initial_objf:.6} to {final_objf:.6} over \
         {} evaluations (perplexity {:.3} to {:.3})",
        outcome.evaluations,
        (-initial_objf).exp(),
        (-final_objf).exp()
    );
    Ok(OptimizeOutcome {
        metaparams,
        inv_hessian: outcome.inv_hessian,
        initial_objf,
        final_objf,
        evaluations: outcome.evaluations,
    })
}

/// Writes `params` to `path`, going through a sibling `.tmp` file, and
/// reports whether the file is new or its contents changed. An unchanged
/// file keeps its timestamp, which is what marks the cached evaluation
/// files as still valid.
fn write_metaparams_if_changed(path: &Path, params: &Metaparams) -> Result<bool> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    params.write(&tmp)?;
    if let Ok(old) = std::fs::read(path) {
        if old == std::fs::read(&tmp)? {
            std::fs::remove_file(&tmp)?;
            return Ok(false);
        }
    }
    std::fs::rename(&tmp, path)?;
    Ok(true)
}

/// Whether a previous run left derivative and objective files behind that
/// are newer than the metaparameters they were computed from.
fn cached_evaluation_is_fresh(metaparams: &Path, derivs: &Path, objf: &Path) -> bool {
    if !objf.exists() {
        return false;
    }
    match (std::fs::metadata(metaparams), std::fs::metadata(derivs)) {
        (Ok(m), Ok(d)) => match (m.modified(), d.modified()) {
            (Ok(m), Ok(d)) => d > m,
            _ => false,
        },
        _ => false,
    }
}

fn write_objf(path: &Path, objf: f64) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{objf}")?;
    writer.flush()?;
    Ok(())
}

/// Reads a one-number objective file written by an earlier evaluation.
///
/// # Errors
///
/// Fails unless the file holds exactly one float.
pub fn read_objf(path: &Path) -> Result<f64> {
    let mut line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut line)?;
    line.trim()
        .parse()
        .map_err(|_| Error::malformed(path, format!("expected one number, got {line:?}")))
}

/// Writes the inverse Hessian as ASCII, one row per line.
///
/// # Errors
///
/// Fails on I/O trouble.
pub fn write_inv_hessian(path: &Path, inv_hessian: &Array2<f64>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for row in inv_hessian.rows() {
        let line: Vec<String> = row.iter().map(|v| format!("{v:.17e}")).collect();
        writeln!(writer, "{}", line.join(" "))?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads a d-by-d inverse Hessian written by [`write_inv_hessian`].
///
/// # Errors
///
/// Fails if the file does not hold exactly `dim * dim` numbers.
pub fn read_inv_hessian(path: &Path, dim: usize) -> Result<Array2<f64>> {
    let reader = BufReader::new(File::open(path)?);
    let mut values = Vec::with_capacity(dim * dim);
    for line in reader.lines() {
        for token in line?.split_whitespace() {
            values.push(token.parse::<f64>().map_err(|_| {
                Error::malformed(path, format!("unparseable matrix entry {token:?}"))
            })?);
        }
    }
    if values.len() != dim * dim {
        return Err(Error::malformed(
            path,
            format!("expected a {dim}x{dim} matrix, found {} values", values.len()),
        ));
    }
    Array2::from_shape_vec((dim, dim), values)
        .map_err(|e| Error::malformed(path, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn inv_hessian_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("final.inv_hessian");
        let matrix =
            Array2::from_shape_fn((4, 4), |(i, j)| 1.0 / (1.0 + i as f64 + 2.0 * j as f64));
        write_inv_hessian(&path, &matrix).unwrap();
        let back = read_inv_hessian(&path, 4).unwrap();
        for (a, b) in matrix.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-15);
        }
        assert!(read_inv_hessian(&path, 5).is_err());
    }

    #[test]
    fn unchanged_metaparams_keep_their_file_and_cached_evaluation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("3.metaparams");
        let deriv_file = dir.path().join("3.derivs");
        let objf_file = dir.path().join("3.objf");
        let params = Metaparams::initialize(2, 3, None);
        assert!(write_metaparams_if_changed(&path, &params).unwrap());
        // nothing cached yet
        assert!(!cached_evaluation_is_fresh(&path, &deriv_file, &objf_file));
        // put the cached files clearly after the metaparams, coarse
        // filesystem timestamps included
        std::thread::sleep(std::time::Duration::from_millis(20));
        params.write_derivs(&deriv_file).unwrap();
        write_objf(&objf_file, -4.5).unwrap();
        // rewriting identical contents must not disturb the file
        assert!(!write_metaparams_if_changed(&path, &params).unwrap());
        assert!(cached_evaluation_is_fresh(&path, &deriv_file, &objf_file));
        assert_eq!(read_objf(&objf_file).unwrap(), -4.5);
        // a different point invalidates the cache
        let mut moved = params;
        moved.scales[0] = 0.25;
        assert!(write_metaparams_if_changed(&path, &moved).unwrap());
    }

    #[test]
    fn cancellation_aborts_before_evaluating() {
        let counts = crate::count::TrainingCounts {
            order: 2,
            num_train_sets: 1,
            num_words: 4,
            sources: vec![vec![vec![crate::count::IntCount {
                hist: vec![1],
                word: 4,
                count: 2,
            }]]],
            dev: vec![crate::count::IntCount { hist: vec![1], word: 4, count: 1 }],
        };
        let initial = Metaparams::initialize(1, 2, None);
        let dir = tempdir().unwrap();
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            optimize(&counts, &initial, None, dir.path(), &OptimizerConfig::default(), &cancel),
            Err(Error::ResourceFailure(_))
        ));
    }
}
