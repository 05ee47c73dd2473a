//! Non-negative least squares by the Lawson-Hanson active set method
use nalgebra::{DMatrix, DVector};
use tracing::warn;

const EPSILON: f64 = 1e-12;

fn least_squares(a: &DMatrix<f64>, b: &DVector<f64>, passive: &[bool]) -> Option<DVector<f64>> {
    let columns: Vec<usize> = (0..a.ncols()).filter(|j| passive[*j]).collect();
    let sub = DMatrix::from_fn(a.nrows(), columns.len(), |i, j| a[(i, columns[j])]);
    let solution = sub.svd(true, true).solve(b, EPSILON).ok()?;
    let mut z = DVector::zeros(a.ncols());
    for (k, j) in columns.iter().enumerate() {
        z[*j] = solution[k];
    }
    Some(z)
}

/// Solve `min ||a x - b||` subject to `x >= 0`
pub fn nnls(a: &DMatrix<f64>, b: &DVector<f64>) -> DVector<f64> {
    let n = a.ncols();
    let mut x = DVector::zeros(n);
    if n == 0 || a.nrows() == 0 {
        return x;
    }
    let mut passive = vec![false; n];
    let mut gradient = a.transpose() * (b - a * &x);
    let max_iterations = 3 * n + 30;

    for _ in 0..max_iterations {
        let next = (0..n)
            .filter(|j| !passive[*j] && gradient[*j] > EPSILON)
            .max_by(|i, j| gradient[*i].total_cmp(&gradient[*j]));
        let Some(next) = next else {
            break;
        };
        passive[next] = true;

        let mut inner = 0;
        loop {
            inner += 1;
            let Some(z) = least_squares(a, b, &passive) else {
                warn!("Least squares subproblem failed to solve");
                return x;
            };
            if (0..n).filter(|j| passive[*j]).all(|j| z[j] > EPSILON) {
                x = z;
                break;
            }
            let alpha = (0..n)
                .filter(|j| passive[*j] && z[*j] <= EPSILON)
                .map(|j| x[j] / (x[j] - z[j]))
                .fold(f64::INFINITY, f64::min);
            x = &x + (z - &x) * alpha;
            for j in 0..n {
                if passive[j] && x[j] <= EPSILON {
                    passive[j] = false;
                    x[j] = 0.0;
                }
            }
            if inner > max_iterations {
                break;
            }
        }
        gradient = a.transpose() * (b - a * &x);
    }
    x
}
