use ndarray::Array2;

pub struct MatrixHelper;

impl MatrixHelper {
    /// Stacks window rows into a 2D array, truncating every row to the shortest one.
    pub fn from_rows(rows: &[Vec<f64>]) -> Array2<f64> {
        let width = rows.iter().map(Vec::len).min().unwrap_or(0);
        let flat: Vec<f64> = rows
            .iter()
            .flat_map(|row| row.iter().take(width).copied())
            .collect();
        Array2::from_shape_vec((rows.len(), width), flat).unwrap_or_else(|_| Array2::zeros((0, 0)))
    }

    /// Applies `reduce` to every column, i.e. element-wise across the window.
    pub fn reduce_columns<F>(matrix: &Array2<f64>, reduce: F) -> Vec<f64>
    where
        F: Fn(&[f64]) -> f64,
    {
        matrix
            .columns()
            .into_iter()
            .map(|column| reduce(&column.to_vec()))
            .collect()
    }
}
