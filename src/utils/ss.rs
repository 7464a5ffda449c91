use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Column statistics (count, mean, population variance) accumulated one row
/// at a time, and the standard scaler built on them.
#[derive(Debug, Clone)]
pub struct StreamStatistic {
    num_items: usize,
    mean: Array1<f64>,
    sum_squares: Array1<f64>,
}

impl StreamStatistic {
    pub fn new(n_features: usize) -> Self {
        StreamStatistic {
            num_items: 0,
            mean: Array1::zeros(n_features),
            sum_squares: Array1::zeros(n_features),
        }
    }

    /// Update with one row.
    pub fn update(&mut self, x: ArrayView1<f64>) {
        self.num_items += 1;
        let n = self.num_items as f64;
        for (index, &item) in x.iter().enumerate() {
            let old_mean = self.mean[index];
            self.mean[index] = old_mean + (item - old_mean) / n;
            self.sum_squares[index] += (item - old_mean) * (item - self.mean[index]);
        }
    }

    pub fn count(&self) -> usize {
        self.num_items
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn var(&self) -> Array1<f64> {
        if self.num_items == 0 {
            return Array1::zeros(self.mean.len());
        }
        &self.sum_squares / self.num_items as f64
    }

    pub fn std(&self) -> Array1<f64> {
        self.var().mapv(f64::sqrt)
    }
}

/// Zero-mean, unit-variance scaling fitted on one matrix.
#[derive(Debug, Clone)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(x: ArrayView2<f64>) -> Self {
        let mut stats = StreamStatistic::new(x.ncols());
        for row in x.axis_iter(Axis(0)) {
            stats.update(row);
        }
        // A constant column keeps scale 1 so it maps to zeros.
        let scale = stats
            .std()
            .mapv(|s| if s.abs() < 10.0 * f64::EPSILON { 1.0 } else { s });
        StandardScaler {
            mean: stats.mean().clone(),
            scale,
        }
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut out = x.to_owned();
        for mut row in out.axis_iter_mut(Axis(0)) {
            row -= &self.mean;
            row /= &self.scale;
        }
        out
    }

    pub fn fit_transform(x: ArrayView2<f64>) -> Array2<f64> {
        Self::fit(x).transform(x)
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }
}
