
/// Sliding window over the `N` most recent signed samples (e.g. clock offset errors in µs),
///  keeping running sums so that mean and standard deviation are cheap to query.
pub struct RollingData<const N: usize> {
    buf: BufferImpl<N>,
    cached_sum: i64,
    cached_square_sum: i64,
}
impl<const N: usize> RollingData<N> {
    pub fn new() -> Self {
        assert!(N > 0);

        RollingData {
            buf: BufferImpl::new(),
            cached_sum: 0,
            cached_square_sum: 0,
        }
    }

    pub fn add_value(&mut self, value: i32) {
        if let Some(evicted) = self.buf.add_value(value) {
            self.cached_sum -= evicted as i64;
            self.cached_square_sum -= (evicted as i64) * (evicted as i64);
        }

        self.cached_sum += value as i64;
        self.cached_square_sum += (value as i64) * (value as i64);
    }

    pub fn len(&self) -> usize {
        self.buf.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.buf = BufferImpl::new();
        self.cached_sum = 0;
        self.cached_square_sum = 0;
    }

    /// mean value, rounded towards zero - 0 for an empty window
    pub fn mean(&self) -> i32 {
        if self.is_empty() {
            return 0;
        }
        (self.cached_sum / self.len() as i64) as i32
    }

    pub fn std_dev(&self) -> f64 {
        if self.len() < 2 {
            // pragmatic value that serves the purpose of standard deviation in this context
            return 0.0;
        }

        let n = self.len() as f64;
        let mean = self.cached_sum as f64 / n;
        let diff_of_squares = self.cached_square_sum as f64 - mean * mean * n;

        (diff_of_squares.max(0.0) / (n - 1.0)).sqrt()
    }

    /// the sample with the smallest magnitude
    pub fn best(&self) -> Option<i32> {
        self.buf.values().iter()
            .copied()
            .min_by_key(|v| v.unsigned_abs())
    }
}

impl<const N: usize> Default for RollingData<N> {
    fn default() -> Self {
        Self::new()
    }
}


enum BufferImpl<const N: usize> {
    Growing(Vec<i32>),
    Ring {
        buf: Vec<i32>,
        next: usize,
    },
}
impl <const N: usize> BufferImpl<N> {
    fn new() -> BufferImpl<N> {
        BufferImpl::Growing(Vec::with_capacity(N))
    }

    fn values(&self) -> &[i32] {
        match self {
            BufferImpl::Growing(buf) => buf,
            BufferImpl::Ring { buf, .. } => buf,
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: i32) -> Option<i32> {
        match self {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}
