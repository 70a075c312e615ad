//! The compute context phases are dispatched on: a dedicated thread pool, and the prime table
//! used to size the spatial hash.

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{capacity::MAX_SPECKS, error::SimError, util};

pub struct ComputeContext {
    pub pool: ThreadPool,
    /// Every prime up to twice the speck capacity, ascending.
    pub primes: Vec<u32>,
}

impl ComputeContext {
    /// `threads`: `None` lets Rayon pick, usually one per logical core.
    pub fn new(threads: Option<usize>) -> Result<Self, SimError> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("speck-worker-{i}"));
        if let Some(t) = threads {
            builder = builder.num_threads(t);
        }

        let pool = builder
            .build()
            .map_err(|e| SimError::Device(format!("Unable to build the thread pool: {e}")))?;

        Ok(Self {
            pool,
            primes: util::sieve_primes(MAX_SPECKS as u32 * 2),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_prime_table() {
        let ctx = ComputeContext::new(Some(2)).unwrap();
        assert_eq!(ctx.thread_count(), 2);
        assert_eq!(&ctx.primes[..4], &[2, 3, 5, 7]);
        assert!(util::first_prime_above(&ctx.primes, MAX_SPECKS).is_some());
    }
}
