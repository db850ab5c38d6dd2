use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::model::StepVector;

/// Free lists of step vectors and batches, owned by a single operator.
///
/// Buffers handed out by a pool should come back to the same pool once the
/// consumer is done with them; a buffer that is dropped instead is simply
/// freed.
#[derive(Debug)]
pub struct VectorPool {
    steps_batch: usize,
    /// Expected number of samples per step vector
    step_size: AtomicUsize,
    vectors: Mutex<Vec<Vec<StepVector>>>,
    step_vectors: Mutex<Vec<StepVector>>,
}

impl VectorPool {
    pub fn new(steps_batch: usize) -> Self {
        Self::with_size(steps_batch, 0)
    }

    pub fn with_size(steps_batch: usize, step_size: usize) -> Self {
        Self {
            steps_batch,
            step_size: AtomicUsize::new(step_size),
            vectors: Mutex::new(Vec::new()),
            step_vectors: Mutex::new(Vec::new()),
        }
    }

    /// Sets the capacity hint for new step vectors, usually the number of series.
    pub fn set_step_size(&self, step_size: usize) {
        self.step_size.store(step_size, Ordering::Relaxed);
    }

    /// Returns an empty batch with room for `steps_batch` step vectors.
    pub fn get_vector_batch(&self) -> Vec<StepVector> {
        self.vectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.steps_batch))
    }

    /// Takes back a batch. Any step vectors still inside it are recycled too.
    pub fn put_vectors(&self, mut vectors: Vec<StepVector>) {
        if !vectors.is_empty() {
            let mut free = self.step_vectors.lock().unwrap_or_else(PoisonError::into_inner);
            for mut sv in vectors.drain(..) {
                sv.clear();
                free.push(sv);
            }
        }
        self.vectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(vectors);
    }

    /// Returns an empty step vector for timestamp `t`.
    pub fn get_step_vector(&self, t: i64) -> StepVector {
        let recycled = self
            .step_vectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(mut sv) => {
                sv.t = t;
                sv
            }
            None => StepVector::with_capacity(t, self.step_size.load(Ordering::Relaxed)),
        }
    }

    pub fn put_step_vector(&self, mut sv: StepVector) {
        sv.clear();
        self.step_vectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_vectors_are_reused() {
        let pool = VectorPool::with_size(2, 8);
        let mut sv = pool.get_step_vector(10);
        assert_eq!(sv.t, 10);
        assert!(sv.samples.capacity() >= 8);
        sv.append_sample(0, 1.0);
        let ptr = sv.samples.as_ptr();

        pool.put_step_vector(sv);
        let sv = pool.get_step_vector(20);
        assert_eq!(sv.t, 20);
        assert!(sv.is_empty());
        assert_eq!(sv.samples.as_ptr(), ptr);
    }

    #[test]
    fn test_batches_are_reused_and_emptied() {
        let pool = VectorPool::new(3);
        let mut batch = pool.get_vector_batch();
        assert!(batch.capacity() >= 3);
        batch.push(pool.get_step_vector(0));
        pool.put_vectors(batch);

        let batch = pool.get_vector_batch();
        assert!(batch.is_empty());
        // The step vector left in the batch went back to the free list.
        let sv = pool.get_step_vector(5);
        assert_eq!(sv.t, 5);
    }
}
