use std::sync::Mutex;

use tracing::trace;

use crate::buffers::fixed_buffer::FixedBuf;
use crate::error::TunnelError;

/// A pool of buffers for messages bigger than a single fragment - on the send side to hold a
///  message while its fragments trickle out, on the receive side to reassemble one.
///
/// Buffers come in power-of-two size classes of the fragment size, so a returned buffer can
///  be reused for any message that fits its class. The number of big buffers in flight is
///  capped; acquisition beyond the cap fails with the same transient error as frame buffer
///  exhaustion.
pub struct BigBufferPool {
    base_size: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// free list per size class, index n holds buffers of `base_size << n`
    free: Vec<Vec<FixedBuf>>,
    outstanding: usize,
    max_outstanding: usize,
}

impl BigBufferPool {
    pub fn new(base_size: usize, max_outstanding: usize) -> Self {
        assert!(base_size > 0);
        BigBufferPool {
            base_size,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                outstanding: 0,
                max_outstanding,
            }),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding
    }

    fn size_class(&self, len: usize) -> usize {
        let mut class = 0;
        while (self.base_size << class) < len {
            class += 1;
        }
        class
    }

    pub fn try_get(&self, len: usize) -> Result<FixedBuf, TunnelError> {
        let class = self.size_class(len);

        let mut state = self.state.lock().unwrap();
        if state.outstanding == state.max_outstanding {
            return Err(TunnelError::BuffersExhausted);
        }
        state.outstanding += 1;

        if let Some(free) = state.free.get_mut(class) {
            if let Some(buf) = free.pop() {
                trace!("returning big buffer of class {} from pool", class);
                return Ok(buf);
            }
        }

        trace!("creating big buffer of class {}", class);
        Ok(FixedBuf::new(self.base_size << class))
    }

    pub fn return_to_pool(&self, mut buf: FixedBuf) {
        let class = self.size_class(buf.capacity());
        assert_eq!(buf.capacity(), self.base_size << class,
                   "returned buffer does not match any size class");
        buf.clear();

        let mut state = self.state.lock().unwrap();
        debug_assert!(state.outstanding > 0);
        state.outstanding -= 1;
        while state.free.len() <= class {
            state.free.push(Vec::new());
        }
        state.free[class].push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::fits_base(100, 100)]
    #[case::below_base(1, 100)]
    #[case::just_above(101, 200)]
    #[case::two_classes_up(350, 400)]
    fn test_size_classes(#[case] requested: usize, #[case] expected_capacity: usize) {
        let pool = BigBufferPool::new(100, 4);
        assert_eq!(pool.try_get(requested).unwrap().capacity(), expected_capacity);
    }

    #[test]
    fn test_reuse_within_class() {
        let pool = BigBufferPool::new(100, 4);

        let buf = pool.try_get(150).unwrap();
        pool.return_to_pool(buf);
        assert_eq!(pool.outstanding(), 0);

        // anything that maps to the same class reuses the pooled buffer
        assert_eq!(pool.try_get(101).unwrap().capacity(), 200);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let pool = BigBufferPool::new(100, 1);

        let buf = pool.try_get(100).unwrap();
        assert!(matches!(pool.try_get(100), Err(TunnelError::BuffersExhausted)));

        pool.return_to_pool(buf);
        assert!(pool.try_get(100).is_ok());
    }
}
