use std::sync::{
  atomic::{AtomicI32, Ordering},
  Mutex,
};

/// Per-type pool of spare message payloads.
///
/// In steady state every delivered payload is recycled and later reused via
/// `clone_from`, so a saturated pipeline stops allocating. The counters are
/// diagnostic only; recycling an item twice is the caller's bug and is not
/// detected here.
pub struct RecyclingPool<T> {
  spares: Mutex<Vec<T>>,
  outstanding: AtomicI32,
  soft_cap: usize,
}

const DEFAULT_SOFT_CAP: usize = 4096;

impl<T: Clone> RecyclingPool<T> {
  pub fn new() -> RecyclingPool<T> {
    RecyclingPool::with_capacity(DEFAULT_SOFT_CAP)
  }

  /// `soft_cap` bounds how many spares are retained; recycled items beyond
  /// it are simply dropped.
  pub fn with_capacity(soft_cap: usize) -> RecyclingPool<T> {
    RecyclingPool {
      spares: Mutex::new(Vec::new()),
      outstanding: AtomicI32::new(0),
      soft_cap,
    }
  }

  /// A copy of `data`, built into a recycled spare when one is available.
  pub fn take_clone(&self, data: &T) -> T {
    self.outstanding.fetch_add(1, Ordering::Relaxed);
    match self.spares.lock().unwrap().pop() {
      Some(mut spare) => {
        spare.clone_from(data);
        spare
      }
      None => data.clone(),
    }
  }

  /// An item from the pool, or a fresh one from `factory`.
  pub fn get_or_create(&self, factory: impl FnOnce() -> T) -> T {
    self.outstanding.fetch_add(1, Ordering::Relaxed);
    match self.spares.lock().unwrap().pop() {
      Some(spare) => spare,
      None => factory(),
    }
  }

  /// Returns an item to the pool. The caller guarantees no outstanding
  /// alias.
  pub fn recycle(&self, item: T) {
    self.outstanding.fetch_sub(1, Ordering::Relaxed);
    let mut spares = self.spares.lock().unwrap();
    if spares.len() < self.soft_cap {
      spares.push(item);
    }
  }

  pub fn outstanding(&self) -> i32 {
    self.outstanding.load(Ordering::Relaxed)
  }

  pub fn available(&self) -> usize {
    self.spares.lock().unwrap().len()
  }
}

impl<T: Clone> Default for RecyclingPool<T> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn take_clone_reuses_spares() {
    let pool: RecyclingPool<Vec<u8>> = RecyclingPool::new();
    let a = pool.take_clone(&vec![1, 2, 3]);
    assert_eq!(pool.outstanding(), 1);
    pool.recycle(a);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.available(), 1);

    let b = pool.take_clone(&vec![4, 5]);
    assert_eq!(b, vec![4, 5]);
    assert_eq!(pool.available(), 0); // the spare was reused
    pool.recycle(b);
  }

  #[test]
  fn soft_cap_bounds_spares() {
    let pool: RecyclingPool<u32> = RecyclingPool::with_capacity(2);
    for _ in 0..5 {
      let item = pool.get_or_create(|| 7);
      pool.recycle(item);
    }
    assert!(pool.available() <= 2);
  }
}
