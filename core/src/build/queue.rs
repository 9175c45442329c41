use parking_lot::{Condvar, Mutex};
use std::{collections::VecDeque, time::Duration};

/// Messages from build threads to the thread scheduling them.
#[derive(Debug)]
pub struct Queue<T> {
  items: Mutex<VecDeque<T>>,
  popper_cv: Condvar,
}

impl<T> Default for Queue<T> {
  fn default() -> Self {
    Self {
      items: Mutex::new(VecDeque::new()),
      popper_cv: Condvar::new(),
    }
  }
}

impl<T> Queue<T> {
  pub fn push(&self, item: T) {
    self.items.lock().push_back(item);
    self.popper_cv.notify_one();
  }

  /// Waits up to `timeout` for an item. May return `None` early.
  pub fn pop(&self, timeout: Duration) -> Option<T> {
    let mut items = self.items.lock();
    if items.is_empty() {
      self.popper_cv.wait_for(&mut items, timeout);
    }
    items.pop_front()
  }

  pub fn try_pop_all(&self) -> Vec<T> {
    self.items.lock().drain(..).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn test_pop_wakes_on_push() {
    let q = Arc::new(Queue::default());
    let q2 = q.clone();
    let t = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(20));
      q2.push(7);
    });
    let mut got = None;
    while got.is_none() {
      got = q.pop(Duration::from_secs(5));
    }
    assert_eq!(got, Some(7));
    t.join().unwrap();
    assert_eq!(q.pop(Duration::from_millis(1)), None);
  }

  #[test]
  fn test_try_pop_all() {
    let q = Queue::default();
    q.push(1);
    q.push(2);
    assert_eq!(q.try_pop_all(), vec![1, 2]);
    assert!(q.try_pop_all().is_empty());
  }
}
