use crate::*;
use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::{Duration, Instant},
};

const POLL: Duration = Duration::from_millis(25);

/// A flag shared by a request and the work done on its behalf.
#[derive(Clone, Debug, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  pub fn check(&self) -> Result<()> {
    if self.is_cancelled() {
      Err(Error::Cancelled.into())
    } else {
      Ok(())
    }
  }

  /// Sleeps for `duration`, returning `Cancelled` as soon as the flag is set.
  /// A duration past what the clock can represent sleeps until cancelled.
  pub fn sleep(&self, duration: Duration) -> Result<()> {
    let deadline = Instant::now().checked_add(duration);
    loop {
      self.check()?;
      let step = match deadline {
        Some(deadline) => {
          let now = Instant::now();
          if now >= deadline {
            return Ok(());
          }
          POLL.min(deadline - now)
        }
        None => POLL,
      };
      std::thread::sleep(step);
    }
  }
}
