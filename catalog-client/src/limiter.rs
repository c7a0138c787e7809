use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterOptions {
    /// Starting ceiling, never exceeded.
    pub initial: usize,
    /// Floor the ceiling is never lowered below.
    pub min: usize,
    /// How much one quiet window raises the ceiling.
    pub step: usize,
    /// Quiet period after the last 429 before the ceiling is raised.
    pub window: Duration,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            initial: 50,
            min: 10,
            step: 5,
            window: Duration::from_secs(60),
        }
    }
}

impl LimiterOptions {
    fn normalized(self) -> Self {
        let initial = self.initial.max(1);
        Self {
            initial,
            min: self.min.clamp(1, initial),
            step: self.step.max(1),
            window: self.window,
        }
    }
}

struct State {
    in_flight: usize,
    ceiling: usize,
    hits: u32,
    last_hit: Option<Instant>,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

struct Inner {
    options: LimiterOptions,
    state: Mutex<State>,
}

/// Concurrency gate whose ceiling shrinks on throttling and grows back after
/// quiet windows. Waiters are served strictly in arrival order.
#[derive(Clone)]
pub struct AdaptiveLimiter {
    inner: Arc<Inner>,
}

/// One in-flight slot. The slot is handed to the next waiter on drop.
pub struct Permit {
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh(&self, state: &mut State, now: Instant) {
        let Some(last_hit) = state.last_hit else {
            return;
        };
        let LimiterOptions {
            initial,
            step,
            window,
            ..
        } = self.options;
        if state.ceiling >= initial {
            state.hits = 0;
            state.last_hit = None;
            return;
        }
        let elapsed = now.saturating_duration_since(last_hit);
        let windows = if window.is_zero() {
            initial
        } else {
            (elapsed.as_nanos() / window.as_nanos()).min(initial as u128) as usize
        };
        if windows == 0 {
            return;
        }
        let ceiling = state
            .ceiling
            .saturating_add(windows.saturating_mul(step))
            .min(initial);
        log::info!("Catalog concurrency ceiling raised {} -> {ceiling}", state.ceiling);
        state.ceiling = ceiling;
        if ceiling >= initial {
            state.hits = 0;
            state.last_hit = None;
        } else {
            state.last_hit = Some(last_hit + window * windows as u32);
        }
    }

    fn throttled(&self, state: &mut State, now: Instant) {
        let LimiterOptions { initial, min, .. } = self.options;
        state.hits = state.hits.saturating_add(1);
        let divisor = 1.0 + f64::from(state.hits.min(5)) * 0.5;
        let target = ((initial as f64 / divisor).floor() as usize).max(min);
        if target < state.ceiling {
            log::warn!(
                "Catalog throttled us ({} hits), ceiling {} -> {target}",
                state.hits,
                state.ceiling
            );
            state.ceiling = target;
        }
        state.last_hit = Some(now);
    }

    /// Pops as many live waiters as the ceiling allows, reserving a slot for
    /// each. The caller must deliver the slots after releasing the lock.
    fn take_ready(&self, state: &mut State) -> Vec<oneshot::Sender<Permit>> {
        state.waiters.retain(|w| !w.is_closed());
        let mut ready = vec![];
        while state.in_flight < state.ceiling {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    state.in_flight += 1;
                    ready.push(waiter);
                }
                None => break,
            }
        }
        ready
    }

    fn release(self: &Arc<Self>) {
        let ready = {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            self.refresh(&mut state, Instant::now());
            self.take_ready(&mut state)
        };
        self.hand_over(ready);
    }

    fn hand_over(self: &Arc<Self>, ready: Vec<oneshot::Sender<Permit>>) {
        for waiter in ready {
            // a waiter that already gave up returns the permit, and dropping
            // it passes the slot on
            let _ = waiter.send(Permit {
                inner: self.clone(),
            });
        }
    }
}

impl AdaptiveLimiter {
    pub fn new(options: LimiterOptions) -> Self {
        let options = options.normalized();
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(State {
                    in_flight: 0,
                    ceiling: options.initial,
                    hits: 0,
                    last_hit: None,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub async fn acquire(&self) -> Permit {
        loop {
            let (ready, rx) = {
                let mut state = self.inner.lock();
                self.inner.refresh(&mut state, Instant::now());
                let ready = self.inner.take_ready(&mut state);
                if state.in_flight < state.ceiling {
                    state.in_flight += 1;
                    drop(state);
                    self.inner.hand_over(ready);
                    return Permit {
                        inner: self.inner.clone(),
                    };
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                (ready, rx)
            };
            self.inner.hand_over(ready);
            if let Ok(permit) = rx.await {
                return permit;
            }
        }
    }

    /// Registers a 429 response.
    pub fn record_throttled(&self) {
        self.record_throttled_at(Instant::now());
    }

    pub(crate) fn record_throttled_at(&self, now: Instant) {
        let mut state = self.inner.lock();
        self.inner.throttled(&mut state, now);
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling_at(Instant::now())
    }

    pub(crate) fn ceiling_at(&self, now: Instant) -> usize {
        let (ceiling, ready) = {
            let mut state = self.inner.lock();
            self.inner.refresh(&mut state, now);
            let ready = self.inner.take_ready(&mut state);
            (state.ceiling, ready)
        };
        self.inner.hand_over(ready);
        ceiling
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn limiter(initial: usize) -> AdaptiveLimiter {
        AdaptiveLimiter::new(LimiterOptions {
            initial,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn blocks_at_ceiling_until_release() {
        let limiter = AdaptiveLimiter::new(LimiterOptions {
            initial: 2,
            min: 1,
            ..Default::default()
        });
        let a = limiter.acquire().await;
        let _b = limiter.acquire().await;
        assert_eq!(limiter.in_flight(), 2);
        assert!(timeout(Duration::from_millis(20), limiter.acquire())
            .await
            .is_err());
        drop(a);
        let c = timeout(Duration::from_millis(100), limiter.acquire()).await;
        assert!(c.is_ok());
        assert_eq!(limiter.in_flight(), 2);
    }

    #[tokio::test]
    async fn serves_waiters_in_arrival_order() {
        let limiter = AdaptiveLimiter::new(LimiterOptions {
            initial: 1,
            min: 1,
            ..Default::default()
        });
        let held = limiter.acquire().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..3 {
            let limiter = limiter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = limiter.acquire().await;
                let _ = tx.send(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(permit);
            });
            while limiter.queued() < i + 1 {
                tokio::task::yield_now().await;
            }
        }
        drop(held);
        let mut order = vec![];
        for _ in 0..3 {
            order.push(rx.recv().await.expect("waiter finished"));
        }
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_slot() {
        let limiter = AdaptiveLimiter::new(LimiterOptions {
            initial: 1,
            min: 1,
            ..Default::default()
        });
        let held = limiter.acquire().await;
        assert!(timeout(Duration::from_millis(10), limiter.acquire())
            .await
            .is_err());
        drop(held);
        assert_eq!(limiter.in_flight(), 0);
        assert!(timeout(Duration::from_millis(50), limiter.acquire())
            .await
            .is_ok());
    }

    #[test]
    fn throttling_shrinks_ceiling_multiplicatively() {
        let limiter = limiter(50);
        let now = Instant::now();
        assert_eq!(limiter.ceiling_at(now), 50);
        let expected = [33, 25, 20, 16, 14, 14];
        for want in expected {
            limiter.record_throttled_at(now);
            assert_eq!(limiter.ceiling_at(now), want);
        }
    }

    #[test]
    fn ceiling_never_drops_below_minimum() {
        let limiter = AdaptiveLimiter::new(LimiterOptions {
            initial: 20,
            min: 10,
            ..Default::default()
        });
        let now = Instant::now();
        for _ in 0..10 {
            limiter.record_throttled_at(now);
        }
        assert_eq!(limiter.ceiling_at(now), 10);
    }

    #[test]
    fn recovers_one_step_per_quiet_window() {
        let limiter = limiter(50);
        let t0 = Instant::now();
        limiter.record_throttled_at(t0);
        assert_eq!(limiter.ceiling_at(t0 + Duration::from_secs(59)), 33);
        assert_eq!(limiter.ceiling_at(t0 + Duration::from_secs(60)), 38);
        assert_eq!(limiter.ceiling_at(t0 + Duration::from_secs(119)), 38);
        assert_eq!(limiter.ceiling_at(t0 + Duration::from_secs(240)), 50);
        // the hit counter starts over once fully recovered
        limiter.record_throttled_at(t0 + Duration::from_secs(241));
        assert_eq!(limiter.ceiling_at(t0 + Duration::from_secs(241)), 33);
    }

    #[test]
    fn new_hit_restarts_the_window() {
        let limiter = limiter(50);
        let t0 = Instant::now();
        limiter.record_throttled_at(t0);
        limiter.record_throttled_at(t0 + Duration::from_secs(50));
        assert_eq!(limiter.ceiling_at(t0 + Duration::from_secs(100)), 25);
        assert_eq!(limiter.ceiling_at(t0 + Duration::from_secs(110)), 30);
    }
}
