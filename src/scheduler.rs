use crate::errors::{AppError, AppResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Counting admission gate for child processes.
///
/// Waiters are served strictly first-in first-out: a released slot is handed
/// straight to the oldest waiter, so `active` is never decremented while
/// someone is queued and a fresh `acquire` cannot overtake them.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    state: Arc<Mutex<GateState>>,
    max: usize,
}

impl ConcurrencyGate {
    pub fn new(max: usize) -> AppResult<Self> {
        if max == 0 {
            return Err(AppError::Config(
                "Concurrency gate requires at least one slot".to_string(),
            ));
        }
        Ok(Self {
            state: Arc::new(Mutex::new(GateState::default())),
            max,
        })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    pub async fn acquire(&self) -> GatePermit {
        let receiver = {
            let mut state = self.lock();
            if state.active < self.max && state.waiters.is_empty() {
                state.active += 1;
                return GatePermit::new(self.clone());
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        let mut pending = PendingAcquire {
            gate: self,
            receiver: Some(receiver),
        };
        if let Some(receiver) = pending.receiver.as_mut() {
            // The sender is only dropped together with the gate state, which
            // this handle keeps alive, so an error here cannot happen.
            let _ = receiver.await;
        }
        pending.receiver = None;
        GatePermit::new(self.clone())
    }

    fn release_slot(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Returns a slot that was handed over to an `acquire` future dropped before
/// it could observe the hand-off.
struct PendingAcquire<'a> {
    gate: &'a ConcurrencyGate,
    receiver: Option<oneshot::Receiver<()>>,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if receiver.try_recv().is_ok() {
                self.gate.release_slot();
            }
        }
    }
}

/// One occupied slot. The slot is released exactly once, on [`GatePermit::release`]
/// or on drop, whichever comes first.
#[derive(Debug)]
pub struct GatePermit {
    gate: Option<ConcurrencyGate>,
}

impl GatePermit {
    fn new(gate: ConcurrencyGate) -> Self {
        Self { gate: Some(gate) }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release_slot();
        }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::ConcurrencyGate;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn zero_slots_are_rejected() {
        let err = ConcurrencyGate::new(0).expect_err("zero slots");
        assert!(err.to_string().contains("at least one slot"));
    }

    #[tokio::test]
    async fn never_exceeds_max() {
        let gate = ConcurrencyGate::new(2).expect("gate");
        let peak = Arc::new(Mutex::new(0usize));
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let gate = gate.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let permit = gate.acquire().await;
                {
                    let mut peak = peak.lock().expect("peak lock");
                    *peak = (*peak).max(gate.active());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(permit);
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        assert!(*peak.lock().expect("peak lock") <= 2);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn waiters_are_granted_in_fifo_order() {
        let gate = ConcurrencyGate::new(1).expect("gate");
        let held = gate.acquire().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for index in 0..3 {
            let task_gate = gate.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let permit = task_gate.acquire().await;
                order.lock().expect("order lock").push(index);
                tokio::time::sleep(Duration::from_millis(2)).await;
                permit.release();
            }));
            while gate.waiting() < index + 1 {
                tokio::task::yield_now().await;
            }
        }

        assert_eq!(gate.active(), 1);
        held.release();
        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2]);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn release_hands_slot_to_waiter_before_new_callers() {
        let gate = ConcurrencyGate::new(1).expect("gate");
        let held = gate.acquire().await;

        let waiter_gate = gate.clone();
        let waiter = tokio::spawn(async move { waiter_gate.acquire().await });
        while gate.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        held.release();
        assert_eq!(gate.active(), 1);
        assert_eq!(gate.waiting(), 0);

        let late = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(late.is_err(), "late caller jumped the queue");

        drop(waiter.await.expect("waiter"));
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_a_slot() {
        let gate = ConcurrencyGate::new(1).expect("gate");
        let held = gate.acquire().await;

        let abandoned = tokio::time::timeout(Duration::from_millis(10), gate.acquire()).await;
        assert!(abandoned.is_err());

        held.release();
        assert_eq!(gate.active(), 0);
        let again = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(again.is_ok());
    }
}
