//! 速率预算模块：按 (provider, model) 统计滑动窗口内的 Token 用量。
//!
//! # Rate Budget
//!
//! Trailing-window token accounting per `(provider_id, model_id)`. Each window is a ring
//! of fixed-width slots; a slot packs its epoch and token count into one `AtomicU64`, so
//! recording is a lock-free CAS loop and a stale slot is reset lazily by the next writer
//! that lands on it. Reads sum only slots whose epoch falls inside the window.
//!
//! The budget is an explicit instance shared as `Arc<RateBudget>` by the selector and the
//! dispatcher.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_SLOTS: usize = 60;
const TOKEN_BITS: u32 = 32;
const TOKEN_MASK: u64 = (1 << TOKEN_BITS) - 1;

fn pack(epoch: u64, tokens: u64) -> u64 {
    (epoch << TOKEN_BITS) | tokens.min(TOKEN_MASK)
}

fn unpack(word: u64) -> (u64, u64) {
    (word >> TOKEN_BITS, word & TOKEN_MASK)
}

#[derive(Debug)]
struct TokenWindow {
    slots: Box<[AtomicU64]>,
}

impl TokenWindow {
    fn new(slots: usize) -> Self {
        Self {
            // Epoch 0 is never current (epochs start at 1), so fresh slots read as empty.
            slots: (0..slots).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn record(&self, epoch: u64, tokens: u64) {
        let slot = &self.slots[(epoch % self.slots.len() as u64) as usize];
        let mut current = slot.load(Ordering::Acquire);
        loop {
            let (slot_epoch, count) = unpack(current);
            let next = if slot_epoch == epoch {
                pack(epoch, count.saturating_add(tokens))
            } else {
                pack(epoch, tokens)
            };
            match slot.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn sum(&self, epoch: u64) -> u64 {
        let span = self.slots.len() as u64;
        self.slots
            .iter()
            .map(|s| unpack(s.load(Ordering::Acquire)))
            .filter(|(e, _)| *e != 0 && *e <= epoch && epoch - *e < span)
            .map(|(_, t)| t)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BudgetKey {
    provider_id: String,
    model_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub provider_id: String,
    pub model_id: String,
    pub tokens_in_window: u64,
}

/// Sliding-window token usage per `(provider, model)`.
#[derive(Debug)]
pub struct RateBudget {
    origin: Instant,
    slot_width: Duration,
    slots: usize,
    windows: RwLock<HashMap<BudgetKey, Arc<TokenWindow>>>,
}

impl Default for RateBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl RateBudget {
    /// Sixty one-second slots.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW, DEFAULT_SLOTS)
    }

    pub fn with_window(window: Duration, slots: usize) -> Self {
        let slots = slots.max(1);
        let slot_width = (window / slots as u32).max(Duration::from_millis(1));
        Self {
            origin: Instant::now(),
            slot_width,
            slots,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.slot_width * self.slots as u32
    }

    fn epoch(&self) -> u64 {
        (self.origin.elapsed().as_nanos() / self.slot_width.as_nanos()) as u64 + 1
    }

    fn window_for(&self, provider_id: &str, model_id: &str) -> Arc<TokenWindow> {
        let key = BudgetKey {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
        };
        {
            let map = self.windows.read().unwrap_or_else(|e| e.into_inner());
            if let Some(w) = map.get(&key) {
                return Arc::clone(w);
            }
        }
        let mut map = self.windows.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(key)
                .or_insert_with(|| Arc::new(TokenWindow::new(self.slots))),
        )
    }

    /// Add tokens consumed by a completed (or failed but billed) call.
    pub fn record(&self, provider_id: &str, model_id: &str, tokens: u64) {
        if tokens == 0 {
            return;
        }
        self.window_for(provider_id, model_id).record(self.epoch(), tokens);
    }

    /// Tokens consumed in the trailing window.
    pub fn usage(&self, provider_id: &str, model_id: &str) -> u64 {
        let key = BudgetKey {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
        };
        let map = self.windows.read().unwrap_or_else(|e| e.into_inner());
        map.get(&key).map_or(0, |w| w.sum(self.epoch()))
    }

    /// Fraction of `declared_tpm` used in the trailing window. Unmetered (0) is never saturated.
    pub fn saturation(&self, provider_id: &str, model_id: &str, declared_tpm: u64) -> f64 {
        if declared_tpm == 0 {
            return 0.0;
        }
        self.usage(provider_id, model_id) as f64 / declared_tpm as f64
    }

    pub fn snapshot(&self) -> Vec<BudgetSnapshot> {
        let epoch = self.epoch();
        let map = self.windows.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<BudgetSnapshot> = map
            .iter()
            .map(|(k, w)| BudgetSnapshot {
                provider_id: k.provider_id.clone(),
                model_id: k.model_id.clone(),
                tokens_in_window: w.sum(epoch),
            })
            .collect();
        out.sort_by(|a, b| (&a.provider_id, &a.model_id).cmp(&(&b.provider_id, &b.model_id)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_saturation() {
        let budget = RateBudget::new();
        budget.record("groq", "llama", 600);
        budget.record("groq", "llama", 250);
        budget.record("groq", "mixtral", 10);
        assert_eq!(budget.usage("groq", "llama"), 850);
        assert!((budget.saturation("groq", "llama", 1000) - 0.85).abs() < 1e-9);
        assert_eq!(budget.saturation("groq", "llama", 0), 0.0);
        assert_eq!(budget.usage("openai", "llama"), 0);
    }

    #[test]
    fn test_window_expiry() {
        let budget = RateBudget::with_window(Duration::from_millis(100), 10);
        budget.record("p", "m", 500);
        assert_eq!(budget.usage("p", "m"), 500);
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(budget.usage("p", "m"), 0);
        budget.record("p", "m", 7);
        assert_eq!(budget.usage("p", "m"), 7);
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let budget = Arc::new(RateBudget::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&budget);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        b.record("p", "m", 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(budget.usage("p", "m"), 8000);
    }

    #[test]
    fn test_snapshot_sorted() {
        let budget = RateBudget::new();
        budget.record("b", "m", 1);
        budget.record("a", "m", 2);
        let snap = budget.snapshot();
        assert_eq!(snap[0].provider_id, "a");
        assert_eq!(snap[1].tokens_in_window, 1);
    }
}
