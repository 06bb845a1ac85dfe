//! Latency sampling policy.

/// Decides whether an operation's latency is recorded.
pub trait Sampler {
    fn sample(&mut self) -> bool;
}

/// Samples every `n`th operation, starting with the first.
#[derive(Debug, Clone)]
pub struct EveryNth {
    n: u64,
    seen: u64,
}

impl EveryNth {
    /// `n` of zero never samples, `n` of one samples everything.
    pub fn new(n: u64) -> Self {
        Self { n, seen: 0 }
    }
}

impl Sampler for EveryNth {
    fn sample(&mut self) -> bool {
        if self.n == 0 {
            return false;
        }
        let hit = self.seen % self.n == 0;
        self.seen = self.seen.wrapping_add(1);
        hit
    }
}
