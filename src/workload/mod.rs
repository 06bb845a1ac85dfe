//! Workload description shared by all connections.
//!
//! The core decides **when** to send; the workload decides **what**:
//! - `KeyGenerator`: index to key string (sized by the key-size generator)
//! - value-size generator: payload length for writes
//! - inter-arrival generator: gap between successive issues
//! - a fixed block of random payload bytes that writes are sliced from
//!
//! A `Workload` is immutable after construction and is shared through `Rc`.

mod generator;
mod keys;
mod sampler;

pub use generator::{Distribution, Generator, GeneratorError};
pub use keys::KeyGenerator;
pub use sampler::{EveryNth, Sampler};

use crate::config::Config;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Size of the random payload block (1 MiB); also the largest value issued.
pub const PAYLOAD_LEN: usize = 1024 * 1024;

pub struct Workload {
    pub keygen: KeyGenerator,
    valuesize: Box<dyn Generator>,
    iagen: Box<dyn Generator>,
    /// Size of the key space.
    pub records: u64,
    /// Fraction of issued operations that are writes.
    pub update: f64,
    payload: Bytes,
}

impl Workload {
    pub fn new(
        keygen: KeyGenerator,
        valuesize: Box<dyn Generator>,
        iagen: Box<dyn Generator>,
        records: u64,
        update: f64,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|_| rng.sample(Alphanumeric)).collect();

        Self {
            keygen,
            valuesize,
            iagen,
            records,
            update,
            payload: Bytes::from(payload),
        }
    }

    /// Build the workload from resolved configuration.
    pub fn from_config(config: &Config) -> Result<Self, GeneratorError> {
        let keysize: Distribution = config.keysize.parse()?;
        let valuesize: Distribution = config.valuesize.parse()?;
        let iagen = Distribution::interarrival(&config.iadist, config.lambda())?;

        Ok(Self::new(
            KeyGenerator::new(Box::new(keysize)),
            Box::new(valuesize),
            Box::new(iagen),
            config.records,
            config.update,
            config.seed,
        ))
    }

    /// Payload length for a write, bounded by the payload block.
    pub fn value_size(&self, u: f64) -> usize {
        let size = self.valuesize.generate(u).round();
        if size.is_finite() && size > 0.0 {
            (size as usize).min(PAYLOAD_LEN)
        } else {
            0
        }
    }

    /// Gap until the next issue.
    pub fn interarrival(&self, u: f64) -> Duration {
        let secs = self.iagen.generate(u);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    /// `len` bytes of payload starting near `offset`.
    pub fn value(&self, offset: usize, len: usize) -> Bytes {
        let len = len.min(PAYLOAD_LEN);
        let start = offset % (PAYLOAD_LEN - len + 1);
        self.payload.slice(start..start + len)
    }
}
