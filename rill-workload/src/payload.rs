//! Payload shapes and deterministic payload generation.
//!
//! Every generator is seeded, so a failing run can be replayed with the same
//! payloads. Payloads are compared by [`Payload::fingerprint`], which makes
//! raw and structured records interchangeable for verification.

use bytes::Bytes;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rill_client::{Payload, Record};
use serde_json::{Map, Value};

/// Default size of generated raw payloads.
pub const DEFAULT_RAW_SIZE: usize = 128;

/// The shape of generated payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadShape {
    /// Random bytes of the given size.
    Raw {
        /// Payload size in bytes.
        size: usize,
    },
    /// Small key-value objects.
    Structured,
    /// Randomly alternates raw payloads of `size` bytes and structured ones.
    Mixed {
        /// Size of the raw payloads.
        size: usize,
    },
    /// The same bytes for every record.
    Fixed(Bytes),
}

impl Default for PayloadShape {
    fn default() -> Self {
        Self::Raw {
            size: DEFAULT_RAW_SIZE,
        }
    }
}

/// Deterministic payload source.
#[derive(Debug, Clone)]
pub struct PayloadGenerator {
    shape: PayloadShape,
    rng: ChaCha8Rng,
    sequence: u64,
}

impl PayloadGenerator {
    /// Creates a generator for `shape` seeded with `seed`.
    #[must_use]
    pub fn new(shape: PayloadShape, seed: u64) -> Self {
        Self {
            shape,
            rng: ChaCha8Rng::seed_from_u64(seed),
            sequence: 0,
        }
    }

    /// Returns the shape this generator produces.
    #[must_use]
    pub const fn shape(&self) -> &PayloadShape {
        &self.shape
    }

    /// Produces the next payload.
    pub fn next_payload(&mut self) -> Payload {
        self.sequence += 1;
        match &self.shape {
            PayloadShape::Raw { size } => Payload::Raw(self.random_bytes(*size)),
            PayloadShape::Structured => Payload::Structured(self.structured()),
            PayloadShape::Mixed { size } => {
                if self.rng.gen_bool(0.5) {
                    Payload::Raw(self.random_bytes(*size))
                } else {
                    Payload::Structured(self.structured())
                }
            }
            PayloadShape::Fixed(bytes) => Payload::Raw(bytes.clone()),
        }
    }

    /// Produces the next payload as an un-keyed record.
    pub fn next_record(&mut self) -> Record {
        Record {
            payload: self.next_payload(),
            ordering_key: None,
        }
    }

    fn random_bytes(&mut self, size: usize) -> Bytes {
        let mut data = vec![0u8; size];
        self.rng.fill_bytes(&mut data);
        Bytes::from(data)
    }

    fn structured(&mut self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("seq".to_string(), Value::from(self.sequence));
        fields.insert(
            "name".to_string(),
            Value::from(format!("record-{}", self.sequence)),
        );
        fields.insert("value".to_string(), Value::from(self.rng.gen::<u32>()));
        fields.insert("flag".to_string(), Value::from(self.rng.gen_bool(0.5)));
        fields
    }
}
