//! Result verification.
//!
//! Compares an [`ExpectedModel`] with an [`ObservedModel`] under one
//! [`Guarantee`] and produces a [`Verdict`]. A failing verdict carries the
//! counts on both sides and a bounded sample of the symmetric difference,
//! so a failure can be debugged from the message alone.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rill_client::RecordId;

use crate::error::{Result, WorkloadError};
use crate::model::{ExpectedModel, ObservedModel};

/// Number of differing entries kept per side of a failed comparison.
pub const SAMPLE_SIZE: usize = 10;

/// Longest fingerprint shown in a diagnostic.
const FINGERPRINT_PREVIEW: usize = 48;

/// A property checked by [`verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guarantee {
    /// Same payloads with the same multiplicities, in any order.
    ExactMultiset,
    /// Same record identifiers.
    ExactIds,
    /// Same payloads in the same order.
    InOrder,
    /// Same number of records.
    SameSize,
    /// Identifiers increase per ordering key, both in write order and in
    /// first-attempt delivery order.
    PerKeyMonotonic,
    /// Every ordering key was delivered to a single member.
    KeyExclusive,
    /// The two sides share no record identifier.
    Disjoint,
}

/// A violation of a [`Guarantee`] beyond missing or unexpected entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Record counts differ.
    CountMismatch {
        /// Expected count.
        expected: usize,
        /// Observed count.
        observed: usize,
    },
    /// The first position where the observed order departs from the expected one.
    OutOfOrder {
        /// Position in the sequence.
        position: usize,
        /// Expected fingerprint at that position.
        expected: String,
        /// Observed fingerprint at that position.
        observed: String,
    },
    /// Identifiers of one key did not strictly increase.
    NonMonotonic {
        /// Which model the sequence came from.
        side: &'static str,
        /// The ordering key.
        key: String,
        /// The earlier identifier.
        previous: RecordId,
        /// The identifier that followed it.
        next: RecordId,
    },
    /// One key was delivered to several members.
    KeySplit {
        /// The ordering key.
        key: String,
        /// Members that received records of the key.
        members: Vec<String>,
    },
    /// A record present in two sets that must be disjoint.
    Overlap {
        /// The shared record.
        id: RecordId,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountMismatch { expected, observed } => {
                write!(f, "count mismatch: expected {expected}, observed {observed}")
            }
            Self::OutOfOrder {
                position,
                expected,
                observed,
            } => write!(
                f,
                "out of order at position {position}: expected {expected}, observed {observed}"
            ),
            Self::NonMonotonic {
                side,
                key,
                previous,
                next,
            } => write!(f, "{side} identifiers of key {key} not increasing: {previous} then {next}"),
            Self::KeySplit { key, members } => {
                write!(f, "key {key} delivered to {} members: {}", members.len(), members.join(", "))
            }
            Self::Overlap { id } => write!(f, "record {id} present in both sets"),
        }
    }
}

/// Outcome of a verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// The checked guarantee.
    pub guarantee: Guarantee,
    /// Entries on the expected side.
    pub expected_count: usize,
    /// Entries on the observed side.
    pub observed_count: usize,
    /// Expected entries that were not observed.
    pub missing: usize,
    /// Observed entries that were not expected.
    pub unexpected: usize,
    /// Up to [`SAMPLE_SIZE`] missing entries.
    pub missing_sample: Vec<String>,
    /// Up to [`SAMPLE_SIZE`] unexpected entries.
    pub unexpected_sample: Vec<String>,
    /// Records present on both sides of a [`Guarantee::Disjoint`] check.
    /// Only the first [`SAMPLE_SIZE`] appear in `violations`.
    pub overlap: usize,
    /// Other violations found.
    pub violations: Vec<Violation>,
}

impl Verdict {
    fn new(guarantee: Guarantee, expected_count: usize, observed_count: usize) -> Self {
        Self {
            guarantee,
            expected_count,
            observed_count,
            missing: 0,
            unexpected: 0,
            missing_sample: Vec::new(),
            unexpected_sample: Vec::new(),
            overlap: 0,
            violations: Vec::new(),
        }
    }

    /// Returns true if the guarantee holds.
    #[must_use]
    pub fn is_pass(&self) -> bool {
        self.missing == 0 && self.unexpected == 0 && self.overlap == 0 && self.violations.is_empty()
    }

    /// Converts a failing verdict into an error.
    ///
    /// # Errors
    /// Returns `Verification` with this verdict's diagnostic if it failed.
    pub fn into_result(self) -> Result<()> {
        if self.is_pass() {
            Ok(())
        } else {
            Err(WorkloadError::Verification {
                summary: self.to_string(),
            })
        }
    }

    fn note_missing(&mut self, entry: String) {
        self.missing += 1;
        if self.missing_sample.len() < SAMPLE_SIZE {
            self.missing_sample.push(entry);
        }
    }

    fn note_unexpected(&mut self, entry: String) {
        self.unexpected += 1;
        if self.unexpected_sample.len() < SAMPLE_SIZE {
            self.unexpected_sample.push(entry);
        }
    }

    fn note_overlap(&mut self, id: RecordId) {
        self.overlap += 1;
        if self.overlap <= SAMPLE_SIZE {
            self.violations.push(Violation::Overlap { id });
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = if self.is_pass() { "pass" } else { "FAIL" };
        write!(
            f,
            "{:?} {outcome}: expected {}, observed {}",
            self.guarantee, self.expected_count, self.observed_count
        )?;
        if self.missing > 0 {
            write!(f, "; {} missing {:?}", self.missing, self.missing_sample)?;
        }
        if self.unexpected > 0 {
            write!(f, "; {} unexpected {:?}", self.unexpected, self.unexpected_sample)?;
        }
        if self.overlap > 0 {
            write!(f, "; {} shared", self.overlap)?;
        }
        for violation in &self.violations {
            write!(f, "; {violation}")?;
        }
        Ok(())
    }
}

/// Checks `guarantee` for an expected and an observed model.
#[must_use]
pub fn verify(expected: &ExpectedModel, observed: &ObservedModel, guarantee: Guarantee) -> Verdict {
    let mut verdict = Verdict::new(guarantee, expected.len(), observed.len());
    match guarantee {
        Guarantee::ExactMultiset => {
            multiset_diff(&mut verdict, &expected.fingerprints(), &observed.fingerprints());
        }
        Guarantee::ExactIds => id_diff(&mut verdict, &expected.ids(), &observed.ids()),
        Guarantee::InOrder => {
            let want = expected.fingerprints();
            let got = observed.fingerprints();
            multiset_diff(&mut verdict, &want, &got);
            if let Some(position) = want.iter().zip(&got).position(|(a, b)| a != b) {
                verdict.violations.push(Violation::OutOfOrder {
                    position,
                    expected: preview(&want[position]),
                    observed: preview(&got[position]),
                });
            } else if want.len() != got.len() {
                verdict.violations.push(Violation::CountMismatch {
                    expected: want.len(),
                    observed: got.len(),
                });
            }
        }
        Guarantee::SameSize => {
            if expected.len() != observed.len() {
                verdict.violations.push(Violation::CountMismatch {
                    expected: expected.len(),
                    observed: observed.len(),
                });
            }
        }
        Guarantee::PerKeyMonotonic => {
            let written = expected
                .by_writer_and_key()
                .into_iter()
                .map(|((writer, key), ids)| match writer {
                    0 => (key, ids),
                    _ => (format!("{key} (writer {writer})"), ids),
                });
            monotonic(&mut verdict, "written", written);
            monotonic(&mut verdict, "delivered", observed.first_attempts_by_key());
        }
        Guarantee::KeyExclusive => {
            for (key, members) in observed.key_owners() {
                if members.len() > 1 {
                    verdict.violations.push(Violation::KeySplit {
                        key,
                        members: members.into_iter().collect(),
                    });
                }
            }
        }
        Guarantee::Disjoint => shared_ids(&mut verdict, &expected.ids(), &observed.ids()),
    }
    verdict
}

/// Checks that two observed sets share no record.
#[must_use]
pub fn verify_disjoint(a: &ObservedModel, b: &ObservedModel) -> Verdict {
    let mut verdict = Verdict::new(Guarantee::Disjoint, a.len(), b.len());
    shared_ids(&mut verdict, &a.ids(), &b.ids());
    verdict
}

fn shared_ids(verdict: &mut Verdict, left: &BTreeSet<RecordId>, right: &BTreeSet<RecordId>) {
    for id in left.intersection(right) {
        verdict.note_overlap(*id);
    }
}

fn multiset_diff(verdict: &mut Verdict, expected: &[String], observed: &[String]) {
    let mut balance: BTreeMap<&str, i64> = BTreeMap::new();
    for fingerprint in expected {
        *balance.entry(fingerprint.as_str()).or_default() += 1;
    }
    for fingerprint in observed {
        *balance.entry(fingerprint.as_str()).or_default() -= 1;
    }
    for (fingerprint, count) in balance {
        for _ in 0..count.unsigned_abs() {
            if count > 0 {
                verdict.note_missing(preview(fingerprint));
            } else {
                verdict.note_unexpected(preview(fingerprint));
            }
        }
    }
}

fn id_diff(verdict: &mut Verdict, expected: &BTreeSet<RecordId>, observed: &BTreeSet<RecordId>) {
    for id in expected.difference(observed) {
        verdict.note_missing(id.to_string());
    }
    for id in observed.difference(expected) {
        verdict.note_unexpected(id.to_string());
    }
}

fn monotonic(
    verdict: &mut Verdict,
    side: &'static str,
    sequences: impl IntoIterator<Item = (String, Vec<RecordId>)>,
) {
    for (key, ids) in sequences {
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] >= pair[1]) {
            verdict.violations.push(Violation::NonMonotonic {
                side,
                key,
                previous: pair[0],
                next: pair[1],
            });
        }
    }
}

fn preview(fingerprint: &str) -> String {
    if fingerprint.len() <= FINGERPRINT_PREVIEW {
        return fingerprint.to_string();
    }
    let mut end = FINGERPRINT_PREVIEW;
    while !fingerprint.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...({} chars)", &fingerprint[..end], fingerprint.len())
}
