//! Delivery, acknowledgment and redelivery for one subscription.

use std::collections::HashSet;

use rill_client::{Delivery, RecordId, Responder};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::state::{Outstanding, StreamLog, SubState};

/// Where the next candidate delivery comes from.
#[derive(Debug, Clone, Copy)]
enum Source {
    Redelivery(usize),
    Waiting(usize),
    Log,
}

/// Keys found blocked during one dispatch pass, and how far each queue has
/// been scanned. Blocked keys stay blocked for the rest of the pass, so
/// queue entries before the scan positions need not be looked at again.
#[derive(Debug, Default)]
struct Pass {
    blocked: HashSet<String>,
    redelivery: usize,
    waiting: usize,
}

impl Pass {
    fn is_blocked(&self, log: &StreamLog, position: usize) -> bool {
        log.records
            .get(position)
            .is_some_and(|received| self.blocked.contains(received.record.key()))
    }
}

impl SubState {
    /// Hands out as many deliveries as member capacity allows.
    ///
    /// Redeliveries are served first, then records held back on an earlier
    /// pass, then new records. When the owner of a record's key is at
    /// capacity, that record and every later record of the key are held
    /// back while other keys keep flowing. The pass ends once every member
    /// is at capacity or nothing is left to offer.
    pub fn dispatch(&mut self, log: &StreamLog, max_outstanding: usize, deadline: Instant) {
        let mut pass = Pass::default();
        while self
            .members
            .iter()
            .any(|member| member.outstanding < max_outstanding)
        {
            let Some((source, id, position)) = self.next_candidate(log, &mut pass) else {
                break;
            };
            let Some(received) = log.records.get(position) else {
                self.take(source);
                continue;
            };

            let key = received.record.key();
            let slot = self.owner_for(key);
            if self.members[slot].outstanding >= max_outstanding {
                trace!(subscription = %self.info.id, key, "owner at capacity, holding key back");
                pass.blocked.insert(key.to_string());
                self.hold(source, id, position, &mut pass);
                continue;
            }
            self.take(source);

            let attempt = self.attempts.get(&id).copied().unwrap_or(0) + 1;
            let delivery = Delivery {
                record: received.clone(),
                attempt,
                responder: Responder::new(id, self.sink.clone()),
            };
            let member = &mut self.members[slot];
            if member.tx.send(delivery).is_err() {
                let member_id = member.id;
                self.redelivery.push_front((id, position));
                self.remove_member(member_id);
                // Keys changed owners; rescan from the start.
                pass = Pass::default();
                continue;
            }

            member.outstanding += 1;
            trace!(
                subscription = %self.info.id,
                consumer = %member.name,
                record_id = %id,
                attempt,
                "delivered"
            );
            let member_id = member.id;
            self.attempts.insert(id, attempt);
            self.ledger.insert(
                id,
                Outstanding {
                    member: member_id,
                    position,
                    deadline,
                },
            );
        }
    }

    fn next_candidate(
        &mut self,
        log: &StreamLog,
        pass: &mut Pass,
    ) -> Option<(Source, RecordId, usize)> {
        while let Some(&(id, position)) = self.redelivery.get(pass.redelivery) {
            if self.acked.contains(&id) {
                self.redelivery.remove(pass.redelivery);
            } else if pass.is_blocked(log, position) {
                pass.redelivery += 1;
            } else {
                return Some((Source::Redelivery(pass.redelivery), id, position));
            }
        }
        while let Some(&(id, position)) = self.waiting.get(pass.waiting) {
            if self.acked.contains(&id) {
                self.waiting.remove(pass.waiting);
            } else if pass.is_blocked(log, position) {
                pass.waiting += 1;
            } else {
                return Some((Source::Waiting(pass.waiting), id, position));
            }
        }
        while let Some(received) = log.records.get(self.cursor) {
            if !pass.blocked.contains(received.record.key()) {
                return Some((Source::Log, received.id, self.cursor));
            }
            self.waiting.push_back((received.id, self.cursor));
            self.cursor += 1;
        }
        None
    }

    /// Removes a candidate that is being delivered or dropped.
    fn take(&mut self, source: Source) {
        match source {
            Source::Redelivery(index) => {
                self.redelivery.remove(index);
            }
            Source::Waiting(index) => {
                self.waiting.remove(index);
            }
            Source::Log => self.cursor += 1,
        }
    }

    /// Leaves a blocked candidate queued for a later pass.
    fn hold(&mut self, source: Source, id: RecordId, position: usize, pass: &mut Pass) {
        match source {
            Source::Redelivery(index) => pass.redelivery = index + 1,
            Source::Waiting(index) => pass.waiting = index + 1,
            Source::Log => {
                self.waiting.push_back((id, position));
                self.cursor += 1;
            }
        }
    }

    /// Requeues deliveries whose ack timeout has passed.
    pub fn expire(&mut self, now: Instant) {
        for (id, entry) in self.ledger.take_expired(now) {
            debug!(subscription = %self.info.id, record_id = %id, "ack timeout, redelivering");
            self.release_slot(entry.member);
            self.redelivery.push_back((id, entry.position));
        }
    }

    /// Finalizes a delivery. Returns false if it was already acked.
    pub fn ack(&mut self, id: RecordId) -> bool {
        if !self.acked.insert(id) {
            return false;
        }
        if let Some(entry) = self.ledger.remove(&id) {
            self.release_slot(entry.member);
        }
        self.redelivery.retain(|(queued, _)| *queued != id);
        true
    }

    /// Refuses a delivery so it is offered again.
    pub fn nack(&mut self, id: RecordId) {
        if self.acked.contains(&id) {
            return;
        }
        if let Some(entry) = self.ledger.remove(&id) {
            self.release_slot(entry.member);
            self.redelivery.push_back((id, entry.position));
        }
    }

    /// Detaches a member, releasing its keys and outstanding deliveries.
    pub fn remove_member(&mut self, member_id: u64) {
        let Some(slot) = self.members.iter().position(|member| member.id == member_id) else {
            return;
        };
        let member = self.members.remove(slot);
        self.owners.retain(|_, owner| *owner != member_id);
        for (id, entry) in self.ledger.take_member(member_id) {
            self.redelivery.push_back((id, entry.position));
        }
        debug!(subscription = %self.info.id, consumer = %member.name, "consumer detached");
    }

    fn owner_for(&mut self, key: &str) -> usize {
        if let Some(owner) = self.owners.get(key) {
            if let Some(slot) = self.members.iter().position(|member| member.id == *owner) {
                return slot;
            }
        }
        let slot = self.next_owner % self.members.len();
        self.next_owner = self.next_owner.wrapping_add(1);
        self.owners.insert(key.to_string(), self.members[slot].id);
        slot
    }

    fn release_slot(&mut self, member_id: u64) {
        if let Some(member) = self.members.iter_mut().find(|member| member.id == member_id) {
            member.outstanding = member.outstanding.saturating_sub(1);
        }
    }
}
