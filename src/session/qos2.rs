//! QoS2 exactly-once transaction state.
//!
//! The stage machines are the primary data structure; the frames a session
//! emits are derived from the current stage, never the reverse.
//!
//! Outbound (server-initiated delivery):
//! PREPARING --PREPARE_ACK--> COMMITTING --COMPLETE--> DELIVERING --ACK--> done
//!
//! Inbound (client request on a QoS2 method): the server drives the same
//! handshake toward the client, running the handler exactly once between
//! PREPARE_ACK receipt and COMMIT emission.
//! AWAIT_PREPARE_ACK --PREPARE_ACK--> AWAIT_COMPLETE --COMPLETE--> respond, done

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

use crate::sched::TimerHandle;
use crate::wire::frame::Frame;
use crate::wire::protocol::ParsedRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutboundStage {
    /// PREPARE sent, awaiting PREPARE_ACK.
    Preparing,
    /// COMMIT sent, awaiting COMPLETE.
    Committing,
    /// Final DATA sent, awaiting ACK.
    Delivering,
}

#[derive(Debug)]
pub(crate) struct Qos2Outbound {
    pub payload: Bytes,
    pub stage: OutboundStage,
    pub attempts_in_stage: u32,
    pub timer: TimerHandle,
}

impl Qos2Outbound {
    /// The frame this transaction retransmits at its current stage.
    pub fn stage_frame(&self, id: u64) -> Frame {
        match self.stage {
            OutboundStage::Preparing => Frame::prepare(id),
            OutboundStage::Committing => Frame::commit(id),
            OutboundStage::Delivering => Frame::data(id, self.payload.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundStage {
    /// PREPARE sent toward the client, handler not yet run.
    AwaitPrepareAck,
    /// Handler ran, COMMIT sent, awaiting COMPLETE.
    AwaitComplete,
}

#[derive(Debug)]
pub(crate) struct Qos2Inbound {
    /// Parsed request held until the handler runs (at most once).
    pub request: ParsedRequest,
    pub stage: InboundStage,
    /// Response payload captured from the handler, delivered on COMPLETE.
    pub result: Option<Bytes>,
    pub attempts_in_stage: u32,
    pub timer: TimerHandle,
}

impl Qos2Inbound {
    pub fn stage_frame(&self, id: u64) -> Frame {
        match self.stage {
            InboundStage::AwaitPrepareAck => Frame::prepare(id),
            InboundStage::AwaitComplete => Frame::commit(id),
        }
    }
}

/// Both transaction tables for one session.
#[derive(Debug, Default)]
pub(crate) struct Qos2Tables {
    pub outbound: HashMap<u64, Qos2Outbound>,
    /// Outbound ids in send order, for attach-time replay.
    pub outbound_order: VecDeque<u64>,
    pub inbound: HashMap<u64, Qos2Inbound>,
}

impl Qos2Tables {
    pub fn insert_outbound(&mut self, id: u64, txn: Qos2Outbound) {
        if self.outbound.insert(id, txn).is_none() {
            self.outbound_order.push_back(id);
        }
    }

    pub fn remove_outbound(&mut self, id: u64) -> Option<Qos2Outbound> {
        let txn = self.outbound.remove(&id);
        if txn.is_some() {
            self.outbound_order.retain(|&queued| queued != id);
        }
        txn
    }

    pub fn outbound_ids_in_order(&self) -> Vec<u64> {
        self.outbound_order.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }

    /// Drop everything, yielding the timers that must be cancelled.
    pub fn drain_timers(&mut self) -> Vec<TimerHandle> {
        self.outbound_order.clear();
        let mut timers: Vec<TimerHandle> = self
            .outbound
            .drain()
            .map(|(_, txn)| txn.timer)
            .collect();
        timers.extend(self.inbound.drain().map(|(_, txn)| txn.timer));
        timers
    }
}
