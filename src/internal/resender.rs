//! At-least-once delivery: ACK emission, duplicate suppression, and timed
//! retransmission of unacknowledged messages.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

use crate::internal::message::{Command, Message, Meta};
use crate::internal::node::EMPTY;
use crate::internal::postoffice::PostOffice;

/// One outstanding (sent but unacknowledged) message.
struct PendingEntry {
    /// Copy kept around for possible retransmission.
    msg: Message,

    /// First send time.
    first_send: Instant,

    /// Retransmissions so far.
    retry: u32,
}

/// Retransmits messages that were not acknowledged within the timeout, and
/// suppresses duplicates on the receive side. `on_send`/`on_receive` must be
/// called for every message the Van sends/receives.
pub(crate) struct Resender {
    timeout: Duration,
    max_retry: u32,

    /// Sent but unacknowledged messages, keyed by signature.
    tobe_acked: Mutex<HashMap<u64, PendingEntry>>,

    /// Signatures of all messages ever received; grows for the process
    /// lifetime since old signatures can always come back.
    seen: Mutex<HashSet<u64>>,

    scan_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Resender {
    /// Creates the resender and spawns its periodic scan task.
    pub(crate) fn new(
        timeout_ms: u64,
        max_retry: u32,
        po: &Arc<PostOffice>,
    ) -> Arc<Resender> {
        let resender = Arc::new(Resender {
            timeout: Duration::from_millis(timeout_ms),
            max_retry,
            tobe_acked: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
            scan_handle: Mutex::new(None),
        });

        let scan_ref = resender.clone();
        let po_ref = po.clone();
        let handle = tokio::spawn(async move { scan_ref.scan_loop(po_ref).await });
        *resender.scan_handle.lock().unwrap() = Some(handle);

        resender
    }

    /// Records an outgoing message for acknowledgement tracking. ACKs are
    /// never tracked; a signature already present means this very call is a
    /// retransmission whose original entry stays authoritative.
    pub(crate) fn on_send(&self, my_id: i32, msg: &Message) {
        if msg.meta.control.is_ack() {
            return;
        }
        let sign = signature(my_id, &msg.meta);
        let mut pending = self.tobe_acked.lock().unwrap();
        pending.entry(sign).or_insert_with(|| PendingEntry {
            msg: msg.clone(),
            first_send: Instant::now(),
            retry: 0,
        });
    }

    /// Receive-side hook. Returns true if the Van should skip further
    /// processing of this message: it is either an ACK (consumed here) or a
    /// duplicate of something already delivered. TERMINATE passes through
    /// untouched. Non-ACK messages are acknowledged back to the sender even
    /// when duplicated.
    pub(crate) fn on_receive(
        &self,
        my_id: i32,
        msg: &Message,
        send_ack: impl FnOnce(Message),
    ) -> bool {
        if msg.meta.control.cmd == Command::Terminate {
            return false;
        }
        if msg.meta.control.is_ack() {
            self.tobe_acked.lock().unwrap().remove(&msg.meta.msg_sign);
            return true;
        }
        if msg.meta.sender == EMPTY {
            // pre-assignment join traffic: the sender is unaddressable and
            // unassigned senders share one signature, so it stays outside
            // the ACK domain
            return false;
        }

        let sign = signature(my_id, &msg.meta);
        let duplicated = !self.seen.lock().unwrap().insert(sign);

        let mut ack = Message::default();
        ack.meta.sender = msg.meta.receiver;
        ack.meta.receiver = msg.meta.sender;
        ack.meta.control.cmd = Command::Ack;
        ack.meta.msg_sign = sign;
        send_ack(ack);

        if duplicated {
            pf_warn!(
                "dropped duplicated msg from {} (sign {:#x})",
                msg.meta.sender,
                sign
            );
        }
        duplicated
    }

    /// Exposes the scan task handle so tests can kill it abruptly.
    #[cfg(test)]
    pub(crate) fn scan_handle_for_test(&self) -> Option<JoinHandle<()>> {
        self.scan_handle.lock().unwrap().take()
    }

    /// Stops the periodic scan task.
    pub(crate) async fn stop(&self) {
        let handle = self.scan_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn scan_loop(self: Arc<Resender>, po: Arc<PostOffice>) {
        loop {
            time::sleep(self.timeout).await;

            let mut tobe_send = Vec::new();
            {
                let now = Instant::now();
                let mut pending = self.tobe_acked.lock().unwrap();
                for (sign, entry) in pending.iter_mut() {
                    let deadline =
                        entry.first_send + self.timeout * (entry.retry + 1);
                    if deadline < now {
                        entry.retry += 1;
                        pf_warn!(
                            "resending msg -> {} (sign {:#x}, retry {})",
                            entry.msg.meta.receiver,
                            sign,
                            entry.retry
                        );
                        assert!(
                            entry.retry <= self.max_retry,
                            "msg resent over {} times, giving up",
                            self.max_retry
                        );
                        tobe_send.push(entry.msg.clone());
                    }
                }
            }

            // actual sends happen outside the map lock
            for msg in tobe_send {
                if let Err(e) = po.van().send(msg) {
                    pf_warn!("error resending msg: {}", e);
                }
            }
        }
    }
}

/// 64-bit fingerprint of a non-ACK message: app id, sender and receiver low
/// bytes, the low 31 bits of the timestamp, and the request flag. When the
/// sender has no id yet (the initial join), the node's own current id is
/// substituted; only the scheduler receives such messages.
pub(crate) fn signature(my_id: i32, meta: &Meta) -> u64 {
    assert_ne!(meta.timestamp, EMPTY, "cannot sign msg without timestamp");
    let sender = if meta.sender == EMPTY {
        my_id
    } else {
        meta.sender
    };
    ((meta.app_id as u16 as u64) << 48)
        | ((sender as u8 as u64) << 40)
        | ((meta.receiver as u8 as u64) << 32)
        | (((meta.timestamp as u32) << 1) as u64)
        | (meta.request as u64)
}

#[cfg(test)]
mod resender_tests {
    use super::*;

    fn meta_with(
        app_id: i32,
        sender: i32,
        receiver: i32,
        timestamp: i32,
        request: bool,
    ) -> Meta {
        Meta {
            app_id,
            sender,
            receiver,
            timestamp,
            request,
            ..Default::default()
        }
    }

    #[test]
    fn signature_distinguishes_tuples() {
        let base = meta_with(0, 9, 8, 41, true);
        let sign = signature(9, &base);

        let variants = [
            meta_with(1, 9, 8, 41, true),
            meta_with(0, 11, 8, 41, true),
            meta_with(0, 9, 10, 41, true),
            meta_with(0, 9, 8, 42, true),
            meta_with(0, 9, 8, 41, false),
        ];
        for v in &variants {
            assert_ne!(signature(9, v), sign);
        }
    }

    #[test]
    fn signature_substitutes_unassigned_sender() {
        let unassigned = meta_with(0, EMPTY, 1, 3, true);
        let assigned = meta_with(0, 9, 1, 3, true);
        assert_eq!(signature(9, &unassigned), signature(9, &assigned));
    }

    #[test]
    fn signature_layout() {
        let meta = meta_with(2, 9, 8, 5, true);
        let sign = signature(9, &meta);
        assert_eq!(sign >> 48, 2);
        assert_eq!((sign >> 40) & 0xff, 9);
        assert_eq!((sign >> 32) & 0xff, 8);
        assert_eq!((sign >> 1) & 0x7fff_ffff, 5);
        assert_eq!(sign & 1, 1);
    }

    #[test]
    #[should_panic(expected = "cannot sign msg without timestamp")]
    fn signature_requires_timestamp() {
        let meta = meta_with(0, 9, 8, EMPTY, true);
        signature(9, &meta);
    }

    fn test_resender() -> (Arc<crate::PostOffice>, Arc<Resender>) {
        let env = crate::Environment::from_pairs([
            ("PS_ROLE", "worker"),
            ("PS_NUM_WORKER", "1"),
            ("PS_NUM_SERVER", "1"),
            ("PS_SCHEDULER_URI", "127.0.0.1"),
            ("PS_SCHEDULER_PORT", "1"),
        ]);
        let po = crate::PostOffice::new(env).unwrap();
        let resender = Resender::new(60_000, 10, &po);
        (po, resender)
    }

    #[tokio::test]
    async fn duplicates_skipped_but_always_acked() {
        let (_po, resender) = test_resender();

        let mut msg = Message::default();
        msg.meta = meta_with(0, 9, 8, 3, true);

        let mut acks = Vec::new();
        let first =
            resender.on_receive(8, &msg, |ack| acks.push(ack));
        assert!(!first, "first delivery must be processed");

        let second =
            resender.on_receive(8, &msg, |ack| acks.push(ack));
        assert!(second, "second delivery must be skipped");

        // both deliveries acknowledged, with the same signature
        assert_eq!(acks.len(), 2);
        let expect_sign = signature(8, &msg.meta);
        for ack in &acks {
            assert!(ack.meta.control.is_ack());
            assert_eq!(ack.meta.msg_sign, expect_sign);
            assert_eq!(ack.meta.receiver, 9);
        }

        resender.stop().await;
    }

    #[tokio::test]
    async fn ack_clears_pending_entry() {
        let (_po, resender) = test_resender();

        let mut msg = Message::default();
        msg.meta = meta_with(0, EMPTY, 8, 7, true);
        resender.on_send(9, &msg);
        assert_eq!(resender.tobe_acked.lock().unwrap().len(), 1);

        // tracking an identical resend keeps the original entry
        resender.on_send(9, &msg);
        assert_eq!(resender.tobe_acked.lock().unwrap().len(), 1);

        let mut ack = Message::default();
        ack.meta.sender = 8;
        ack.meta.control.cmd = Command::Ack;
        ack.meta.msg_sign = signature(9, &msg.meta);
        let skipped = resender.on_receive(9, &ack, |_| {
            panic!("ACKs are never acknowledged")
        });
        assert!(skipped);
        assert!(resender.tobe_acked.lock().unwrap().is_empty());

        resender.stop().await;
    }

    #[tokio::test]
    async fn join_traffic_passes_through() {
        let (_po, resender) = test_resender();

        let mut msg = Message::default();
        msg.meta = meta_with(EMPTY, EMPTY, 1, 0, false);
        msg.meta.control.cmd = Command::AddNode;

        // unassigned senders are outside the ACK domain: processed twice,
        // never acknowledged
        for _ in 0..2 {
            let skipped = resender.on_receive(1, &msg, |_| {
                panic!("join traffic must not be acknowledged")
            });
            assert!(!skipped);
        }

        resender.stop().await;
    }
}
