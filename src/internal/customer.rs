//! Per-app request/response dispatcher.
//!
//! A `Customer` is the agent a worker or server app uses to track its
//! outstanding data requests and to receive dispatched data messages. It
//! only sees data traffic: system control messages are consumed inside the
//! Van and never reach a customer. Request ids double as the sending node's
//! message timestamps.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::internal::message::{Command, Message};
use crate::internal::pqueue::MessageQueue;
use crate::internal::postoffice::PostOffice;

/// Callback run on every dispatched data message.
pub type ReceiveHandle = Box<dyn Fn(Message) + Send + Sync>;

/// Fan-out / fan-in bookkeeping of issued requests. Indexed by request id;
/// slots live for the customer's lifetime.
struct Tracker {
    /// `slots[req_id] = (fan_out, replies_received)`.
    slots: Mutex<Vec<(usize, usize)>>,

    /// Woken whenever some request reaches completion.
    notify: Notify,
}

/// Request/response agent of one `(app_id, customer_id)` pair.
pub struct Customer {
    app_id: i32,
    customer_id: i32,

    po: Arc<PostOffice>,

    /// Inbound data messages, dispatched by the Van.
    queue: Arc<MessageQueue>,

    tracker: Arc<Tracker>,

    _dispatch_handle: JoinHandle<()>,
}

impl Customer {
    /// Creates a customer, registers it with the post office, and spawns
    /// its dispatch task.
    pub fn new(
        po: Arc<PostOffice>,
        app_id: i32,
        customer_id: i32,
        receive_handle: ReceiveHandle,
    ) -> Result<Arc<Customer>, crate::utils::PsError> {
        let queue = Arc::new(MessageQueue::new());
        let tracker = Arc::new(Tracker {
            slots: Mutex::new(Vec::new()),
            notify: Notify::new(),
        });

        let dispatch_handle = tokio::spawn(Self::dispatch_loop(
            queue.clone(),
            tracker.clone(),
            receive_handle,
        ));

        let customer = Arc::new(Customer {
            app_id,
            customer_id,
            po: po.clone(),
            queue,
            tracker,
            _dispatch_handle: dispatch_handle,
        });

        if let Err(e) = po.add_customer(&customer) {
            customer.queue.push(Self::terminator());
            return Err(e);
        }
        Ok(customer)
    }

    pub fn app_id(&self) -> i32 {
        self.app_id
    }

    pub fn customer_id(&self) -> i32 {
        self.customer_id
    }

    /// Allocates a fresh request id for a request to `receiver` (a node or
    /// group id). The fan-out is the number of concrete nodes the receiver
    /// resolves to right now.
    pub fn new_request(
        &self,
        receiver: i32,
    ) -> Result<i32, crate::utils::PsError> {
        let num_nodes = self.po.get_node_ids(receiver)?.len();
        let mut slots = self.tracker.slots.lock().unwrap();
        slots.push((num_nodes, 0));
        Ok((slots.len() - 1) as i32)
    }

    /// Blocks until every targeted node of the request has replied (or was
    /// pre-counted as skipped).
    pub async fn wait_request(&self, request_id: i32) {
        loop {
            let notified = self.tracker.notify.notified();
            {
                let slots = self.tracker.slots.lock().unwrap();
                let (num, cnt) = slots[request_id as usize];
                if cnt >= num {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Number of responses the request has accumulated so far.
    pub fn response_count(&self, request_id: i32) -> usize {
        let slots = self.tracker.slots.lock().unwrap();
        slots[request_id as usize].1
    }

    /// Manually accounts `cnt` responses toward the request, waking waiters
    /// if it thereby completes.
    pub fn add_response(&self, request_id: i32, cnt: usize) {
        let completed = {
            let mut slots = self.tracker.slots.lock().unwrap();
            let slot = &mut slots[request_id as usize];
            slot.1 += cnt;
            slot.1 >= slot.0
        };
        if completed {
            self.tracker.notify.notify_waiters();
        }
    }

    /// Enqueues one inbound data message. Called only by the Van's receive
    /// loop.
    pub(crate) fn on_receive(&self, msg: Message) {
        self.queue.push(msg);
    }

    /// The self-addressed shutdown message for the dispatch task.
    fn terminator() -> Message {
        let mut term = Message::default();
        term.meta.control.cmd = Command::Terminate;
        term
    }

    async fn dispatch_loop(
        queue: Arc<MessageQueue>,
        tracker: Arc<Tracker>,
        receive_handle: ReceiveHandle,
    ) {
        loop {
            let msg = queue.wait_and_pop().await;
            if msg.meta.control.cmd == Command::Terminate {
                break;
            }
            let is_reply = !msg.meta.request;
            let ts = msg.meta.timestamp;

            receive_handle(msg);

            if is_reply {
                // a reply's timestamp indexes a request this customer issued
                let completed = {
                    let mut slots = tracker.slots.lock().unwrap();
                    assert!(
                        (ts as usize) < slots.len(),
                        "reply for unknown request id {}",
                        ts
                    );
                    let slot = &mut slots[ts as usize];
                    slot.1 += 1;
                    slot.1 == slot.0
                };
                if completed {
                    tracker.notify.notify_waiters();
                }
            }
        }
    }
}

impl Drop for Customer {
    fn drop(&mut self) {
        self.queue.push(Self::terminator());
    }
}

#[cfg(test)]
mod customer_tests {
    use super::*;
    use crate::internal::env::Environment;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{self, Duration};

    fn test_po() -> Arc<PostOffice> {
        // a worker-side post office; no transport activity in these tests
        let env = Environment::from_pairs([
            ("PS_ROLE", "worker"),
            ("PS_NUM_WORKER", "1"),
            ("PS_NUM_SERVER", "2"),
            ("PS_SCHEDULER_URI", "127.0.0.1"),
            ("PS_SCHEDULER_PORT", "1"),
        ]);
        let po = PostOffice::new(env).unwrap();
        po.init_node_groups();
        po
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_fan_in() {
        let po = test_po();
        let customer =
            Customer::new(po, 0, 0, Box::new(|_msg| {})).unwrap();

        let ts = customer.new_request(crate::SERVER_GROUP).unwrap();
        assert_eq!(ts, 0);
        assert_eq!(customer.response_count(ts), 0);

        customer.add_response(ts, 1);
        let waiter = {
            let c = customer.clone();
            tokio::spawn(async move { c.wait_request(ts).await })
        };
        time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        customer.add_response(ts, 1);
        waiter.await.unwrap();
        assert_eq!(customer.response_count(ts), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replies_counted_by_dispatch() {
        let po = test_po();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_ref = seen.clone();
        let customer = Customer::new(
            po,
            0,
            0,
            Box::new(move |_msg| {
                seen_ref.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let ts = customer.new_request(crate::SERVER_GROUP).unwrap();
        for _ in 0..2 {
            let mut reply = Message::default();
            reply.meta.request = false;
            reply.meta.timestamp = ts;
            customer.on_receive(reply);
        }
        customer.wait_request(ts).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_are_dispatched_not_counted() {
        let po = test_po();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_ref = seen.clone();
        let customer = Customer::new(
            po,
            0,
            0,
            Box::new(move |_msg| {
                seen_ref.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let ts = customer.new_request(crate::SERVER_GROUP).unwrap();
        let mut req = Message::default();
        req.meta.request = true;
        req.meta.timestamp = ts;
        customer.on_receive(req);

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(customer.response_count(ts), 0);
    }
}
