//! Sharded key-value application layer: workers slice requests across the
//! fixed server key ranges, servers run a user handler over each request,
//! and pull replies are reassembled in key order on the way back.

use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::{Arc, Mutex};

use crate::internal::customer::Customer;
use crate::internal::message::{sarray_from_bytes, Message, Scalar};
use crate::internal::node::{server_rank_to_id, Range, SERVER_GROUP};
use crate::internal::postoffice::PostOffice;
use crate::utils::{PsError, SArray};
use crate::Key;

/// A batch of key-value pairs plus optional per-key value lengths. Keys are
/// unique and strictly increasing. Without `lens`, every key owns
/// `vals.len() / keys.len()` values; with it, key `i` owns `lens[i]`.
#[derive(Debug, Clone)]
pub struct KVPairs<V> {
    pub keys: SArray<Key>,
    pub vals: SArray<V>,
    pub lens: SArray<i32>,
    pub priority: i32,
}

impl<V> Default for KVPairs<V> {
    fn default() -> Self {
        KVPairs {
            keys: SArray::new(),
            vals: SArray::new(),
            lens: SArray::new(),
            priority: 0,
        }
    }
}

/// Completion callback of one push/pull request; runs on the dispatch task
/// once every server shard has been accounted for.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Per-server slices of one request: `(non_empty, shard)` per server rank.
pub type SlicedKVs<V> = Vec<(bool, KVPairs<V>)>;

/// Splits a request across the per-server key ranges.
pub type Slicer<V> =
    Box<dyn Fn(&KVPairs<V>, &[Range]) -> SlicedKVs<V> + Send + Sync>;

struct KVWorkerInner<V: Scalar> {
    po: Arc<PostOffice>,
    app_id: i32,
    customer_id: i32,
    customer: Mutex<Option<Arc<Customer>>>,

    /// Buffered pull replies per request, awaiting reassembly.
    recv_kvs: Mutex<HashMap<i32, Vec<KVPairs<V>>>>,

    /// One-shot completion callbacks per request.
    callbacks: Mutex<HashMap<i32, Callback>>,

    slicer: Mutex<Slicer<V>>,
}

impl<V: Scalar> Drop for KVWorkerInner<V> {
    fn drop(&mut self) {
        self.po.remove_customer(self.app_id, self.customer_id);
    }
}

/// Worker-side handle issuing push/pull/push-pull requests against the
/// server group.
pub struct KVWorker<V: Scalar> {
    inner: Arc<KVWorkerInner<V>>,
}

impl<V: Scalar> KVWorker<V> {
    /// Creates a worker app and registers its customer.
    pub fn new(
        po: Arc<PostOffice>,
        app_id: i32,
        customer_id: i32,
    ) -> Result<KVWorker<V>, PsError> {
        let inner = Arc::new(KVWorkerInner {
            po: po.clone(),
            app_id,
            customer_id,
            customer: Mutex::new(None),
            recv_kvs: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            slicer: Mutex::new(Box::new(default_slicer::<V>)),
        });

        let weak = Arc::downgrade(&inner);
        let customer = Customer::new(
            po,
            app_id,
            customer_id,
            Box::new(move |msg| {
                if let Some(inner) = weak.upgrade() {
                    KVWorkerInner::on_receive(&inner, msg);
                }
            }),
        )?;
        *inner.customer.lock().unwrap() = Some(customer);

        Ok(KVWorker { inner })
    }

    /// Replaces the default slicer.
    pub fn set_slicer(&self, slicer: Slicer<V>) {
        *self.inner.slicer.lock().unwrap() = slicer;
    }

    /// Pushes key-value pairs to the servers owning them. Non-blocking;
    /// returns the request timestamp for `wait` or the callback.
    pub fn push(
        &self,
        keys: &[Key],
        vals: &[V],
        lens: Option<&[i32]>,
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> Result<i32, PsError> {
        self.zpush(
            SArray::from_slice(keys),
            SArray::from_slice(vals),
            lens.map(SArray::from_slice).unwrap_or_default(),
            cmd,
            cb,
            priority,
        )
    }

    /// Zero-copy push: the arrays are shared with the send path, so their
    /// contents must stay untouched until the request completes.
    pub fn zpush(
        &self,
        keys: SArray<Key>,
        vals: SArray<V>,
        lens: SArray<i32>,
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> Result<i32, PsError> {
        let ts = self.customer()?.new_request(SERVER_GROUP)?;
        if let Some(cb) = cb {
            self.inner.add_callback(ts, cb);
        }
        let kvs = KVPairs {
            keys,
            vals,
            lens,
            priority,
        };
        self.inner.send(ts, true, false, cmd, &kvs)?;
        Ok(ts)
    }

    /// Pulls the values of `keys` from their servers into `vals` (and the
    /// per-key lengths into `lens` when given). The output buffers are
    /// filled, in key order, before the callback runs / `wait` returns.
    pub fn pull(
        &self,
        keys: &[Key],
        vals: Arc<Mutex<Vec<V>>>,
        lens: Option<Arc<Mutex<Vec<i32>>>>,
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> Result<i32, PsError> {
        self.zpull(SArray::from_slice(keys), vals, lens, cmd, cb, priority)
    }

    /// Zero-copy pull; see `pull`.
    pub fn zpull(
        &self,
        keys: SArray<Key>,
        vals: Arc<Mutex<Vec<V>>>,
        lens: Option<Arc<Mutex<Vec<i32>>>>,
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> Result<i32, PsError> {
        let ts = self.add_pull_cb(keys.clone(), vals, lens, cb)?;
        let kvs = KVPairs {
            keys,
            priority,
            ..Default::default()
        };
        self.inner.send(ts, false, true, cmd, &kvs)?;
        Ok(ts)
    }

    /// Pushes `vals` and pulls the post-update values of the same keys into
    /// `outs` in one request. Value counts must match.
    pub fn push_pull(
        &self,
        keys: &[Key],
        vals: &[V],
        outs: Arc<Mutex<Vec<V>>>,
        lens: Option<Arc<Mutex<Vec<i32>>>>,
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> Result<i32, PsError> {
        self.zpush_pull(
            SArray::from_slice(keys),
            SArray::from_slice(vals),
            outs,
            lens,
            cmd,
            cb,
            priority,
        )
    }

    /// Zero-copy push-pull; see `push_pull`.
    pub fn zpush_pull(
        &self,
        keys: SArray<Key>,
        vals: SArray<V>,
        outs: Arc<Mutex<Vec<V>>>,
        lens: Option<Arc<Mutex<Vec<i32>>>>,
        cmd: i32,
        cb: Option<Callback>,
        priority: i32,
    ) -> Result<i32, PsError> {
        {
            let mut outs = outs.lock().unwrap();
            if outs.is_empty() {
                outs.resize(vals.len(), V::ZERO);
            } else if outs.len() != vals.len() {
                return logged_err!(
                    "push_pull value count {} != out count {}",
                    vals.len(),
                    outs.len()
                );
            }
        }
        let ts = self.add_pull_cb(keys.clone(), outs, lens, cb)?;
        let kvs = KVPairs {
            keys,
            vals,
            priority,
            ..Default::default()
        };
        self.inner.send(ts, true, true, cmd, &kvs)?;
        Ok(ts)
    }

    /// Blocks until the request has been fully answered.
    pub async fn wait(&self, timestamp: i32) -> Result<(), PsError> {
        self.customer()?.wait_request(timestamp).await;
        Ok(())
    }

    fn customer(&self) -> Result<Arc<Customer>, PsError> {
        self.inner
            .customer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PsError::msg("app is shutting down"))
    }

    /// Allocates the request id and registers the pull-side reassembly
    /// callback: verify shard replies cover the request exactly, order them
    /// by key, concatenate into the output buffers, then run the user
    /// callback.
    fn add_pull_cb(
        &self,
        keys: SArray<Key>,
        vals: Arc<Mutex<Vec<V>>>,
        lens: Option<Arc<Mutex<Vec<i32>>>>,
        cb: Option<Callback>,
    ) -> Result<i32, PsError> {
        let ts = self.customer()?.new_request(SERVER_GROUP)?;
        let weak = Arc::downgrade(&self.inner);

        self.inner.add_callback(
            ts,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut shards = inner
                    .recv_kvs
                    .lock()
                    .unwrap()
                    .remove(&ts)
                    .unwrap_or_default();

                // every shard reply must be a contiguous sub-range of the
                // requested keys, and together they must cover all of them
                let mut total_keys = 0;
                let mut total_vals = 0;
                for shard in &shards {
                    if !shard.keys.is_empty() {
                        let (lo, hi) = find_range(
                            &keys,
                            shard.keys[0],
                            shard.keys[shard.keys.len() - 1] + 1,
                        );
                        assert_eq!(
                            hi - lo,
                            shard.keys.len(),
                            "unmatched keys from one server"
                        );
                        if lens.is_some() {
                            assert_eq!(shard.lens.len(), shard.keys.len());
                        }
                    }
                    total_keys += shard.keys.len();
                    total_vals += shard.vals.len();
                }
                assert_eq!(total_keys, keys.len(), "lost some servers?");

                shards.sort_by_key(|shard| {
                    shard.keys.as_slice().first().copied()
                });

                {
                    let mut out = vals.lock().unwrap();
                    if !out.is_empty() {
                        assert_eq!(out.len(), total_vals);
                    }
                    out.clear();
                    out.reserve(total_vals);
                    for shard in &shards {
                        out.extend_from_slice(shard.vals.as_slice());
                    }
                }
                if let Some(lens) = &lens {
                    let mut out = lens.lock().unwrap();
                    out.clear();
                    for shard in &shards {
                        out.extend_from_slice(shard.lens.as_slice());
                    }
                }

                if let Some(cb) = cb {
                    cb();
                }
            }),
        );
        Ok(ts)
    }
}

impl<V: Scalar> KVWorkerInner<V> {
    fn add_callback(&self, timestamp: i32, cb: Callback) {
        self.callbacks.lock().unwrap().insert(timestamp, cb);
    }

    fn run_callback(&self, timestamp: i32) {
        let cb = self.callbacks.lock().unwrap().remove(&timestamp);
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Slices the request over the server ranges and sends one message per
    /// non-empty shard. Empty shards are pre-counted as responses, since no
    /// reply will ever arrive for them.
    fn send(
        &self,
        timestamp: i32,
        push: bool,
        pull: bool,
        cmd: i32,
        kvs: &KVPairs<V>,
    ) -> Result<(), PsError> {
        assert!(
            kvs.keys.windows(2).all(|pair| pair[0] < pair[1]),
            "keys must be unique and strictly increasing"
        );

        let ranges = self.po.get_server_ranges();
        let sliced = (self.slicer.lock().unwrap())(kvs, &ranges);

        let customer = self
            .customer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PsError::msg("app is shutting down"))?;

        let skipped = sliced.iter().filter(|(keep, _)| !keep).count();
        customer.add_response(timestamp, skipped);
        if skipped == sliced.len() {
            // nothing will be sent, so nothing will ever call back
            self.run_callback(timestamp);
        }

        for (rank, (keep, shard)) in sliced.iter().enumerate() {
            if !keep {
                continue;
            }
            let mut msg = Message::default();
            msg.meta.app_id = customer.app_id();
            msg.meta.customer_id = customer.customer_id();
            msg.meta.request = true;
            msg.meta.push = push;
            msg.meta.pull = pull;
            msg.meta.head = cmd;
            msg.meta.timestamp = timestamp;
            msg.meta.receiver = server_rank_to_id(rank);
            msg.meta.priority = kvs.priority;
            if !shard.keys.is_empty() {
                msg.add_data(&shard.keys);
                msg.add_data(&shard.vals);
                if !shard.lens.is_empty() {
                    msg.add_data(&shard.lens);
                }
            }
            self.po.van().send(msg)?;
        }
        Ok(())
    }

    /// Runs on every dispatched message: buffer pull replies, and fire the
    /// completion callback when this reply is the last one outstanding (the
    /// dispatcher increments the response count right after us, hence the
    /// `- 1`).
    fn on_receive(inner: &Arc<Self>, msg: Message) {
        if msg.meta.simple_app {
            pf_debug!("simple_app msg reached KV worker, ignored");
            return;
        }
        let ts = msg.meta.timestamp;

        if msg.meta.pull && !msg.data.is_empty() {
            let kvs = match decode_kv_payload::<V>(&msg) {
                Ok(kvs) => kvs,
                Err(e) => {
                    pf_error!("malformed pull reply dropped: {}", e);
                    return;
                }
            };
            inner.recv_kvs.lock().unwrap().entry(ts).or_default().push(kvs);
        }

        let customer = inner.customer.lock().unwrap().clone();
        let Some(customer) = customer else {
            return;
        };
        if customer.response_count(ts) == inner.po.num_servers() - 1 {
            inner.run_callback(ts);
        }
    }
}

/// Metadata of one KV request as seen by server handlers.
#[derive(Debug, Clone)]
pub struct KVMeta {
    /// User-defined command.
    pub cmd: i32,

    /// Request writes values into the store.
    pub push: bool,

    /// Request reads values back out.
    pub pull: bool,

    /// Requesting node's id.
    pub sender: i32,

    /// Request timestamp; echoed in the response.
    pub timestamp: i32,

    /// Requesting customer's id; echoed in the response.
    pub customer_id: i32,
}

/// Handler run on every KV request a server receives.
pub type ReqHandle<V> =
    Arc<dyn Fn(&KVMeta, &KVPairs<V>, &KVServer<V>) + Send + Sync>;

struct KVServerInner<V: Scalar> {
    po: Arc<PostOffice>,
    app_id: i32,
    customer: Mutex<Option<Arc<Customer>>>,
    request_handle: Mutex<Option<ReqHandle<V>>>,
}

impl<V: Scalar> Drop for KVServerInner<V> {
    fn drop(&mut self) {
        // a server's customer id equals its app id
        self.po.remove_customer(self.app_id, self.app_id);
    }
}

/// Server-side handle owning one shard of the key space.
pub struct KVServer<V: Scalar> {
    inner: Arc<KVServerInner<V>>,
}

impl<V: Scalar> KVServer<V> {
    /// Creates a server app; its customer id is the app id, so worker-side
    /// customer ids never influence server-side dispatch.
    pub fn new(
        po: Arc<PostOffice>,
        app_id: i32,
    ) -> Result<KVServer<V>, PsError> {
        let inner = Arc::new(KVServerInner {
            po: po.clone(),
            app_id,
            customer: Mutex::new(None),
            request_handle: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let customer = Customer::new(
            po,
            app_id,
            app_id,
            Box::new(move |msg| {
                if let Some(inner) = weak.upgrade() {
                    KVServer { inner }.on_receive(msg);
                }
            }),
        )?;
        *inner.customer.lock().unwrap() = Some(customer);

        Ok(KVServer { inner })
    }

    /// Installs the request handler. Must be set before any worker traffic
    /// arrives.
    pub fn set_request_handle(
        &self,
        handle: impl Fn(&KVMeta, &KVPairs<V>, &KVServer<V>) + Send + Sync + 'static,
    ) {
        *self.inner.request_handle.lock().unwrap() = Some(Arc::new(handle));
    }

    /// Sends the response to one handled request. Push-only requests reply
    /// with an empty payload; pull replies echo the requested keys.
    pub fn response(
        &self,
        req: &KVMeta,
        res: KVPairs<V>,
    ) -> Result<(), PsError> {
        let customer = self
            .inner
            .customer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PsError::msg("app is shutting down"))?;

        let mut msg = Message::default();
        msg.meta.app_id = customer.app_id();
        msg.meta.customer_id = req.customer_id;
        msg.meta.request = false;
        msg.meta.push = req.push;
        msg.meta.pull = req.pull;
        msg.meta.head = req.cmd;
        msg.meta.timestamp = req.timestamp;
        msg.meta.receiver = req.sender;
        if !res.keys.is_empty() {
            msg.add_data(&res.keys);
            msg.add_data(&res.vals);
            if !res.lens.is_empty() {
                msg.add_data(&res.lens);
            }
        }
        self.inner.po.van().send(msg)?;
        Ok(())
    }

    fn on_receive(&self, msg: Message) {
        if msg.meta.simple_app {
            pf_debug!("simple_app msg reached KV server, ignored");
            return;
        }

        let meta = KVMeta {
            cmd: msg.meta.head,
            push: msg.meta.push,
            pull: msg.meta.pull,
            sender: msg.meta.sender,
            timestamp: msg.meta.timestamp,
            customer_id: msg.meta.customer_id,
        };
        let data = if msg.data.is_empty() {
            KVPairs::default()
        } else {
            match decode_kv_payload::<V>(&msg) {
                Ok(kvs) => kvs,
                Err(e) => {
                    pf_error!("malformed KV request dropped: {}", e);
                    return;
                }
            }
        };

        let handle = self.inner.request_handle.lock().unwrap().clone();
        match handle {
            Some(handle) => handle(&meta, &data, self),
            None => {
                pf_error!("no request handle set, KV request dropped");
            }
        }
    }
}

/// Default server handler: an additive in-memory store. Push adds each
/// value into its key's slot; pull reads the slots back out.
pub struct KVServerDefaultHandle<V> {
    store: Mutex<HashMap<Key, V>>,
}

impl<V: Scalar + AddAssign + Default> KVServerDefaultHandle<V> {
    pub fn new() -> Self {
        KVServerDefaultHandle {
            store: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(
        &self,
        req: &KVMeta,
        data: &KVPairs<V>,
        server: &KVServer<V>,
    ) {
        let n = data.keys.len();
        let mut res = KVPairs::default();
        if !req.pull {
            assert_eq!(n, data.vals.len());
        } else {
            res.keys = data.keys.clone();
        }

        let mut store = self.store.lock().unwrap();
        let mut out = Vec::with_capacity(if req.pull { n } else { 0 });
        for i in 0..n {
            let key = data.keys[i];
            if req.push {
                *store.entry(key).or_default() += data.vals[i];
            }
            if req.pull {
                out.push(store.get(&key).copied().unwrap_or_default());
            }
        }
        drop(store);

        if req.pull {
            res.vals = SArray::from_vec(out);
        }
        if let Err(e) = server.response(req, res) {
            pf_warn!("error responding to {}: {}", req.sender, e);
        }
    }
}

impl<V: Scalar + AddAssign + Default> Default for KVServerDefaultHandle<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the typed KV triple out of a data message's payload slices.
fn decode_kv_payload<V: Scalar>(msg: &Message) -> Result<KVPairs<V>, PsError> {
    if msg.data.len() < 2 || msg.data.len() > 3 {
        return logged_err!(
            "KV message carries {} payload slices",
            msg.data.len()
        );
    }
    let mut kvs = KVPairs::<V> {
        keys: sarray_from_bytes(msg.keys())?,
        vals: sarray_from_bytes(msg.values())?,
        ..Default::default()
    };
    if msg.data.len() == 3 {
        kvs.lens = sarray_from_bytes(msg.lens())?;
        if kvs.lens.len() != kvs.keys.len() {
            return logged_err!(
                "{} lens for {} keys",
                kvs.lens.len(),
                kvs.keys.len()
            );
        }
    }
    Ok(kvs)
}

/// Index range of `keys` falling inside `[begin, end)`.
fn find_range(keys: &SArray<Key>, begin: Key, end: Key) -> (usize, usize) {
    let lo = keys.partition_point(|&k| k < begin);
    let hi = keys.partition_point(|&k| k < end);
    (lo, hi)
}

/// Default slicer: binary-search the sorted keys against the contiguous
/// server ranges, then split the values by stride (or by per-key lengths
/// when given). Shards with no keys are marked skippable.
pub fn default_slicer<V: Scalar>(
    send: &KVPairs<V>,
    ranges: &[Range],
) -> SlicedKVs<V> {
    let num = ranges.len();
    let keys = send.keys.as_slice();

    // cut positions; the last range is closed at the top of the key space,
    // so it simply takes every remaining key
    let mut pos = Vec::with_capacity(num + 1);
    pos.push(keys.partition_point(|&k| k < ranges[0].begin));
    for (i, range) in ranges.iter().enumerate() {
        if i > 0 {
            assert_eq!(
                ranges[i - 1].end,
                range.begin,
                "server ranges must tile contiguously"
            );
        }
        let next = if i + 1 == num {
            keys.len()
        } else {
            keys.partition_point(|&k| k < range.end)
        };
        pos.push(next);
    }
    assert_eq!(pos[0], 0, "keys below the first server range");

    let mut sliced: SlicedKVs<V> = Vec::with_capacity(num);
    if keys.is_empty() {
        sliced.resize_with(num, || (false, KVPairs::default()));
        return sliced;
    }

    // value stride when lens are absent
    let stride = if send.lens.is_empty() {
        let stride = send.vals.len() / keys.len();
        assert_eq!(
            stride * keys.len(),
            send.vals.len(),
            "values not divisible over keys"
        );
        stride
    } else {
        assert_eq!(send.lens.len(), keys.len());
        0
    };

    let mut val_begin = 0;
    for i in 0..num {
        if pos[i + 1] == pos[i] {
            sliced.push((false, KVPairs::default()));
            continue;
        }
        let mut shard = KVPairs::<V> {
            keys: send.keys.segment(pos[i], pos[i + 1]),
            priority: send.priority,
            ..Default::default()
        };
        if send.vals.is_empty() {
            // pure pull: no values travel with the request
        } else if send.lens.is_empty() {
            shard.vals =
                send.vals.segment(pos[i] * stride, pos[i + 1] * stride);
        } else {
            shard.lens = send.lens.segment(pos[i], pos[i + 1]);
            let val_end = val_begin
                + shard
                    .lens
                    .iter()
                    .map(|&len| len as usize)
                    .sum::<usize>();
            shard.vals = send.vals.segment(val_begin, val_end);
            val_begin = val_end;
        }
        sliced.push((true, shard));
    }
    sliced
}

#[cfg(test)]
mod slicer_tests {
    use super::*;

    fn ranges(cuts: &[Key]) -> Vec<Range> {
        cuts.windows(2)
            .map(|pair| Range::new(pair[0], pair[1]))
            .collect()
    }

    #[test]
    fn partitions_without_loss_or_overlap() {
        let send = KVPairs::<f32> {
            keys: SArray::from_vec(vec![1, 5, 9, 14, 20, 30]),
            vals: SArray::from_vec(vec![
                0.1, 0.5, 0.9, 1.4, 2.0, 3.0,
            ]),
            ..Default::default()
        };
        let sliced = default_slicer(&send, &ranges(&[0, 10, 20, Key::MAX]));

        assert_eq!(sliced.len(), 3);
        assert!(sliced.iter().all(|(keep, _)| *keep));
        assert_eq!(sliced[0].1.keys.as_slice(), &[1, 5, 9]);
        assert_eq!(sliced[1].1.keys.as_slice(), &[14]);
        assert_eq!(sliced[2].1.keys.as_slice(), &[20, 30]);

        let total: usize =
            sliced.iter().map(|(_, kv)| kv.keys.len()).sum();
        assert_eq!(total, send.keys.len());
        assert_eq!(sliced[0].1.vals.as_slice(), &[0.1, 0.5, 0.9]);
        assert_eq!(sliced[2].1.vals.as_slice(), &[2.0, 3.0]);
    }

    #[test]
    fn empty_shards_marked_skippable() {
        let send = KVPairs::<u32> {
            keys: SArray::from_vec(vec![25, 26]),
            vals: SArray::from_vec(vec![1, 2]),
            ..Default::default()
        };
        let sliced = default_slicer(&send, &ranges(&[0, 10, 20, Key::MAX]));
        assert!(!sliced[0].0);
        assert!(!sliced[1].0);
        assert!(sliced[2].0);
        assert_eq!(sliced[2].1.keys.as_slice(), &[25, 26]);
    }

    #[test]
    fn multi_value_stride() {
        let send = KVPairs::<f64> {
            keys: SArray::from_vec(vec![3, 12]),
            vals: SArray::from_vec(vec![0.3, 0.31, 1.2, 1.21]),
            ..Default::default()
        };
        let sliced = default_slicer(&send, &ranges(&[0, 10, Key::MAX]));
        assert_eq!(sliced[0].1.vals.as_slice(), &[0.3, 0.31]);
        assert_eq!(sliced[1].1.vals.as_slice(), &[1.2, 1.21]);
    }

    #[test]
    fn per_key_lens_drive_value_split() {
        let send = KVPairs::<i32> {
            keys: SArray::from_vec(vec![3, 5, 12]),
            vals: SArray::from_vec(vec![30, 31, 50, 120, 121, 122]),
            lens: SArray::from_vec(vec![2, 1, 3]),
            ..Default::default()
        };
        let sliced = default_slicer(&send, &ranges(&[0, 10, Key::MAX]));
        assert_eq!(sliced[0].1.vals.as_slice(), &[30, 31, 50]);
        assert_eq!(sliced[0].1.lens.as_slice(), &[2, 1]);
        assert_eq!(sliced[1].1.vals.as_slice(), &[120, 121, 122]);
        assert_eq!(sliced[1].1.lens.as_slice(), &[3]);
    }

    #[test]
    fn empty_request_yields_all_skips() {
        let send = KVPairs::<f32>::default();
        let sliced = default_slicer(&send, &ranges(&[0, 10, Key::MAX]));
        assert_eq!(sliced.len(), 2);
        assert!(sliced.iter().all(|(keep, _)| !keep));
    }

    #[test]
    fn find_range_maps_back_to_request_indexes() {
        let keys = SArray::from_vec(vec![2u64, 4, 8, 16, 32]);
        assert_eq!(find_range(&keys, 4, 17), (1, 4));
        assert_eq!(find_range(&keys, 0, 2), (0, 0));
        assert_eq!(find_range(&keys, 33, 50), (5, 5));
    }
}

#[cfg(test)]
mod kv_e2e_tests {
    use super::*;
    use crate::internal::env::Environment;
    use crate::WORKER_GROUP;

    fn cluster_env(
        role: &str,
        sched_port: u16,
        workers: usize,
        servers: usize,
        extra: &[(&str, &str)],
    ) -> Environment {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut env = Environment::from_pairs([
            ("PS_ROLE", role.to_string()),
            ("PS_NUM_WORKER", workers.to_string()),
            ("PS_NUM_SERVER", servers.to_string()),
            ("PS_SCHEDULER_URI", "127.0.0.1".to_string()),
            ("PS_SCHEDULER_PORT", sched_port.to_string()),
        ]);
        for (key, value) in extra {
            env.insert(*key, *value);
        }
        env
    }

    async fn run_scheduler(
        sched_port: u16,
        workers: usize,
        servers: usize,
        extra: Vec<(String, String)>,
    ) -> Result<(), PsError> {
        let extra: Vec<(&str, &str)> = extra
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let po = PostOffice::new(cluster_env(
            "scheduler", sched_port, workers, servers, &extra,
        ))?;
        po.start(0, true).await?;
        po.finalize(0, true).await?;
        Ok(())
    }

    async fn run_server(
        sched_port: u16,
        workers: usize,
        servers: usize,
        extra: Vec<(String, String)>,
    ) -> Result<(), PsError> {
        let extra: Vec<(&str, &str)> = extra
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let po = PostOffice::new(cluster_env(
            "server", sched_port, workers, servers, &extra,
        ))?;
        po.start(0, true).await?;
        let server = KVServer::<f64>::new(po.clone(), 0)?;
        let handle = Arc::new(KVServerDefaultHandle::<f64>::new());
        server.set_request_handle(move |req, data, server| {
            handle.handle(req, data, server)
        });
        po.finalize(0, true).await?;
        drop(server);
        Ok(())
    }

    fn owned(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// One worker pushes three pairs to one server and pulls them back.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_server_echo() -> Result<(), PsError> {
        const SCHED_PORT: u16 = 37101;
        let sched =
            tokio::spawn(run_scheduler(SCHED_PORT, 1, 1, Vec::new()));
        let server = tokio::spawn(run_server(SCHED_PORT, 1, 1, Vec::new()));

        let po =
            PostOffice::new(cluster_env("worker", SCHED_PORT, 1, 1, &[]))?;
        po.start(0, true).await?;
        let kv = KVWorker::<f64>::new(po.clone(), 0, 0)?;

        let keys = vec![0u64, 1, 2];
        let vals = vec![10.0, 20.0, 30.0];
        let ts = kv.push(&keys, &vals, None, 0, None, 0)?;
        kv.wait(ts).await?;

        let out = Arc::new(Mutex::new(Vec::new()));
        let ts = kv.pull(&keys, out.clone(), None, 0, None, 0)?;
        kv.wait(ts).await?;
        assert_eq!(*out.lock().unwrap(), vals);

        po.finalize(0, true).await?;
        drop(kv);
        sched.await??;
        server.await??;
        Ok(())
    }

    /// Three workers repeatedly push onto shared keys across two servers;
    /// after a worker-group barrier, each pulls the summed values.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn sharded_sum() -> Result<(), PsError> {
        const SCHED_PORT: u16 = 37201;
        const NUM_KEYS: usize = 100;
        const REPEAT: usize = 10;
        const WORKERS: usize = 3;
        const SERVERS: usize = 2;

        let sched =
            tokio::spawn(run_scheduler(SCHED_PORT, WORKERS, SERVERS, Vec::new()));
        let mut servers = Vec::new();
        for _ in 0..SERVERS {
            servers.push(tokio::spawn(run_server(
                SCHED_PORT,
                WORKERS,
                SERVERS,
                Vec::new(),
            )));
        }

        // keys spread across the whole key space so both servers own some
        let keys: Vec<Key> = (0..NUM_KEYS)
            .map(|i| Key::MAX / NUM_KEYS as Key * i as Key)
            .collect();

        let mut workers = Vec::new();
        for c in 0..WORKERS {
            let keys = keys.clone();
            workers.push(tokio::spawn(async move {
                let po = PostOffice::new(cluster_env(
                    "worker", SCHED_PORT, WORKERS, SERVERS, &[],
                ))?;
                po.start(0, true).await?;
                let kv = KVWorker::<f64>::new(po.clone(), 0, 0)?;

                let vals: Vec<f64> =
                    (0..NUM_KEYS).map(|i| 5.0 * (i + c) as f64).collect();
                let mut pending = Vec::new();
                for _ in 0..REPEAT {
                    pending.push(kv.push(&keys, &vals, None, 0, None, 0)?);
                }
                for ts in pending {
                    kv.wait(ts).await?;
                }

                // all pushes from all workers land before anyone pulls
                po.barrier(0, WORKER_GROUP).await?;

                let out = Arc::new(Mutex::new(Vec::new()));
                let ts = kv.pull(&keys, out.clone(), None, 0, None, 0)?;
                kv.wait(ts).await?;

                {
                    let out = out.lock().unwrap();
                    for i in 0..NUM_KEYS {
                        let expect: f64 = (0..WORKERS)
                            .map(|w| REPEAT as f64 * 5.0 * (i + w) as f64)
                            .sum();
                        assert!(
                            (out[i] - expect).abs() < 1e-9,
                            "key {}: got {}, want {}",
                            i,
                            out[i],
                            expect
                        );
                    }
                }

                po.finalize(0, true).await?;
                drop(kv);
                Ok::<(), PsError>(())
            }));
        }

        for worker in workers {
            worker.await??;
        }
        for server in servers {
            server.await??;
        }
        sched.await??;
        Ok(())
    }

    /// Push-pull returns the post-update values atomically per request.
    #[tokio::test(flavor = "multi_thread", worker_threads = 6)]
    async fn push_pull_accumulates() -> Result<(), PsError> {
        const SCHED_PORT: u16 = 37301;
        const NUM_KEYS: usize = 50;
        const REPEAT: usize = 20;
        const WORKERS: usize = 2;

        let sched =
            tokio::spawn(run_scheduler(SCHED_PORT, WORKERS, 1, Vec::new()));
        let server =
            tokio::spawn(run_server(SCHED_PORT, WORKERS, 1, Vec::new()));

        let mut workers = Vec::new();
        for _ in 0..WORKERS {
            workers.push(tokio::spawn(async move {
                let po = PostOffice::new(cluster_env(
                    "worker", SCHED_PORT, WORKERS, 1, &[],
                ))?;
                po.start(0, true).await?;
                let kv = KVWorker::<f64>::new(po.clone(), 0, 0)?;

                // rank-disjoint keys keep each worker's sums deterministic
                let rank = po.my_rank() as Key;
                let keys: Vec<Key> =
                    (0..NUM_KEYS).map(|i| i as Key * 10 + rank).collect();
                let vals: Vec<f64> =
                    (0..NUM_KEYS).map(|i| (i + 1) as f64).collect();

                let mut pending = Vec::new();
                for _ in 0..REPEAT {
                    pending.push(kv.push(&keys, &vals, None, 0, None, 0)?);
                }
                for ts in pending {
                    kv.wait(ts).await?;
                }

                let out = Arc::new(Mutex::new(Vec::new()));
                for _ in 0..REPEAT {
                    let ts = kv.push_pull(
                        &keys,
                        &vals,
                        out.clone(),
                        None,
                        0,
                        None,
                        0,
                    )?;
                    kv.wait(ts).await?;
                }

                {
                    let out = out.lock().unwrap();
                    for i in 0..NUM_KEYS {
                        let expect = 2.0 * REPEAT as f64 * (i + 1) as f64;
                        assert!(
                            (out[i] - expect).abs() < 1e-9,
                            "key {}: got {}, want {}",
                            i,
                            out[i],
                            expect
                        );
                    }
                }

                po.finalize(0, true).await?;
                drop(kv);
                Ok::<(), PsError>(())
            }));
        }

        for worker in workers {
            worker.await??;
        }
        server.await??;
        sched.await??;
        Ok(())
    }

    /// A server handler keeping variable-length values per key: the store
    /// replaces on push and echoes values + lengths on pull.
    fn replace_store_handle(
        store: Arc<Mutex<HashMap<Key, Vec<f64>>>>,
    ) -> impl Fn(&KVMeta, &KVPairs<f64>, &KVServer<f64>) {
        move |req, data, server| {
            let mut store = store.lock().unwrap();
            if req.push {
                let mut offset = 0;
                for i in 0..data.keys.len() {
                    let len = data.lens[i] as usize;
                    store.insert(
                        data.keys[i],
                        data.vals.as_slice()[offset..offset + len].to_vec(),
                    );
                    offset += len;
                }
            }
            let mut res = KVPairs::default();
            if req.pull {
                res.keys = data.keys.clone();
                let mut vals = Vec::new();
                let mut lens = Vec::new();
                for &key in data.keys.as_slice() {
                    let stored =
                        store.get(&key).cloned().unwrap_or_default();
                    lens.push(stored.len() as i32);
                    vals.extend_from_slice(&stored);
                }
                res.vals = SArray::from_vec(vals);
                res.lens = SArray::from_vec(lens);
            }
            server.response(req, res).unwrap();
        }
    }

    /// Per-key value lengths survive the shard/reassemble round trip.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn variable_length_values() -> Result<(), PsError> {
        const SCHED_PORT: u16 = 37401;
        const SERVERS: usize = 2;
        let sched =
            tokio::spawn(run_scheduler(SCHED_PORT, 1, SERVERS, Vec::new()));
        let mut servers = Vec::new();
        for _ in 0..SERVERS {
            servers.push(tokio::spawn(async move {
                let po = PostOffice::new(cluster_env(
                    "server", SCHED_PORT, 1, SERVERS, &[],
                ))?;
                po.start(0, true).await?;
                let server = KVServer::<f64>::new(po.clone(), 0)?;
                let store = Arc::new(Mutex::new(HashMap::new()));
                server.set_request_handle(replace_store_handle(store));
                po.finalize(0, true).await?;
                drop(server);
                Ok::<(), PsError>(())
            }));
        }

        let po = PostOffice::new(cluster_env(
            "worker", SCHED_PORT, 1, SERVERS, &[],
        ))?;
        po.start(0, true).await?;
        let kv = KVWorker::<f64>::new(po.clone(), 0, 0)?;

        // keys straddle both servers' ranges
        let keys = vec![1u64, 2, Key::MAX - 2, Key::MAX - 1];
        let lens = vec![2i32, 1, 1, 2];
        let vals = vec![0.1, 0.2, 1.0, 2.0, 3.0, 3.1];
        let ts = kv.push(&keys, &vals, Some(&lens), 0, None, 0)?;
        kv.wait(ts).await?;

        let out_vals = Arc::new(Mutex::new(Vec::new()));
        let out_lens = Arc::new(Mutex::new(Vec::new()));
        let ts = kv.pull(
            &keys,
            out_vals.clone(),
            Some(out_lens.clone()),
            0,
            None,
            0,
        )?;
        kv.wait(ts).await?;

        assert_eq!(*out_lens.lock().unwrap(), lens);
        let got = out_vals.lock().unwrap();
        assert_eq!(got.len(), vals.len());
        for (g, w) in got.iter().zip(vals.iter()) {
            assert!((g - w).abs() < 1e-9);
        }
        drop(got);

        po.finalize(0, true).await?;
        drop(kv);
        for server in servers {
            server.await??;
        }
        sched.await??;
        Ok(())
    }

    /// The whole stack stays correct when the transport is lossy: resend,
    /// ACK and duplicate suppression recover every message exactly once.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lossy_transport_echo() -> Result<(), PsError> {
        const SCHED_PORT: u16 = 37601;
        let lossy = [
            ("PS_RESEND_TIMEOUT", "100"),
            ("PS_DROP_RATE", "15"),
        ];

        let sched = tokio::spawn(run_scheduler(
            SCHED_PORT,
            1,
            1,
            owned(&lossy),
        ));
        let server =
            tokio::spawn(run_server(SCHED_PORT, 1, 1, owned(&lossy)));

        let po = PostOffice::new(cluster_env(
            "worker", SCHED_PORT, 1, 1, &lossy,
        ))?;
        po.start(0, true).await?;
        let kv = KVWorker::<f64>::new(po.clone(), 0, 0)?;

        let keys: Vec<Key> = (0..20).collect();
        let vals: Vec<f64> = (0..20).map(|i| i as f64).collect();
        for _ in 0..5 {
            let ts = kv.push(&keys, &vals, None, 0, None, 0)?;
            kv.wait(ts).await?;
        }

        let out = Arc::new(Mutex::new(Vec::new()));
        let ts = kv.pull(&keys, out.clone(), None, 0, None, 0)?;
        kv.wait(ts).await?;
        {
            let out = out.lock().unwrap();
            for i in 0..20 {
                // duplicates suppressed: exactly 5 pushes counted
                assert!((out[i] - 5.0 * i as f64).abs() < 1e-9);
            }
        }

        po.finalize(0, true).await?;
        drop(kv);
        server.await??;
        sched.await??;
        Ok(())
    }
}
