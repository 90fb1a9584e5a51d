//! Transport core: node membership, the receive loop, heartbeats, barrier
//! relaying, and retransmission hookup.
//!
//! The Van owns one abstract byte transport and drives the join protocol on
//! top of it: non-scheduler nodes bind, dial the scheduler, announce
//! themselves with ADD_NODE, and spin until the scheduler's broadcast
//! assigns them an id and the addresses of everyone else. All control
//! messages are handled on the single receive task; data messages are routed
//! into the matching customer's queue.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::prelude::*;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

use crate::internal::message::{Command, Message};
use crate::internal::node::{
    server_rank_to_id, worker_rank_to_id, Node, NodeRole, EMPTY,
    SCHEDULER_ID, SERVER_GROUP, WORKER_GROUP,
};
use crate::internal::postoffice::PostOffice;
use crate::internal::resender::Resender;
use crate::internal::tcpvan::TcpTransport;
use crate::utils::{local_ip_toward, PsError};

/// Transport backend selector (`PS_VAN_TYPE`).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum VanKind {
    Tcp,
}

/// Abstract byte transport the Van runs over.
#[async_trait]
pub(crate) trait Transport: Send + Sync {
    /// Binds a listener; retries on random ports in `[10000, 50000)` up to
    /// `max_retry` times. Returns the bound port.
    async fn bind(&self, port: u16, max_retry: u32) -> Result<u16, PsError>;

    /// Opens (or replaces) the outbound connection to a node. Never
    /// connects a worker to another worker nor a server to another server.
    async fn connect(&self, node: &Node, my_node: &Node)
        -> Result<(), PsError>;

    /// Serializes and enqueues one message toward its receiver; the frames
    /// of one message never interleave with another's. Returns bytes sent.
    fn send_msg(&self, msg: &Message, my_id: i32) -> Result<usize, PsError>;

    /// Blocks for the next inbound message and its wire byte count. The
    /// sender's id is already recovered from the identity frame.
    async fn recv_msg(&self) -> Result<(Message, usize), PsError>;

    /// Tears down the listener and every connection.
    fn stop(&self);
}

/// The message transport core of one node.
pub struct Van {
    transport: Arc<dyn Transport>,

    my_node: Mutex<Node>,
    scheduler: Mutex<Node>,

    /// Serializes the staged portion of `start` across customers.
    start_stage: tokio::sync::Mutex<u32>,

    /// Set once the cluster-ready notification has been processed.
    ready: AtomicBool,

    /// Monotonic message timestamp counter, doubling as request ids.
    timestamp: AtomicI32,

    send_bytes: AtomicU64,
    receive_bytes: AtomicU64,

    /// Seconds without a heartbeat before a node counts as dead.
    heartbeat_timeout_sec: AtomicI32,

    /// Debug probability (percent) of dropping received messages.
    drop_rate: AtomicI32,

    /// Scheduler-side barrier entry counts, indexed by group id.
    barrier_count: Mutex<[usize; 8]>,

    /// Addresses already connected, mapped to their node ids.
    connected_nodes: Mutex<HashMap<String, i32>>,

    /// Duplicate-assignment map for co-resident customers: the id a shared
    /// address would have gotten, mapped to the id it actually carries.
    shared_node_mapping: Mutex<HashMap<i32, i32>>,

    resender: Mutex<Option<Arc<Resender>>>,

    receive_handle: Mutex<Option<JoinHandle<()>>>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Van {
    /// Creates a Van over the given transport backend.
    pub(crate) fn new(kind: VanKind) -> Self {
        let transport: Arc<dyn Transport> = match kind {
            VanKind::Tcp => Arc::new(TcpTransport::new()),
        };
        Van {
            transport,
            my_node: Mutex::new(Node::new(NodeRole::Worker)),
            scheduler: Mutex::new(Node::new(NodeRole::Scheduler)),
            start_stage: tokio::sync::Mutex::new(0),
            ready: AtomicBool::new(false),
            timestamp: AtomicI32::new(0),
            send_bytes: AtomicU64::new(0),
            receive_bytes: AtomicU64::new(0),
            heartbeat_timeout_sec: AtomicI32::new(0),
            drop_rate: AtomicI32::new(0),
            barrier_count: Mutex::new([0; 8]),
            connected_nodes: Mutex::new(HashMap::new()),
            shared_node_mapping: Mutex::new(HashMap::new()),
            resender: Mutex::new(None),
            receive_handle: Mutex::new(None),
            heartbeat_handle: Mutex::new(None),
        }
    }

    /// This node's identity (id is `EMPTY` until assigned).
    pub fn my_node(&self) -> Node {
        self.my_node.lock().unwrap().clone()
    }

    /// True once the join handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Hands out the next message timestamp / request id.
    pub fn available_timestamp(&self) -> i32 {
        self.timestamp.fetch_add(1, Ordering::SeqCst)
    }

    /// Total wire bytes sent so far.
    pub fn send_bytes(&self) -> u64 {
        self.send_bytes.load(Ordering::Relaxed)
    }

    /// Total wire bytes received so far.
    pub fn receive_bytes(&self) -> u64 {
        self.receive_bytes.load(Ordering::Relaxed)
    }

    /// Sends one message, accounting bytes and registering it with the
    /// resender (when retransmission is enabled). Membership traffic is not
    /// tracked: nodes without an assigned id cannot produce matching ACK
    /// signatures, so the join handshake stays its own delivery domain.
    pub fn send(&self, msg: Message) -> Result<usize, PsError> {
        let my_id = self.my_node.lock().unwrap().id;
        let sent = self.transport.send_msg(&msg, my_id)?;
        self.send_bytes.fetch_add(sent as u64, Ordering::Relaxed);

        if self.is_ready() && msg.meta.control.cmd != Command::AddNode {
            let resender = self.resender.lock().unwrap().clone();
            if let Some(resender) = resender {
                resender.on_send(my_id, &msg);
            }
        }
        pf_trace!(
            "sent msg ({}B) -> {} cmd {:?} ts {}",
            sent,
            msg.meta.receiver,
            msg.meta.control.cmd,
            msg.meta.timestamp
        );
        Ok(sent)
    }

    /// Performs the node's share of the join protocol. Idempotent across
    /// customers of the same process: binding, dialing the scheduler and
    /// spawning the receive loop happen once; each customer announces
    /// itself and waits for the cluster-ready notification.
    pub(crate) async fn start(
        &self,
        po: &Arc<PostOffice>,
        customer_id: i32,
    ) -> Result<(), PsError> {
        {
            let mut stage = self.start_stage.lock().await;
            if *stage == 0 {
                let env = po.env();

                let mut scheduler = Node::new(NodeRole::Scheduler);
                scheduler.id = SCHEDULER_ID;
                scheduler.hostname = env.get_or_fail("PS_SCHEDULER_URI")?;
                scheduler.port =
                    env.get_int_or_fail("PS_SCHEDULER_PORT")?.try_into()?;
                *self.scheduler.lock().unwrap() = scheduler.clone();

                let mut me = if po.is_scheduler() {
                    scheduler.clone()
                } else {
                    let mut node = Node::new(if po.is_server() {
                        NodeRole::Server
                    } else {
                        NodeRole::Worker
                    });
                    node.customer_id = customer_id;
                    node.hostname = match env.get("PS_NODE_HOST") {
                        Some(host) => host,
                        None => {
                            if let Some(itf) = env.get("PS_INTERFACE") {
                                pf_warn!(
                                    "PS_INTERFACE '{}' ignored, using the \
                                     default-route address",
                                    itf
                                );
                            }
                            local_ip_toward(
                                &scheduler.hostname,
                                scheduler.port,
                            )?
                        }
                    };
                    node.port = env.get_int("PS_PORT")?.try_into()?;
                    node
                };

                self.heartbeat_timeout_sec.store(
                    env.get_int("PS_HEARTBEAT_TIMEOUT")?,
                    Ordering::Relaxed,
                );
                self.drop_rate
                    .store(env.get_int("PS_DROP_RATE")?, Ordering::Relaxed);

                // the scheduler must sit at its well-known port
                let max_retry = if po.is_scheduler() { 0 } else { 30 };
                me.port = self.transport.bind(me.port, max_retry).await?;
                pf_info!("node binds successfully: {}", me.addr());
                *self.my_node.lock().unwrap() = me.clone();

                self.transport.connect(&scheduler, &me).await?;
                self.connected_nodes
                    .lock()
                    .unwrap()
                    .insert(scheduler.addr(), SCHEDULER_ID);

                // the resender must observe the whole message stream, or a
                // message processed before it exists could be double
                // counted when its retransmission arrives later
                let resend_timeout = env.get_int("PS_RESEND_TIMEOUT")?;
                if resend_timeout > 0 {
                    *self.resender.lock().unwrap() =
                        Some(Resender::new(resend_timeout as u64, 10, po));
                }

                let receive = tokio::spawn(Self::receive_loop(po.clone()));
                *self.receive_handle.lock().unwrap() = Some(receive);

                *stage = 1;
            }
        }

        // every customer (except the scheduler's) announces itself
        if !po.is_scheduler() {
            let mut msg = Message::default();
            msg.meta.receiver = SCHEDULER_ID;
            msg.meta.control.cmd = Command::AddNode;
            msg.meta.control.nodes.push(self.my_node());
            msg.meta.timestamp = self.available_timestamp();
            self.send(msg)?;
        }

        while !self.is_ready() {
            time::sleep(Duration::from_millis(100)).await;
        }

        {
            let mut stage = self.start_stage.lock().await;
            if *stage == 1 {
                let env = po.env();

                let hb_interval = env.get_int("PS_HEARTBEAT_INTERVAL")?;
                if !po.is_scheduler() && hb_interval > 0 {
                    let heartbeat = tokio::spawn(Self::heartbeat_loop(
                        po.clone(),
                        hb_interval as u64,
                    ));
                    *self.heartbeat_handle.lock().unwrap() = Some(heartbeat);
                }

                *stage = 2;
            }
        }
        Ok(())
    }

    /// Shuts the Van down: terminates the receive loop via a self-addressed
    /// TERMINATE, stops heartbeat and retransmission, and resets all
    /// connection state.
    pub(crate) async fn stop(&self) {
        let my_id = self.my_node.lock().unwrap().id;
        let mut term = Message::default();
        term.meta.receiver = my_id;
        // the receive loop is shared by all customers; customer 0 owns it
        term.meta.customer_id = 0;
        term.meta.control.cmd = Command::Terminate;
        if let Err(e) = self.transport.send_msg(&term, my_id) {
            pf_warn!("error sending terminate msg to self: {}", e);
        }

        let receive = self.receive_handle.lock().unwrap().take();
        if let Some(receive) = receive {
            let _ = receive.await;
        }
        let heartbeat = self.heartbeat_handle.lock().unwrap().take();
        if let Some(heartbeat) = heartbeat {
            // exits on its own now that ready is false
            let _ = heartbeat.await;
        }
        let resender = self.resender.lock().unwrap().take();
        if let Some(resender) = resender {
            resender.stop().await;
        }

        *self.start_stage.lock().await = 0;
        self.ready.store(false, Ordering::Release);
        self.timestamp.store(0, Ordering::SeqCst);
        self.send_bytes.store(0, Ordering::Relaxed);
        self.receive_bytes.store(0, Ordering::Relaxed);
        *self.barrier_count.lock().unwrap() = [0; 8];
        self.connected_nodes.lock().unwrap().clear();
        self.shared_node_mapping.lock().unwrap().clear();
        self.my_node.lock().unwrap().id = EMPTY;
        self.transport.stop();
    }

    /// Emulates an abrupt node death: all activity ceases without any
    /// goodbye traffic, leaving peers to notice via stale heartbeats.
    #[cfg(test)]
    pub(crate) fn crash(&self) {
        self.ready.store(false, Ordering::Release);
        if let Some(heartbeat) = self.heartbeat_handle.lock().unwrap().take()
        {
            heartbeat.abort();
        }
        if let Some(receive) = self.receive_handle.lock().unwrap().take() {
            receive.abort();
        }
        let resender = self.resender.lock().unwrap().take();
        if let Some(resender) = resender {
            if let Some(handle) = resender.scan_handle_for_test() {
                handle.abort();
            }
        }
        self.transport.stop();
    }

    // --- receive loop and per-command handlers ---

    async fn receive_loop(po: Arc<PostOffice>) {
        let van = po.van();
        // membership bookkeeping lives on the receive task
        let mut registered_nodes: Vec<Node> = Vec::new();
        let mut recovered_nodes: Vec<Node> = Vec::new();

        loop {
            let (mut msg, nbytes) = match van.transport.recv_msg().await {
                Ok(received) => received,
                Err(e) => {
                    pf_error!("receive loop terminating: {}", e);
                    break;
                }
            };
            msg.meta.receiver = van.my_node.lock().unwrap().id;

            // random drop for debugging; the join handshake and the local
            // shutdown signal are exempt
            let drop_rate = van.drop_rate.load(Ordering::Relaxed);
            if van.is_ready()
                && drop_rate > 0
                && drop_rate < 100
                && msg.meta.control.cmd != Command::Terminate
            {
                if thread_rng().gen_range(0..100) < drop_rate {
                    pf_warn!(
                        "dropped msg from {} on purpose (ts {})",
                        msg.meta.sender,
                        msg.meta.timestamp
                    );
                    continue;
                }
            }

            van.receive_bytes
                .fetch_add(nbytes as u64, Ordering::Relaxed);
            pf_trace!(
                "received msg ({}B) <- {} cmd {:?} ts {}",
                nbytes,
                msg.meta.sender,
                msg.meta.control.cmd,
                msg.meta.timestamp
            );

            // duplicate suppression and ACK consumption
            let resender = van.resender.lock().unwrap().clone();
            if let Some(resender) = resender {
                let my_id = msg.meta.receiver;
                let skip = resender.on_receive(my_id, &msg, |ack| {
                    if let Err(e) = van.send(ack) {
                        pf_warn!("error sending ack: {}", e);
                    }
                });
                if skip {
                    continue;
                }
            }

            if msg.meta.control.is_empty() {
                van.handle_data_msg(&po, msg).await;
            } else {
                match msg.meta.control.cmd {
                    Command::AddNode => {
                        if let Err(e) = van
                            .handle_add_node(
                                &po,
                                msg,
                                &mut registered_nodes,
                                &mut recovered_nodes,
                            )
                            .await
                        {
                            pf_error!("error handling ADD_NODE: {}", e);
                        }
                    }
                    Command::Barrier => {
                        if let Err(e) = van.handle_barrier(&po, &msg) {
                            pf_error!("error handling BARRIER: {}", e);
                        }
                    }
                    Command::Heartbeat => {
                        van.handle_heartbeat(&po, &msg);
                    }
                    Command::Terminate => {
                        pf_info!(
                            "{} terminated",
                            van.my_node.lock().unwrap().short_debug()
                        );
                        van.ready.store(false, Ordering::Release);
                        break;
                    }
                    Command::Empty | Command::Ack => {
                        pf_warn!(
                            "dropped msg with invalid command from {}",
                            msg.meta.sender
                        );
                    }
                }
            }
        }
    }

    async fn handle_add_node(
        &self,
        po: &Arc<PostOffice>,
        msg: Message,
        registered_nodes: &mut Vec<Node>,
        recovered_nodes: &mut Vec<Node>,
    ) -> Result<(), PsError> {
        if po.is_scheduler() {
            self.handle_add_node_at_scheduler(
                po,
                msg,
                registered_nodes,
                recovered_nodes,
            )
            .await
        } else {
            self.handle_add_node_at_member(&msg).await
        }
    }

    /// Scheduler-side ADD_NODE: register applicants until the cluster is
    /// complete, then assign ids deterministically and broadcast the full
    /// membership; afterwards, recycle dead ids for late (recovered)
    /// joiners.
    async fn handle_add_node_at_scheduler(
        &self,
        po: &Arc<PostOffice>,
        msg: Message,
        registered_nodes: &mut Vec<Node>,
        recovered_nodes: &mut Vec<Node>,
    ) -> Result<(), PsError> {
        let expected = po.num_workers() + po.num_servers();
        let timeout_sec = self.heartbeat_timeout_sec.load(Ordering::Relaxed);
        let mut newly_recovered: Option<Node> = None;

        if msg.meta.sender == EMPTY {
            let mut applicant = match msg.meta.control.nodes.first() {
                Some(node) => node.clone(),
                None => {
                    return logged_err!("ADD_NODE carries no node info");
                }
            };

            if !self.is_ready() && registered_nodes.len() < expected {
                registered_nodes.push(applicant);
            } else {
                // late arrival: replace the first dead node of this role
                let dead: HashSet<i32> =
                    po.get_dead_nodes(timeout_sec).into_iter().collect();
                let slot = registered_nodes.iter().position(|n| {
                    n.role == applicant.role && dead.contains(&n.id)
                });
                match slot {
                    Some(pos) => {
                        applicant.id = registered_nodes[pos].id;
                        applicant.is_recovered = true;
                        pf_info!(
                            "late joiner {} takes over dead node id {}",
                            applicant.addr(),
                            applicant.id
                        );
                        registered_nodes[pos] = applicant.clone();
                        recovered_nodes.push(applicant.clone());
                        newly_recovered = Some(applicant);
                    }
                    None => {
                        return logged_err!(
                            "late joiner {} refused: no dead {:?} to replace",
                            applicant.addr(),
                            applicant.role
                        );
                    }
                }
            }
        }

        if registered_nodes.len() == expected && !self.is_ready() {
            self.assign_and_broadcast(po, registered_nodes).await?;
        } else if let Some(recovered) = newly_recovered {
            self.reintroduce_recovered(po, registered_nodes, &recovered)
                .await?;
        }
        Ok(())
    }

    /// First-completion path: sort, assign ids, connect, notify everyone.
    async fn assign_and_broadcast(
        &self,
        po: &Arc<PostOffice>,
        registered_nodes: &mut Vec<Node>,
    ) -> Result<(), PsError> {
        let my_node = self.my_node();

        // deterministic assignment order
        registered_nodes.sort_by(|a, b| {
            b.hostname.cmp(&a.hostname).then(a.port.cmp(&b.port))
        });

        let mut num_servers = 0usize;
        let mut num_workers = 0usize;
        for node in registered_nodes.iter_mut() {
            let addr = node.addr();
            let assigned_id = match node.role {
                NodeRole::Server => server_rank_to_id(num_servers),
                NodeRole::Worker => worker_rank_to_id(num_workers),
                NodeRole::Scheduler => {
                    return logged_err!("scheduler cannot register itself");
                }
            };
            let existing =
                self.connected_nodes.lock().unwrap().get(&addr).copied();
            match existing {
                None => {
                    node.id = assigned_id;
                    self.transport.connect(node, &my_node).await?;
                    po.update_heartbeat(node.id, Instant::now());
                    self.connected_nodes
                        .lock()
                        .unwrap()
                        .insert(addr, assigned_id);
                }
                Some(first_id) => {
                    // co-resident customer of an already-known process
                    self.shared_node_mapping
                        .lock()
                        .unwrap()
                        .insert(assigned_id, first_id);
                    node.id = first_id;
                }
            }
            match node.role {
                NodeRole::Server => num_servers += 1,
                NodeRole::Worker => num_workers += 1,
                NodeRole::Scheduler => {}
            }
        }

        let mut notify = Message::default();
        notify.meta.control.cmd = Command::AddNode;
        notify.meta.control.nodes = registered_nodes.clone();
        notify.meta.control.nodes.push(my_node);

        for receiver in po.get_node_ids(SERVER_GROUP + WORKER_GROUP)? {
            if self
                .shared_node_mapping
                .lock()
                .unwrap()
                .contains_key(&receiver)
            {
                continue;
            }
            let mut out = notify.clone();
            out.meta.receiver = receiver;
            out.meta.timestamp = self.available_timestamp();
            self.send(out)?;
        }

        pf_info!(
            "the scheduler is connected to {} workers and {} servers",
            num_workers,
            num_servers
        );
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Post-ready path: plug a recovered node back into the cluster.
    async fn reintroduce_recovered(
        &self,
        po: &Arc<PostOffice>,
        registered_nodes: &[Node],
        recovered: &Node,
    ) -> Result<(), PsError> {
        let my_node = self.my_node();
        let timeout_sec = self.heartbeat_timeout_sec.load(Ordering::Relaxed);

        self.transport.connect(recovered, &my_node).await?;
        po.update_heartbeat(recovered.id, Instant::now());
        self.connected_nodes
            .lock()
            .unwrap()
            .insert(recovered.addr(), recovered.id);

        let dead: HashSet<i32> =
            po.get_dead_nodes(timeout_sec).into_iter().collect();
        for receiver in po.get_node_ids(SERVER_GROUP + WORKER_GROUP)? {
            // dead peers would only trigger resend storms
            if receiver != recovered.id && dead.contains(&receiver) {
                continue;
            }
            if self
                .shared_node_mapping
                .lock()
                .unwrap()
                .contains_key(&receiver)
            {
                continue;
            }
            let mut out = Message::default();
            out.meta.control.cmd = Command::AddNode;
            out.meta.control.nodes = if receiver == recovered.id {
                // the fresh node needs the whole membership
                let mut all = registered_nodes.to_vec();
                all.push(my_node.clone());
                all
            } else {
                vec![recovered.clone()]
            };
            out.meta.receiver = receiver;
            out.meta.timestamp = self.available_timestamp();
            self.send(out)?;
        }
        Ok(())
    }

    /// Worker/server-side ADD_NODE: adopt our id, connect to newly listed
    /// peers, and flip to ready.
    async fn handle_add_node_at_member(
        &self,
        msg: &Message,
    ) -> Result<(), PsError> {
        // adopt our assigned id first
        {
            let mut me = self.my_node.lock().unwrap();
            if me.id == EMPTY {
                for node in &msg.meta.control.nodes {
                    if me.hostname == node.hostname && me.port == node.port {
                        me.id = node.id;
                        me.is_recovered = node.is_recovered;
                        pf_info!(
                            "assigned id {} to node {}",
                            node.id,
                            me.addr()
                        );
                    }
                }
            }
        }

        let my_node = self.my_node();
        let mut num_servers = 0usize;
        let mut num_workers = 0usize;
        for node in &msg.meta.control.nodes {
            let addr = node.addr();
            let seen =
                self.connected_nodes.lock().unwrap().contains_key(&addr);
            if !seen {
                self.transport.connect(node, &my_node).await?;
                self.connected_nodes
                    .lock()
                    .unwrap()
                    .insert(addr, node.id);
                if !node.is_recovered {
                    match node.role {
                        NodeRole::Server => num_servers += 1,
                        NodeRole::Worker => num_workers += 1,
                        NodeRole::Scheduler => {}
                    }
                }
            }
        }

        if !self.is_ready() {
            pf_info!(
                "{} is connected to {} new workers and {} new servers",
                my_node.short_debug(),
                num_workers,
                num_servers
            );
            self.ready.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Barrier traffic: the scheduler counts entries per group and releases
    /// everyone at once; members forward the release to the post office.
    fn handle_barrier(
        &self,
        po: &Arc<PostOffice>,
        msg: &Message,
    ) -> Result<(), PsError> {
        if msg.meta.request {
            let group = msg.meta.control.barrier_group;
            if !(0..8).contains(&group) {
                return logged_err!("invalid barrier group id {}", group);
            }
            let members = po.get_node_ids(group)?;
            let arrived = {
                let mut counts = self.barrier_count.lock().unwrap();
                let count = &mut counts[group as usize];
                *count += 1;
                pf_debug!(
                    "barrier count of group {}: {}/{}",
                    group,
                    *count,
                    members.len()
                );
                if *count == members.len() {
                    *count = 0;
                    true
                } else {
                    false
                }
            };
            if arrived {
                for receiver in members {
                    if self
                        .shared_node_mapping
                        .lock()
                        .unwrap()
                        .contains_key(&receiver)
                    {
                        continue;
                    }
                    let mut release = Message::default();
                    release.meta.receiver = receiver;
                    release.meta.request = false;
                    release.meta.app_id = msg.meta.app_id;
                    release.meta.customer_id = msg.meta.customer_id;
                    release.meta.control.cmd = Command::Barrier;
                    release.meta.timestamp = self.available_timestamp();
                    self.send(release)?;
                }
            }
        } else {
            po.exit_barrier(msg);
        }
        Ok(())
    }

    /// Heartbeat traffic: refresh last-heard times; the scheduler echoes
    /// back so members can track it too.
    fn handle_heartbeat(&self, po: &Arc<PostOffice>, msg: &Message) {
        let now = Instant::now();
        for node in &msg.meta.control.nodes {
            po.update_heartbeat(node.id, now);
        }
        if po.is_scheduler() {
            let mut echo = Message::default();
            echo.meta.receiver = msg.meta.sender;
            echo.meta.control.cmd = Command::Heartbeat;
            echo.meta.control.nodes.push(self.my_node());
            echo.meta.timestamp = self.available_timestamp();
            if let Err(e) = self.send(echo) {
                pf_warn!(
                    "error echoing heartbeat to {}: {}",
                    msg.meta.sender,
                    e
                );
            }
        }
    }

    /// Data traffic: route into the right customer's queue, waiting briefly
    /// for apps that are still registering.
    async fn handle_data_msg(&self, po: &Arc<PostOffice>, msg: Message) {
        let app_id = msg.meta.app_id;
        // servers run exactly one customer per app, keyed by the app id
        let customer_id = if po.is_worker() {
            msg.meta.customer_id
        } else {
            msg.meta.app_id
        };
        match po.get_customer(app_id, customer_id, 5).await {
            Some(customer) => customer.on_receive(msg),
            None => {
                pf_error!(
                    "customer ({}, {}) never registered, msg dropped",
                    app_id,
                    customer_id
                );
            }
        }
    }

    async fn heartbeat_loop(po: Arc<PostOffice>, interval_ms: u64) {
        let van = po.van();
        while van.is_ready() {
            let mut hb = Message::default();
            hb.meta.receiver = SCHEDULER_ID;
            hb.meta.control.cmd = Command::Heartbeat;
            hb.meta.control.nodes.push(van.my_node());
            hb.meta.timestamp = van.available_timestamp();
            if let Err(e) = van.send(hb) {
                pf_warn!("error sending heartbeat: {}", e);
            }
            time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }
}
