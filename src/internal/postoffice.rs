//! Per-process registry tying the pieces together: configuration, the Van,
//! registered customers, node groups, server key ranges, heartbeat records,
//! and barrier state.
//!
//! One `PostOffice` embodies one node. It is created once per process (or
//! once per simulated node in tests) and handed around as an `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::{self, Duration, Instant};

use crate::internal::customer::Customer;
use crate::internal::env::Environment;
use crate::internal::message::Message;
use crate::internal::node::{
    id_to_rank, server_rank_to_id, worker_rank_to_id, Range, ALL_NODES,
    SCHEDULER_ID, SERVER_GROUP, WORKER_GROUP,
};
use crate::internal::van::{Van, VanKind};
use crate::utils::PsError;
use crate::{Key, MAX_KEY};

/// Callback run after `finalize` completes on customer 0.
pub type ExitCallback = Box<dyn FnOnce() + Send>;

/// The process-wide hub of one node.
pub struct PostOffice {
    env: Environment,
    van: Van,

    is_worker: bool,
    is_server: bool,
    is_scheduler: bool,
    num_workers: usize,
    num_servers: usize,

    /// Serializes the start/finalize stage machine across customers.
    start_stage: tokio::sync::Mutex<u32>,

    /// System start time; baseline for nodes never heard from.
    start_time: Mutex<Option<Instant>>,

    exit_callback: Mutex<Option<ExitCallback>>,

    /// `(app_id, customer_id) -> barrier completed` flags.
    barrier_done: Mutex<HashMap<(i32, i32), bool>>,
    barrier_notify: Notify,

    /// Per-server key ranges; materialized on first use.
    server_key_ranges: Mutex<Vec<Range>>,

    /// Last heartbeat time per node id.
    heartbeats: Mutex<HashMap<i32, Instant>>,

    /// `app_id -> customer_id -> customer`.
    customers: Mutex<HashMap<i32, HashMap<i32, Arc<Customer>>>>,

    /// `group_id -> member node ids`.
    node_ids: Mutex<HashMap<i32, Vec<i32>>>,
}

impl PostOffice {
    /// Creates the post office for one node from its configuration.
    /// Required keys missing or malformed fail fast here.
    pub fn new(env: Environment) -> Result<Arc<PostOffice>, PsError> {
        let role = env.get_or_fail("PS_ROLE")?;
        let (is_worker, is_server, is_scheduler) = match role.as_str() {
            "worker" => (true, false, false),
            "server" => (false, true, false),
            "scheduler" => (false, false, true),
            other => {
                return logged_err!("invalid PS_ROLE '{}'", other);
            }
        };
        let num_workers = env.get_int_or_fail("PS_NUM_WORKER")?;
        let num_servers = env.get_int_or_fail("PS_NUM_SERVER")?;
        if num_workers < 1 || num_servers < 1 {
            return logged_err!(
                "invalid cluster shape: {} workers, {} servers",
                num_workers,
                num_servers
            );
        }

        let van_kind = match env.get_or("PS_VAN_TYPE", "tcp").as_str() {
            "tcp" => VanKind::Tcp,
            other => {
                return logged_err!("unsupported PS_VAN_TYPE '{}'", other);
            }
        };

        Ok(Arc::new(PostOffice {
            env,
            van: Van::new(van_kind),
            is_worker,
            is_server,
            is_scheduler,
            num_workers: num_workers as usize,
            num_servers: num_servers as usize,
            start_stage: tokio::sync::Mutex::new(0),
            start_time: Mutex::new(None),
            exit_callback: Mutex::new(None),
            barrier_done: Mutex::new(HashMap::new()),
            barrier_notify: Notify::new(),
            server_key_ranges: Mutex::new(Vec::new()),
            heartbeats: Mutex::new(HashMap::new()),
            customers: Mutex::new(HashMap::new()),
            node_ids: Mutex::new(HashMap::new()),
        }))
    }

    /// Brings this node up. The group table and Van init run once; every
    /// customer then performs its own join announcement, and optionally
    /// enters an all-nodes barrier so no one races ahead of the cluster.
    pub async fn start(
        self: &Arc<Self>,
        customer_id: i32,
        need_barrier: bool,
    ) -> Result<(), PsError> {
        {
            let mut stage = self.start_stage.lock().await;
            if *stage == 0 {
                self.init_node_groups();
                *self.start_time.lock().unwrap() = Some(Instant::now());
                *stage = 1;
            }
        }

        self.van.start(self, customer_id).await?;

        {
            let mut stage = self.start_stage.lock().await;
            if *stage == 1 {
                *stage = 2;
            }
        }

        if need_barrier {
            self.barrier(customer_id, ALL_NODES).await?;
        }
        Ok(())
    }

    /// Takes this node out of the system. All nodes call this before exit;
    /// customer 0 shuts the Van down and clears process-wide state. The
    /// exit callback (if any) fires last.
    pub async fn finalize(
        &self,
        customer_id: i32,
        need_barrier: bool,
    ) -> Result<(), PsError> {
        if need_barrier {
            self.barrier(customer_id, ALL_NODES).await?;
        }
        if customer_id == 0 {
            self.van.stop().await;
            *self.start_stage.lock().await = 0;
            *self.start_time.lock().unwrap() = None;
            self.barrier_done.lock().unwrap().clear();
            self.server_key_ranges.lock().unwrap().clear();
            self.heartbeats.lock().unwrap().clear();
            self.customers.lock().unwrap().clear();
            self.node_ids.lock().unwrap().clear();
        }
        let callback = self.exit_callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }

    /// Populates the group table: every node id sits in its singleton group
    /// and in every group whose bitmask covers its role.
    pub(crate) fn init_node_groups(&self) {
        let mut table: HashMap<i32, Vec<i32>> = HashMap::new();

        for group in [
            SCHEDULER_ID,
            SCHEDULER_ID + SERVER_GROUP,
            SCHEDULER_ID + WORKER_GROUP,
            ALL_NODES,
        ] {
            table.entry(group).or_default().push(SCHEDULER_ID);
        }
        for rank in 0..self.num_servers {
            let id = server_rank_to_id(rank);
            for group in [
                id,
                SERVER_GROUP,
                SERVER_GROUP + SCHEDULER_ID,
                SERVER_GROUP + WORKER_GROUP,
                ALL_NODES,
            ] {
                table.entry(group).or_default().push(id);
            }
        }
        for rank in 0..self.num_workers {
            let id = worker_rank_to_id(rank);
            for group in [
                id,
                WORKER_GROUP,
                WORKER_GROUP + SCHEDULER_ID,
                WORKER_GROUP + SERVER_GROUP,
                ALL_NODES,
            ] {
                table.entry(group).or_default().push(id);
            }
        }

        *self.node_ids.lock().unwrap() = table;
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn van(&self) -> &Van {
        &self.van
    }

    pub fn is_worker(&self) -> bool {
        self.is_worker
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn is_scheduler(&self) -> bool {
        self.is_scheduler
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    /// Role-local rank of this node.
    pub fn my_rank(&self) -> usize {
        id_to_rank(self.van.my_node().id)
    }

    /// True if this node re-joined in place of a dead one.
    pub fn is_recovered(&self) -> bool {
        self.van.my_node().is_recovered
    }

    /// Registers a customer; the `(app_id, customer_id)` pair must be
    /// unique within the process.
    pub(crate) fn add_customer(
        &self,
        customer: &Arc<Customer>,
    ) -> Result<(), PsError> {
        let app_id = customer.app_id();
        let customer_id = customer.customer_id();
        let mut customers = self.customers.lock().unwrap();
        let app = customers.entry(app_id).or_default();
        if app.contains_key(&customer_id) {
            return logged_err!(
                "customer ({}, {}) already registered",
                app_id,
                customer_id
            );
        }
        app.insert(customer_id, customer.clone());
        Ok(())
    }

    /// Unregisters a customer.
    pub(crate) fn remove_customer(&self, app_id: i32, customer_id: i32) {
        let mut customers = self.customers.lock().unwrap();
        if let Some(app) = customers.get_mut(&app_id) {
            app.remove(&customer_id);
            if app.is_empty() {
                customers.remove(&app_id);
            }
        }
    }

    /// Looks a customer up, polling for up to `timeout_sec` seconds to
    /// bridge the window where an app is still registering.
    pub(crate) async fn get_customer(
        &self,
        app_id: i32,
        customer_id: i32,
        timeout_sec: u64,
    ) -> Option<Arc<Customer>> {
        let deadline = Instant::now() + Duration::from_secs(timeout_sec);
        loop {
            {
                let customers = self.customers.lock().unwrap();
                if let Some(customer) =
                    customers.get(&app_id).and_then(|app| app.get(&customer_id))
                {
                    return Some(customer.clone());
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Concrete member node ids of a node or group id. Asking for an
    /// unknown group is a programming error.
    pub fn get_node_ids(&self, group_id: i32) -> Result<Vec<i32>, PsError> {
        let table = self.node_ids.lock().unwrap();
        match table.get(&group_id) {
            Some(ids) => Ok(ids.clone()),
            None => logged_err!("get non-existent node group [{}]", group_id),
        }
    }

    /// The fixed per-server key ranges: contiguous, disjoint, covering
    /// `[0, MAX_KEY]` with the last range closed at the top.
    pub fn get_server_ranges(&self) -> Vec<Range> {
        let mut ranges = self.server_key_ranges.lock().unwrap();
        if ranges.is_empty() {
            let num = self.num_servers as Key;
            for i in 0..self.num_servers as Key {
                let begin = MAX_KEY / num * i;
                let end = if i + 1 == num {
                    MAX_KEY
                } else {
                    MAX_KEY / num * (i + 1)
                };
                ranges.push(Range::new(begin, end));
            }
        }
        ranges.clone()
    }

    /// Records a heartbeat (or any liveness proof) from a node.
    pub(crate) fn update_heartbeat(&self, node_id: i32, at: Instant) {
        self.heartbeats.lock().unwrap().insert(node_id, at);
    }

    /// Ids of worker/server nodes not heard from within `timeout_sec`
    /// seconds (counting from system start for nodes never heard at all).
    pub fn get_dead_nodes(&self, timeout_sec: i32) -> Vec<i32> {
        let timeout = Duration::from_secs(timeout_sec.max(0) as u64);
        let now = Instant::now();
        let start_time = self.start_time.lock().unwrap();
        let heartbeats = self.heartbeats.lock().unwrap();

        let mut dead = Vec::new();
        let candidates = {
            let table = self.node_ids.lock().unwrap();
            table
                .get(&(SERVER_GROUP + WORKER_GROUP))
                .cloned()
                .unwrap_or_default()
        };
        for id in candidates {
            let last_alive =
                heartbeats.get(&id).copied().or(*start_time);
            match last_alive {
                Some(at) if at + timeout >= now => {}
                Some(_) => dead.push(id),
                None => {}
            }
        }
        dead
    }

    /// Enters the scheduler-mediated barrier over `group_id` and waits for
    /// the release. Single-member groups return immediately.
    pub async fn barrier(
        &self,
        customer_id: i32,
        group_id: i32,
    ) -> Result<(), PsError> {
        let members = self.get_node_ids(group_id)?;
        if members.len() <= 1 {
            return Ok(());
        }
        let my_id = self.van.my_node().id;
        if !members.contains(&my_id) {
            return logged_err!(
                "node {} does not belong to barrier group {}",
                my_id,
                group_id
            );
        }

        // barrier traffic runs under app 0
        self.barrier_done
            .lock()
            .unwrap()
            .insert((0, customer_id), false);

        let mut req = Message::default();
        req.meta.receiver = SCHEDULER_ID;
        req.meta.request = true;
        req.meta.app_id = 0;
        req.meta.customer_id = customer_id;
        req.meta.control.cmd = crate::internal::message::Command::Barrier;
        req.meta.control.barrier_group = group_id;
        req.meta.timestamp = self.van.available_timestamp();
        self.van.send(req)?;

        loop {
            let notified = self.barrier_notify.notified();
            {
                let done = self.barrier_done.lock().unwrap();
                if done.get(&(0, customer_id)).copied().unwrap_or(false) {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Handles the scheduler's barrier release: marks every customer of the
    /// app as released and wakes the waiters.
    pub(crate) fn exit_barrier(&self, msg: &Message) {
        let app_id = msg.meta.app_id;
        {
            let mut done = self.barrier_done.lock().unwrap();
            for ((app, _customer), flag) in done.iter_mut() {
                if *app == app_id {
                    *flag = true;
                }
            }
        }
        self.barrier_notify.notify_waiters();
    }

    /// Registers a callback to run after `finalize` completes.
    pub fn register_exit_callback(&self, callback: ExitCallback) {
        *self.exit_callback.lock().unwrap() = Some(callback);
    }
}
