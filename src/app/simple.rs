//! Bare-bones request/response app: a head integer plus an opaque body,
//! fanned out to a node or group. Useful for control-plane style traffic
//! and as the smallest example of writing an app against the dispatcher.

use std::sync::{Arc, Mutex};

use crate::internal::customer::Customer;
use crate::internal::message::Message;
use crate::internal::postoffice::PostOffice;
use crate::utils::PsError;

/// One SimpleApp message as seen by handlers.
#[derive(Debug, Clone)]
pub struct SimpleData {
    /// User-defined head integer.
    pub head: i32,

    /// Sending node's id.
    pub sender: i32,

    /// Sending customer's id.
    pub customer_id: i32,

    /// Request id; echo it back when responding.
    pub request_id: i32,

    /// Opaque body.
    pub body: String,
}

/// Handler invoked on received requests or responses.
pub type SimpleHandle = Arc<dyn Fn(&SimpleApp, &SimpleData) + Send + Sync>;

struct SimpleAppInner {
    po: Arc<PostOffice>,
    app_id: i32,
    customer_id: i32,
    customer: Mutex<Option<Arc<Customer>>>,
    request_handle: Mutex<SimpleHandle>,
    response_handle: Mutex<SimpleHandle>,
}

impl Drop for SimpleAppInner {
    fn drop(&mut self) {
        self.po.remove_customer(self.app_id, self.customer_id);
    }
}

/// Head + body request/response app over a registered customer.
pub struct SimpleApp {
    inner: Arc<SimpleAppInner>,
}

impl SimpleApp {
    /// Creates the app and registers its customer. The default request
    /// handler responds with an empty body; the default response handler
    /// does nothing.
    pub fn new(
        po: Arc<PostOffice>,
        app_id: i32,
        customer_id: i32,
    ) -> Result<SimpleApp, PsError> {
        let inner = Arc::new(SimpleAppInner {
            po: po.clone(),
            app_id,
            customer_id,
            customer: Mutex::new(None),
            request_handle: Mutex::new(Arc::new(
                |app: &SimpleApp, req: &SimpleData| {
                    if let Err(e) = app.response(req, "") {
                        pf_warn!("error sending default response: {}", e);
                    }
                },
            )),
            response_handle: Mutex::new(Arc::new(|_app, _resp| {})),
        });

        let weak = Arc::downgrade(&inner);
        let customer = Customer::new(
            po,
            app_id,
            customer_id,
            Box::new(move |msg| {
                if let Some(inner) = weak.upgrade() {
                    SimpleApp { inner }.on_receive(msg);
                }
            }),
        )?;
        *inner.customer.lock().unwrap() = Some(customer);

        Ok(SimpleApp { inner })
    }

    /// Sends a request to every node of `receiver` (node or group id);
    /// returns the request id to wait on.
    pub fn request(
        &self,
        head: i32,
        body: &str,
        receiver: i32,
    ) -> Result<i32, PsError> {
        let customer = self.customer()?;
        let ts = customer.new_request(receiver)?;

        let mut msg = Message::default();
        msg.meta.head = head;
        msg.meta.app_id = customer.app_id();
        msg.meta.customer_id = customer.customer_id();
        msg.meta.request = true;
        msg.meta.simple_app = true;
        msg.meta.timestamp = ts;
        msg.meta.body = body.into();

        for node_id in self.inner.po.get_node_ids(receiver)? {
            let mut out = msg.clone();
            out.meta.receiver = node_id;
            self.inner.po.van().send(out)?;
        }
        Ok(ts)
    }

    /// Responds to a received request.
    pub fn response(
        &self,
        req: &SimpleData,
        body: &str,
    ) -> Result<(), PsError> {
        let customer = self.customer()?;

        let mut msg = Message::default();
        msg.meta.head = req.head;
        msg.meta.app_id = customer.app_id();
        msg.meta.customer_id = req.customer_id;
        msg.meta.request = false;
        msg.meta.simple_app = true;
        msg.meta.timestamp = req.request_id;
        msg.meta.receiver = req.sender;
        msg.meta.body = body.into();

        self.inner.po.van().send(msg)?;
        Ok(())
    }

    /// Blocks until every addressed node has responded to the request.
    pub async fn wait(&self, request_id: i32) -> Result<(), PsError> {
        let customer = self.customer()?;
        customer.wait_request(request_id).await;
        Ok(())
    }

    /// Installs the handler run on received requests.
    pub fn set_request_handle(
        &self,
        handle: impl Fn(&SimpleApp, &SimpleData) + Send + Sync + 'static,
    ) {
        *self.inner.request_handle.lock().unwrap() = Arc::new(handle);
    }

    /// Installs the handler run on received responses.
    pub fn set_response_handle(
        &self,
        handle: impl Fn(&SimpleApp, &SimpleData) + Send + Sync + 'static,
    ) {
        *self.inner.response_handle.lock().unwrap() = Arc::new(handle);
    }

    fn customer(&self) -> Result<Arc<Customer>, PsError> {
        self.inner
            .customer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PsError::msg("app is shutting down"))
    }

    fn on_receive(&self, msg: Message) {
        let data = SimpleData {
            head: msg.meta.head,
            sender: msg.meta.sender,
            customer_id: msg.meta.customer_id,
            request_id: msg.meta.timestamp,
            body: msg.meta.body,
        };
        let handle = if msg.meta.request {
            self.inner.request_handle.lock().unwrap().clone()
        } else {
            self.inner.response_handle.lock().unwrap().clone()
        };
        handle(self, &data);
    }
}
