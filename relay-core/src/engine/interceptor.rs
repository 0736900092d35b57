//! Interceptor instances and the competing-parsers lifecycle.
//!
//! Every registered plugin gets an instance racing on the same pair of
//! shadow buffers. The first parser confident in its guess calls
//! [`Instance::identified`], which cancels the rest; a matched parser that
//! hands the stream to another protocol calls
//! [`Instance::protocol_changed`], which starts a fresh race over the same
//! buffers and exits the caller.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::AbortHandle;

use super::conn::ConnShared;
use super::error::EngineError;
use super::view::{StreamView, ViewState};

/// A protocol interceptor implementation. `init` runs once when the plugin
/// registry is (re)loaded and may cache configuration; `intercept` is the
/// cooperative task body run per connection.
#[async_trait(?Send)]
pub trait ProtocolPlugin: Send + Sync {
    fn init(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn intercept(
        &self,
        instance: Rc<Instance>,
        client: StreamView,
        server: StreamView,
    ) -> Result<(), EngineError>;
}

pub type PluginSet = Arc<Vec<(String, Arc<dyn ProtocolPlugin>)>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Racing,
    Matched,
    Cancelled,
    Done,
}

pub struct Instance {
    pub name: String,
    tag: String,
    conn: Weak<ConnShared>,
    status: Cell<Status>,
    abort: RefCell<Option<AbortHandle>>,
    pub(crate) view_client: Rc<ViewState>,
    pub(crate) view_server: Rc<ViewState>,
}

impl Instance {
    pub(crate) fn new(conn: &Rc<ConnShared>, name: &str) -> Rc<Self> {
        let view_client = ViewState::new(conn.client.offset());
        let view_server = ViewState::new(conn.server.offset());
        let inst = Rc::new(Instance {
            name: name.to_string(),
            tag: format!("s{}:{}", conn.id, name),
            conn: Rc::downgrade(conn),
            status: Cell::new(Status::Racing),
            abort: RefCell::new(None),
            view_client: view_client.clone(),
            view_server: view_server.clone(),
        });
        view_client.set_owner(&inst);
        view_server.set_owner(&inst);
        conn.client.register_view(view_client);
        conn.server.register_view(view_server);
        inst
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn is_matched(&self) -> bool {
        self.status.get() == Status::Matched
    }

    pub(crate) fn set_abort(&self, handle: AbortHandle) {
        *self.abort.borrow_mut() = Some(handle);
    }

    /// Commit to this protocol: transition to `matched` and cancel every
    /// other racing instance. At most one instance per connection ever
    /// reaches this state.
    pub fn identified(&self) {
        if self.status.get() == Status::Matched {
            return;
        }
        log::info!("{} MATCH", self.tag);
        self.status.set(Status::Matched);
        if let Some(conn) = self.conn.upgrade() {
            for other in conn.instances_except(self) {
                other.cancel();
            }
        }
    }

    /// Protocol handover: end this run and start a fresh race over the same
    /// buffers, optionally restricted to the plugin named `only` (CONNECT
    /// passes `None`, an HTTP Upgrade passes the upgrade token). Buffer
    /// state is preserved verbatim.
    pub fn protocol_changed(&self, only: Option<&str>) {
        if self.status.get() != Status::Matched {
            log::warn!("{} protocol_changed before identified", self.tag);
            self.cancel();
            return;
        }
        if let Some(conn) = self.conn.upgrade() {
            for other in conn.instances_except(self) {
                other.cancel();
            }
            conn.start_interceptors(only);
        }
        self.cancel();
    }

    /// Cooperative cancellation: takes effect at the instance's next await
    /// point. Safe to call repeatedly, including from the instance itself.
    pub fn cancel(&self) {
        if self.status.get() == Status::Done {
            return;
        }
        log::debug!("{} cancel", self.tag);
        self.status.set(Status::Cancelled);
        if let Some(handle) = self.abort.borrow().as_ref() {
            handle.abort();
        }
    }

    /// Set the quit flag: when the engine finishes, close the sockets
    /// instead of handing them to the raw splicer.
    pub fn quit(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.quit.set(true);
        }
    }

    pub(crate) fn abort_connection(&self, why: &str) {
        if let Some(conn) = self.conn.upgrade() {
            conn.fatal(why);
        }
    }

    pub(crate) fn finish(&self) {
        if self.status.get() != Status::Cancelled {
            self.status.set(Status::Done);
        }
    }
}

/// Unwinds an instance out of the connection no matter how its task ended:
/// normal return, error, cancellation, or panic.
pub(crate) struct InstanceGuard {
    pub conn: Rc<ConnShared>,
    pub inst: Rc<Instance>,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.inst.finish();
        self.conn.client.unregister_view(&self.inst.view_client);
        self.conn.server.unregister_view(&self.inst.view_server);
        log::info!("{} DONE", self.inst.tag());
        self.conn.remove_instance(&self.inst);
    }
}

pub(crate) async fn run_instance(
    conn: Rc<ConnShared>,
    inst: Rc<Instance>,
    plugin: Arc<dyn ProtocolPlugin>,
) {
    let _guard = InstanceGuard {
        conn: conn.clone(),
        inst: inst.clone(),
    };
    let client = StreamView::new(conn.client.clone(), inst.view_client.clone());
    let server = StreamView::new(conn.server.clone(), inst.view_server.clone());
    match plugin.intercept(inst.clone(), client, server).await {
        Ok(()) => {}
        Err(e) if e.is_silent() => {}
        Err(EngineError::Mismatch) | Err(EngineError::Violation(_)) if !inst.is_matched() => {
            log::debug!("{} no match", inst.tag());
        }
        Err(e) => {
            log::warn!("{} protocol violation: {}", inst.tag(), e);
            inst.cancel();
        }
    }
}
