//! Per-connection state and the cooperative event loop.
//!
//! One accepted connection gets one OS thread running a `current_thread`
//! runtime: interceptor tasks and the socket loop below interleave
//! cooperatively, so connection state is never touched from two threads.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use super::error::EngineError;
use super::interceptor::{self, Instance, PluginSet};
use super::shadow::ShadowBuffer;

pub struct ConnShared {
    pub id: u64,
    pub client: Rc<ShadowBuffer>,
    pub server: Rc<ShadowBuffer>,
    instances: RefCell<Vec<Rc<Instance>>>,
    done: Notify,
    /// Pinged whenever the instance set changes, so the event loop
    /// re-evaluates silence guards and release marks promptly after a
    /// handover.
    membership: Notify,
    /// Set by a plugin to close the sockets on completion instead of
    /// handing them over to raw splicing.
    pub quit: Cell<bool>,
    /// Set on fatal invariant breaches: close with RST rather than FIN.
    pub reset: Cell<bool>,
    plugins: PluginSet,
}

/// What is left when the engine finishes: residual bytes that must be
/// prefixed onto the raw splice (or dropped if the connection is closing).
#[derive(Debug, Default)]
pub struct ConnOutcome {
    pub to_client: Vec<u8>,
    pub to_server: Vec<u8>,
    pub quit: bool,
    pub reset: bool,
}

impl ConnShared {
    pub fn new(id: u64, plugins: PluginSet) -> Rc<Self> {
        let client = ShadowBuffer::new("C->S", id);
        let server = ShadowBuffer::new("S->C", id);
        let conn = Rc::new(ConnShared {
            id,
            client: client.clone(),
            server: server.clone(),
            instances: RefCell::new(Vec::new()),
            done: Notify::new(),
            membership: Notify::new(),
            quit: Cell::new(false),
            reset: Cell::new(false),
            plugins,
        });
        client.attach(&server, &conn);
        server.attach(&client, &conn);
        conn
    }

    /// Launch one racing instance per registered plugin, or only the named
    /// one after a protocol handover. Must run inside the connection's
    /// `LocalSet`.
    pub fn start_interceptors(self: &Rc<Self>, only: Option<&str>) {
        let plugins = self.plugins.clone();
        for (name, plugin) in plugins.iter() {
            if let Some(wanted) = only {
                if wanted != name {
                    continue;
                }
            }
            let inst = Instance::new(self, name);
            self.instances.borrow_mut().push(inst.clone());
            let handle = tokio::task::spawn_local(interceptor::run_instance(
                self.clone(),
                inst.clone(),
                plugin.clone(),
            ));
            inst.set_abort(handle.abort_handle());
            self.membership.notify_one();
        }
    }

    pub fn instances_empty(&self) -> bool {
        self.instances.borrow().is_empty()
    }

    pub fn instances_except(&self, me: &Instance) -> Vec<Rc<Instance>> {
        self.instances
            .borrow()
            .iter()
            .filter(|i| !std::ptr::eq(Rc::as_ptr(i), me as *const Instance))
            .cloned()
            .collect()
    }

    pub(crate) fn remove_instance(&self, inst: &Rc<Instance>) {
        let mut list = self.instances.borrow_mut();
        list.retain(|i| !Rc::ptr_eq(i, inst));
        let empty = list.is_empty();
        drop(list);
        self.membership.notify_one();
        if empty {
            self.done.notify_waiters();
        }
    }

    pub(crate) fn single_matched_instance(&self) -> bool {
        let list = self.instances.borrow();
        list.len() == 1 && list[0].is_matched()
    }

    fn all_done(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.done.notified()
    }

    fn membership_changed(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.membership.notified()
    }

    /// Tear everything down with a reset. Used for invariant breaches like
    /// the 10 KiB window overflow.
    pub fn fatal(&self, why: &str) {
        if self.reset.get() {
            return;
        }
        log::error!("s{}: {}", self.id, why);
        self.reset.set(true);
        self.quit.set(true);
        let all: Vec<_> = self.instances.borrow().iter().cloned().collect();
        for inst in all {
            inst.cancel();
        }
    }
}

fn interest(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Drive one connection until every interceptor has exited and both output
/// queues are drained. Readiness is level-triggered; a direction is read
/// only while some parser is hungry and its peer has nothing queued
/// (back-pressure), written only while output is pending.
pub async fn run(
    conn: &Rc<ConnShared>,
    csock: &TcpStream,
    ssock: &TcpStream,
) -> Result<ConnOutcome, EngineError> {
    let client = conn.client.clone();
    let server = conn.server.clone();

    loop {
        client.move_stuff_to_reply_queue();
        server.move_stuff_to_reply_queue();
        client.validate_silence();
        server.validate_silence();

        let have_parsers = !conn.instances_empty();
        let c_send = client.send_ready();
        let s_send = server.send_ready();
        if !have_parsers && !c_send && !s_send {
            break;
        }

        let c_read = client.recv_ready() && !s_send;
        let s_read = server.recv_ready() && !c_send;

        if !c_read && !s_read && !c_send && !s_send {
            // Parsers are mid-computation: wait until one posts a read-job,
            // the instance set changes, or they all exit.
            tokio::select! {
                _ = conn.all_done() => {}
                _ = conn.membership_changed() => {}
                _ = client.job_posted(), if !client.is_eof() => {}
                _ = server.job_posted(), if !server.is_eof() => {}
            }
            continue;
        }

        let c_int = interest(c_read, c_send);
        let s_int = interest(s_read, s_send);
        tokio::select! {
            _ = conn.all_done() => {}
            _ = conn.membership_changed() => {}
            _ = client.job_posted(), if !client.is_eof() => {}
            _ = server.job_posted(), if !server.is_eof() => {}
            ready = csock.ready(c_int.unwrap_or(Interest::READABLE)), if c_int.is_some() => {
                let ready = ready?;
                if c_read && ready.is_readable() {
                    client.recv_from(csock)?;
                }
                if c_send && ready.is_writable() {
                    client.flush_to(csock)?;
                }
            }
            ready = ssock.ready(s_int.unwrap_or(Interest::READABLE)), if s_int.is_some() => {
                let ready = ready?;
                if s_read && ready.is_readable() {
                    server.recv_from(ssock)?;
                }
                if s_send && ready.is_writable() {
                    server.flush_to(ssock)?;
                }
            }
        }

        client.validate_silence();
        server.validate_silence();
    }

    log::info!("s{}: done with connection, nothing left to intercept", conn.id);
    for inst in conn.instances.borrow().iter() {
        inst.cancel();
    }

    let (c_sent, c_data) = client.take_residual();
    let (s_sent, s_data) = server.take_residual();
    let mut to_client = c_sent;
    to_client.extend_from_slice(&s_data);
    let mut to_server = s_sent;
    to_server.extend_from_slice(&c_data);
    Ok(ConnOutcome {
        to_client,
        to_server,
        quit: conn.quit.get(),
        reset: conn.reset.get(),
    })
}
