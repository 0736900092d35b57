//! The shadow buffer: one per endpoint of a proxied connection.
//!
//! Each endpoint holds the suffix of received bytes that has not yet been
//! released to the other side (`data`, based at ring offset `offset`), the
//! output already approved for its own socket (`to_be_sent`), and the queue
//! of parser read-jobs waiting for more bytes. Parsers never touch sockets;
//! the per-connection event loop feeds `recv_from`/`flush_to` and the
//! parsers observe the buffer through their [`StreamView`]s.
//!
//! [`StreamView`]: super::view::StreamView

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};

use super::conn::ConnShared;
use super::error::EngineError;
use super::ring::{self, BUFFER_LIMIT};
use super::view::ViewState;

const RECV_CHUNK: usize = 4096;

struct ReadJob {
    id: u64,
    /// Absolute ring offset the buffer must reach before the waiter resumes.
    min: u32,
    waiter: oneshot::Sender<Result<(), EngineError>>,
}

struct State {
    data: BytesMut,
    offset: u32,
    eof: bool,
    to_be_sent: BytesMut,
    jobs: Vec<ReadJob>,
    next_job_id: u64,
}

pub struct ShadowBuffer {
    /// Direction tag for log lines, e.g. `"C->S"`.
    dir: &'static str,
    conn_id: u64,
    state: RefCell<State>,
    peer: RefCell<Weak<ShadowBuffer>>,
    conn: RefCell<Weak<ConnShared>>,
    views: RefCell<Vec<Rc<ViewState>>>,
    posted: Notify,
}

/// Removes a still-queued job when its waiter is dropped mid-await, so a
/// cancelled parser does not leave a dead entry keeping `recv_ready` true.
struct JobGuard<'a> {
    buf: &'a ShadowBuffer,
    id: u64,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.buf
            .state
            .borrow_mut()
            .jobs
            .retain(|j| j.id != self.id);
    }
}

impl ShadowBuffer {
    pub fn new(dir: &'static str, conn_id: u64) -> Rc<Self> {
        Rc::new(ShadowBuffer {
            dir,
            conn_id,
            state: RefCell::new(State {
                data: BytesMut::new(),
                offset: 0,
                eof: false,
                to_be_sent: BytesMut::new(),
                jobs: Vec::new(),
                next_job_id: 0,
            }),
            peer: RefCell::new(Weak::new()),
            conn: RefCell::new(Weak::new()),
            views: RefCell::new(Vec::new()),
            posted: Notify::new(),
        })
    }

    pub fn attach(&self, peer: &Rc<ShadowBuffer>, conn: &Rc<ConnShared>) {
        *self.peer.borrow_mut() = Rc::downgrade(peer);
        *self.conn.borrow_mut() = Rc::downgrade(conn);
    }

    fn peer(&self) -> Option<Rc<ShadowBuffer>> {
        self.peer.borrow().upgrade()
    }

    fn conn(&self) -> Option<Rc<ConnShared>> {
        self.conn.borrow().upgrade()
    }

    pub fn register_view(&self, view: Rc<ViewState>) {
        self.views.borrow_mut().push(view);
    }

    pub fn unregister_view(&self, view: &Rc<ViewState>) {
        self.views.borrow_mut().retain(|v| !Rc::ptr_eq(v, view));
    }

    pub fn offset(&self) -> u32 {
        self.state.borrow().offset
    }

    pub fn is_eof(&self) -> bool {
        self.state.borrow().eof
    }

    pub fn buffered(&self) -> usize {
        self.state.borrow().data.len()
    }

    pub fn send_ready(&self) -> bool {
        !self.state.borrow().to_be_sent.is_empty()
    }

    /// True iff pulling more bytes from the source can make progress: not at
    /// EOF, the held window is empty or a parser is waiting for more, and
    /// there is still at least one interceptor alive to look at them.
    pub fn recv_ready(&self) -> bool {
        let st = self.state.borrow();
        if st.eof {
            return false;
        }
        if !st.data.is_empty() && st.jobs.is_empty() {
            return false;
        }
        self.conn().map(|c| !c.instances_empty()).unwrap_or(false)
    }

    /// Resolves once a parser posts a new read-job on this buffer.
    pub fn job_posted(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.posted.notified()
    }

    /// Pull up to 4 KiB from the socket. Zero bytes (or a socket error,
    /// which is treated the same way) marks EOF, cancels every pending
    /// read-job and fires the per-view EOF hooks. Otherwise the arrived
    /// bytes wake every read-job whose target is now reached, nearest
    /// target first.
    pub fn recv_from(&self, sock: &TcpStream) -> Result<(), EngineError> {
        if self.state.borrow().data.len() >= BUFFER_LIMIT {
            if let Some(conn) = self.conn() {
                conn.fatal("shadow buffer exceeded the 10 KiB window");
            }
            return Err(EngineError::BufferOverflow);
        }
        let mut buf = [0u8; RECV_CHUNK];
        match sock.try_read(&mut buf) {
            Ok(0) => {
                self.handle_eof();
                Ok(())
            }
            Ok(n) => {
                let mut st = self.state.borrow_mut();
                st.data.extend_from_slice(&buf[..n]);
                let mut ready = Vec::new();
                while !st.jobs.is_empty()
                    && ring::delta(st.jobs[0].min, st.offset) as usize <= st.data.len()
                {
                    ready.push(st.jobs.remove(0));
                }
                drop(st);
                for job in ready {
                    let _ = job.waiter.send(Ok(()));
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                log::debug!("s{}: {} recv error: {}", self.conn_id, self.dir, e);
                self.handle_eof();
                Ok(())
            }
        }
    }

    fn handle_eof(&self) {
        let jobs = {
            let mut st = self.state.borrow_mut();
            st.eof = true;
            std::mem::take(&mut st.jobs)
        };
        log::info!("s{}: {} EOF", self.conn_id, self.dir);
        for job in jobs {
            let _ = job.waiter.send(Err(EngineError::Cancelled));
        }
        let views: Vec<_> = self.views.borrow().iter().cloned().collect();
        for view in views {
            view.on_eof();
        }
    }

    /// Write queued output toward the socket, tolerating short writes.
    pub fn flush_to(&self, sock: &TcpStream) -> Result<(), EngineError> {
        let mut st = self.state.borrow_mut();
        if st.to_be_sent.is_empty() {
            return Ok(());
        }
        match sock.try_write(&st.to_be_sent) {
            Ok(n) => {
                st.to_be_sent.advance(n);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(EngineError::Socket(e)),
        }
    }

    /// Return `[min, max]` bytes starting at ring offset `o`, suspending on
    /// a read-job until enough have arrived.
    pub async fn read(&self, o: u32, min: usize, max: usize) -> Result<Vec<u8>, EngineError> {
        if min > max {
            return Err(EngineError::violation("read with min > max"));
        }
        let wait = {
            let mut st = self.state.borrow_mut();
            let pos = ring::delta(o, st.offset) as usize;
            if pos + min > st.data.len() {
                if pos + min >= BUFFER_LIMIT {
                    drop(st);
                    if let Some(conn) = self.conn() {
                        conn.fatal("read target exceeds the 10 KiB window");
                    }
                    return Err(EngineError::BufferOverflow);
                }
                if st.eof {
                    return Err(EngineError::Eof);
                }
                let (tx, rx) = oneshot::channel();
                let id = st.next_job_id;
                st.next_job_id += 1;
                let min_off = ring::advance(o, min);
                let key = ring::delta(min_off, st.offset);
                let pos = st
                    .jobs
                    .partition_point(|j| ring::delta(j.min, st.offset) <= key);
                st.jobs.insert(
                    pos,
                    ReadJob {
                        id,
                        min: min_off,
                        waiter: tx,
                    },
                );
                Some((id, rx))
            } else {
                None
            }
        };
        if let Some((id, rx)) = wait {
            self.posted.notify_one();
            let guard = JobGuard { buf: self, id };
            let res = rx.await;
            drop(guard);
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(EngineError::Cancelled),
            }
        }
        let st = self.state.borrow();
        let pos = ring::delta(o, st.offset) as usize;
        let end = std::cmp::min(st.data.len(), pos + max);
        if pos >= end {
            return Err(EngineError::violation("read past available data"));
        }
        if end - pos < min {
            return Err(EngineError::violation("short read below requested minimum"));
        }
        Ok(st.data[pos..end].to_vec())
    }

    /// Release every byte all live views agree on — the minimum ring
    /// distance across both `consumed` and `replied` — into the peer's
    /// output queue, and trim the held window.
    pub fn move_stuff_to_reply_queue(&self) {
        let releasable = {
            let views = self.views.borrow();
            let st = self.state.borrow();
            let mut releasable = if views.is_empty() {
                0
            } else {
                views
                    .iter()
                    .map(|v| {
                        std::cmp::min(
                            ring::delta(v.consumed(), st.offset),
                            ring::delta(v.replied(), st.offset),
                        )
                    })
                    .min()
                    .unwrap_or(0) as usize
            };
            releasable = std::cmp::min(releasable, st.data.len());
            releasable
        };
        if releasable == 0 {
            return;
        }
        let peer = match self.peer() {
            Some(p) => p,
            None => return,
        };
        let mut st = self.state.borrow_mut();
        peer.state
            .borrow_mut()
            .to_be_sent
            .extend_from_slice(&st.data[..releasable]);
        st.data.advance(releasable);
        st.offset = ring::advance(st.offset, releasable);
    }

    /// The splice point. Precondition: exactly one interceptor remains, it
    /// has matched, and its view of this direction is not transparent. The
    /// view's `consumed` mark is aligned up to anything already approved
    /// and every approved byte is queued; bytes read but not yet approved
    /// stay in the window, where `discard` can replace them.
    pub fn pre_flush(&self) -> Result<(), EngineError> {
        {
            let conn = self
                .conn()
                .ok_or_else(|| EngineError::violation("connection gone"))?;
            if !conn.single_matched_instance() {
                return Err(EngineError::violation(
                    "splice point requires exactly one matched interceptor",
                ));
            }
            let views = self.views.borrow();
            let view = match views.as_slice() {
                [v] => v,
                _ => {
                    return Err(EngineError::violation(
                        "splice point requires exactly one stream view",
                    ))
                }
            };
            if view.is_transparent() {
                return Err(EngineError::violation(
                    "splice point requires a non-transparent stream view",
                ));
            }
            let replied = view.replied();
            if ring::ahead(replied, view.consumed()) {
                view.force_consumed(replied);
            }
        }
        self.move_stuff_to_reply_queue();
        Ok(())
    }

    /// Drop bytes up to `o` without forwarding them, advancing the single
    /// remaining view's `consumed` mark past the hole.
    pub fn discard(&self, o: u32) -> Result<(), EngineError> {
        self.pre_flush()?;
        {
            let mut st = self.state.borrow_mut();
            let n = ring::delta(o, st.offset) as usize;
            if n > st.data.len() {
                return Err(EngineError::violation("discard beyond buffered data"));
            }
            st.data.advance(n);
            st.offset = o;
        }
        let views = self.views.borrow();
        if let [view] = views.as_slice() {
            if ring::ahead(o, view.consumed()) {
                view.force_consumed(o);
            }
        }
        Ok(())
    }

    /// Queue synthesized bytes toward this endpoint's socket, after pushing
    /// everything the peer direction already owes it.
    pub fn send(&self, buf: &[u8]) -> Result<(), EngineError> {
        if let Some(peer) = self.peer() {
            peer.pre_flush()?;
        }
        self.state.borrow_mut().to_be_sent.extend_from_slice(buf);
        Ok(())
    }

    /// Cancel any interceptor that declared this direction silent while
    /// bytes past its `consumed` mark are sitting in the window.
    pub fn validate_silence(&self) {
        if self.state.borrow().data.is_empty() {
            return;
        }
        let views: Vec<_> = self.views.borrow().iter().cloned().collect();
        for view in views {
            if !view.silence_expected() {
                continue;
            }
            let st = self.state.borrow();
            let past = st.data.len() as i64 - ring::delta(view.consumed(), st.offset) as i64;
            drop(st);
            debug_assert!(past >= 0, "consumed mark ran past the buffered window");
            if past != 0 {
                log::debug!(
                    "s{}: {} got data while expecting silence",
                    self.conn_id,
                    self.dir
                );
                view.cancel_owner();
            }
        }
    }

    /// Residual bytes for the raw-splice handover: queued output for this
    /// endpoint's socket, then whatever the peer direction still holds.
    pub fn take_residual(&self) -> (Vec<u8>, Vec<u8>) {
        let mut st = self.state.borrow_mut();
        let sent = std::mem::take(&mut st.to_be_sent);
        let data = std::mem::take(&mut st.data);
        (sent.to_vec(), data.to_vec())
    }

    #[cfg(test)]
    pub(crate) fn feed(&self, bytes: &[u8]) {
        let mut st = self.state.borrow_mut();
        st.data.extend_from_slice(bytes);
        let mut ready = Vec::new();
        while !st.jobs.is_empty()
            && ring::delta(st.jobs[0].min, st.offset) as usize <= st.data.len()
        {
            ready.push(st.jobs.remove(0));
        }
        drop(st);
        for job in ready {
            let _ = job.waiter.send(Ok(()));
        }
    }

    #[cfg(test)]
    pub(crate) fn feed_eof(&self) {
        self.handle_eof();
    }

    #[cfg(test)]
    pub(crate) fn rebase(&self, offset: u32) {
        self.state.borrow_mut().offset = offset;
    }

    #[cfg(test)]
    pub(crate) fn queued_output(&self) -> Vec<u8> {
        self.state.borrow().to_be_sent.to_vec()
    }
}
