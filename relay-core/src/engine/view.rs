//! Per-interceptor views over a shadow buffer, and the parser primitives
//! built on top of them.
//!
//! A view does not own bytes. It tracks how far its interceptor has read
//! (`consumed`), how far it has approved bytes for forwarding (`replied`),
//! whether consuming implies approving (`transparent`), and whether any
//! byte on this direction is currently a protocol violation
//! (`silence_expected`).

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::error::EngineError;
use super::interceptor::Instance;
use super::ring::{self, BUFFER_LIMIT};
use super::shadow::ShadowBuffer;

pub struct ViewState {
    consumed: Cell<u32>,
    replied: Cell<u32>,
    transparent: Cell<bool>,
    silence_expected: Cell<bool>,
    owner: RefCell<Weak<Instance>>,
}

impl ViewState {
    pub fn new(start: u32) -> Rc<Self> {
        Rc::new(ViewState {
            consumed: Cell::new(start),
            replied: Cell::new(start),
            transparent: Cell::new(false),
            silence_expected: Cell::new(true),
            owner: RefCell::new(Weak::new()),
        })
    }

    pub fn set_owner(&self, owner: &Rc<Instance>) {
        *self.owner.borrow_mut() = Rc::downgrade(owner);
    }

    pub fn consumed(&self) -> u32 {
        self.consumed.get()
    }

    pub fn replied(&self) -> u32 {
        self.replied.get()
    }

    pub fn is_transparent(&self) -> bool {
        self.transparent.get()
    }

    pub fn silence_expected(&self) -> bool {
        self.silence_expected.get()
    }

    pub(crate) fn force_consumed(&self, o: u32) {
        self.consumed.set(o);
    }

    pub fn cancel_owner(&self) {
        if let Some(owner) = self.owner.borrow().upgrade() {
            owner.cancel();
        }
    }

    /// EOF hook: by default the owning interceptor is cancelled.
    pub fn on_eof(&self) {
        self.cancel_owner();
    }

    fn abort_connection(&self, why: &str) {
        if let Some(owner) = self.owner.borrow().upgrade() {
            owner.abort_connection(why);
        }
    }
}

/// The handle a parser actually works with: a view state plus the shadow
/// buffer it indexes into.
#[derive(Clone)]
pub struct StreamView {
    buf: Rc<ShadowBuffer>,
    state: Rc<ViewState>,
}

impl StreamView {
    pub fn new(buf: Rc<ShadowBuffer>, state: Rc<ViewState>) -> Self {
        StreamView { buf, state }
    }

    /// Ring offset up to which this view has approved bytes; the natural
    /// starting point for a parser.
    pub fn replied(&self) -> u32 {
        self.state.replied()
    }

    pub fn consumed(&self) -> u32 {
        self.state.consumed()
    }

    pub fn is_eof(&self) -> bool {
        self.buf.is_eof()
    }

    pub fn expect_silence(&self, silent: bool) {
        self.state.silence_expected.set(silent);
    }

    /// Pass-through mode: every `consume` also approves the bytes for
    /// forwarding. Turning it on catches `replied` up to `consumed`.
    pub fn set_transparent(&self, transparent: bool) {
        self.state.transparent.set(transparent);
        if transparent {
            let consumed = self.state.consumed();
            if ring::ahead(consumed, self.state.replied()) {
                self.reply(consumed);
            }
        }
    }

    /// Mark everything before `o` as definitively read.
    pub fn consume(&self, o: u32) {
        let cur = self.state.consumed();
        if ring::delta(o, cur) as usize >= BUFFER_LIMIT {
            self.state
                .abort_connection("consume mark jumped past the 10 KiB window");
            return;
        }
        self.state.consumed.set(o);
        if self.state.transparent.get() {
            self.reply(o);
        }
    }

    /// Approve bytes before `o` for forwarding. Forward-monotone: replies
    /// behind the current mark are ignored.
    pub fn reply(&self, o: u32) {
        let cur = self.state.replied();
        if o == cur || !ring::ahead(o, cur) {
            return;
        }
        if ring::delta(o, cur) as usize >= BUFFER_LIMIT {
            self.state
                .abort_connection("reply mark jumped past the 10 KiB window");
            return;
        }
        self.state.replied.set(o);
    }

    /// Drop the bytes before `o` instead of forwarding them, then treat
    /// them as both consumed and replied. Splice-point preconditions apply.
    pub fn discard(&self, o: u32) -> Result<(), EngineError> {
        self.buf.discard(o)?;
        self.state.replied.set(o);
        Ok(())
    }

    /// Queue synthesized bytes toward this view's endpoint.
    pub fn send(&self, buf: &[u8]) -> Result<(), EngineError> {
        self.buf.send(buf)
    }

    /// Read `[min, max]` bytes at `o`, consuming them unless told not to.
    pub async fn read(
        &self,
        o: u32,
        min: usize,
        max: usize,
        consume: bool,
    ) -> Result<Vec<u8>, EngineError> {
        let ret = self.buf.read(o, min, max).await?;
        if consume {
            self.consume(ring::advance(o, ret.len()));
        }
        Ok(ret)
    }

    /// Longest prefix at `o` (bounded by `max`) whose every byte satisfies
    /// `pred`; fails with `Mismatch` when fewer than `min` bytes qualify.
    /// Returns the offset just past the match and the matched bytes.
    pub async fn match_pred<F>(
        &self,
        o: u32,
        pred: F,
        min: usize,
        max: usize,
        consume: bool,
    ) -> Result<(u32, Vec<u8>), EngineError>
    where
        F: Fn(u8, usize) -> bool,
    {
        let mut i = 0usize;
        let mut need = min;
        let mut buf: Vec<u8> = Vec::new();
        while i < max {
            let chunk = self
                .read(ring::advance(o, i), need - i, max - i, false)
                .await?;
            buf.extend_from_slice(&chunk);
            while i < buf.len() {
                if !pred(buf[i], i) {
                    if i < min {
                        return Err(EngineError::Mismatch);
                    }
                    if consume {
                        self.consume(ring::advance(o, i));
                    }
                    buf.truncate(i);
                    return Ok((ring::advance(o, i), buf));
                }
                i += 1;
            }
            need = i + 1;
            if consume {
                self.consume(ring::advance(o, i));
            }
        }
        buf.truncate(max);
        Ok((ring::advance(o, max), buf))
    }

    /// Exact byte-string match.
    pub async fn match_bytes(
        &self,
        o: u32,
        pat: &[u8],
        consume: bool,
    ) -> Result<(u32, Vec<u8>), EngineError> {
        self.match_pred(o, |x, i| x == pat[i], pat.len(), pat.len(), consume)
            .await
    }

    /// Line terminator: `\r\n` preferred, then a lone `\r`, then a lone
    /// `\n`. Deliberately laxer than strict HTTP.
    pub async fn match_crlf(&self, o: u32) -> Result<u32, EngineError> {
        let (o, first) = self
            .match_pred(o, |x, _| x == b'\r' || x == b'\n', 1, 1, true)
            .await?;
        if first == b"\r" {
            match self.read(o, 1, 1, false).await {
                Ok(next) if next[0] == b'\n' => {
                    let o = ring::advance(o, 1);
                    self.consume(o);
                    return Ok(o);
                }
                Ok(_) => return Ok(o),
                Err(EngineError::Eof) => return Ok(o),
                Err(e) => return Err(e),
            }
        }
        Ok(o)
    }
}
