//! Channel runtime.
//!
//! Channels wrap a crossbeam bounded channel (capacity 0 is a
//! rendezvous) plus an explicit close signal: the source language has
//! first-class `close`, which crossbeam only models by dropping every
//! sender. The close signal is a zero-capacity channel whose sender is
//! dropped on `close`; a receive on it becoming ready means "closed".

use std::sync::Arc;

use crossbeam_channel::{bounded, never, Receiver, Select, Sender};
use parking_lot::Mutex;

use crate::error::{EvalResult, Panic};
use crate::types::{ChanDir, Type};
use crate::value::{zero, Value};

struct ChanState {
    cap: usize,
    elem: Type,
    tx: Mutex<Option<Sender<Value>>>,
    rx: Receiver<Value>,
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
}

#[derive(Clone)]
pub struct ChanValue(Arc<ChanState>);

impl ChanValue {
    pub fn new(elem: Type, cap: usize) -> ChanValue {
        let (tx, rx) = bounded(cap);
        let (ctx, crx) = bounded(0);
        ChanValue(Arc::new(ChanState {
            cap,
            elem,
            tx: Mutex::new(Some(tx)),
            rx,
            closed_tx: Mutex::new(Some(ctx)),
            closed_rx: crx,
        }))
    }

    pub fn elem(&self) -> Type {
        self.0.elem.clone()
    }

    pub fn len(&self) -> usize {
        self.0.rx.len()
    }

    pub fn cap(&self) -> usize {
        self.0.cap
    }

    pub fn same(&self, other: &ChanValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn tx_clone(&self) -> Option<Sender<Value>> {
        self.0.tx.lock().clone()
    }

    /// Blocking send. Faults if the channel is, or becomes, closed.
    pub fn send(&self, v: Value) -> EvalResult<()> {
        let tx = match self.tx_clone() {
            Some(t) => t,
            None => return Err(Panic::runtime("send on closed channel")),
        };
        let mut sel = Select::new();
        let si = sel.send(&tx);
        sel.recv(&self.0.closed_rx);
        let op = sel.select();
        if op.index() == si {
            op.send(&tx, v)
                .map_err(|_| Panic::runtime("send on closed channel"))
        } else {
            let _ = op.recv(&self.0.closed_rx);
            Err(Panic::runtime("send on closed channel"))
        }
    }

    /// Blocking receive. A closed channel drains its buffer, then
    /// yields the element zero value with ok=false.
    pub fn recv(&self) -> (Value, bool) {
        if let Ok(v) = self.0.rx.try_recv() {
            return (v, true);
        }
        let mut sel = Select::new();
        let ri = sel.recv(&self.0.rx);
        sel.recv(&self.0.closed_rx);
        let op = sel.select();
        if op.index() == ri {
            match op.recv(&self.0.rx) {
                Ok(v) => (v, true),
                Err(_) => (zero(&self.0.elem), false),
            }
        } else {
            let _ = op.recv(&self.0.closed_rx);
            match self.0.rx.try_recv() {
                Ok(v) => (v, true),
                Err(_) => (zero(&self.0.elem), false),
            }
        }
    }

    pub fn close(&self) -> EvalResult<()> {
        let mut tx = self.0.tx.lock();
        if tx.is_none() {
            return Err(Panic::runtime("close of closed channel"));
        }
        *tx = None;
        *self.0.closed_tx.lock() = None;
        Ok(())
    }
}

// ── Multi-way select ─────────────────────────────────────────────────

/// One case of a multi-way select. A `None` channel is a nil channel
/// and is never ready.
pub struct SelCase {
    pub dir: ChanDir,
    pub chan: Option<ChanValue>,
    pub send: Option<Value>,
}

pub struct SelResult {
    /// Index of the chosen case; -1 when the default fired.
    pub chosen: i64,
    pub recv_ok: bool,
    /// The received value for a chosen receive case.
    pub value: Option<Value>,
}

enum OpKind {
    Recv,
    RecvClosed,
    Send(usize),
    SendClosed,
}

/// The host multi-way channel operation. Blocks until one case is
/// ready unless `blocking` is false, in which case the default fires
/// when nothing is immediately ready.
pub fn select_cases(cases: &[SelCase], blocking: bool) -> EvalResult<SelResult> {
    // Senders must be collected before building the Select so the
    // borrows stay stable.
    let mut txs: Vec<Sender<Value>> = Vec::new();
    let mut tx_of_case: Vec<Option<usize>> = Vec::with_capacity(cases.len());
    for case in cases {
        match (&case.chan, case.dir) {
            (Some(ch), ChanDir::SendOnly) => match ch.tx_clone() {
                Some(t) => {
                    txs.push(t);
                    tx_of_case.push(Some(txs.len() - 1));
                }
                None => tx_of_case.push(None),
            },
            _ => tx_of_case.push(None),
        }
    }

    let mut sel = Select::new();
    let mut ops: Vec<(usize, OpKind)> = Vec::new();
    for (ci, case) in cases.iter().enumerate() {
        let Some(ch) = &case.chan else { continue };
        match case.dir {
            ChanDir::SendOnly => {
                if let Some(ti) = tx_of_case[ci] {
                    let idx = sel.send(&txs[ti]);
                    debug_assert_eq!(idx, ops.len());
                    ops.push((ci, OpKind::Send(ti)));
                }
                // Already-closed or closing channels surface through
                // the close signal, which reads as ready.
                let idx = sel.recv(&ch.0.closed_rx);
                debug_assert_eq!(idx, ops.len());
                ops.push((ci, OpKind::SendClosed));
            }
            _ => {
                let idx = sel.recv(&ch.0.rx);
                debug_assert_eq!(idx, ops.len());
                ops.push((ci, OpKind::Recv));
                let idx = sel.recv(&ch.0.closed_rx);
                debug_assert_eq!(idx, ops.len());
                ops.push((ci, OpKind::RecvClosed));
            }
        }
    }

    if ops.is_empty() {
        if blocking {
            block_forever();
        }
        return Ok(SelResult { chosen: -1, recv_ok: false, value: None });
    }

    let op = if blocking {
        sel.select()
    } else {
        match sel.try_select() {
            Ok(op) => op,
            Err(_) => return Ok(SelResult { chosen: -1, recv_ok: false, value: None }),
        }
    };

    let (ci, kind) = &ops[op.index()];
    let case = &cases[*ci];
    let ch = case.chan.as_ref().expect("selected case has a channel");
    match kind {
        OpKind::Recv => match op.recv(&ch.0.rx) {
            Ok(v) => Ok(SelResult { chosen: *ci as i64, recv_ok: true, value: Some(v) }),
            Err(_) => Ok(SelResult { chosen: *ci as i64, recv_ok: false, value: None }),
        },
        OpKind::RecvClosed => {
            let _ = op.recv(&ch.0.closed_rx);
            match ch.0.rx.try_recv() {
                Ok(v) => Ok(SelResult { chosen: *ci as i64, recv_ok: true, value: Some(v) }),
                Err(_) => Ok(SelResult { chosen: *ci as i64, recv_ok: false, value: None }),
            }
        }
        OpKind::Send(ti) => {
            let v = case.send.clone().expect("send case carries a value");
            op.send(&txs[*ti], v)
                .map_err(|_| Panic::runtime("send on closed channel"))?;
            Ok(SelResult { chosen: *ci as i64, recv_ok: false, value: None })
        }
        OpKind::SendClosed => {
            let _ = op.recv(&ch.0.closed_rx);
            Err(Panic::runtime("send on closed channel"))
        }
    }
}

/// Operations on nil channels block forever.
pub fn block_forever() -> ! {
    let ch = never::<()>();
    let _ = ch.recv();
    unreachable!("never channel delivered a value")
}
