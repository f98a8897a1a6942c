//! Guest-facing IPC plumbing shared by the service servers.
//!
//! Transport is out of scope: a request arrives as an [`IpcContext`] carrying
//! the caller's session id, client thread and a [`StatusCell`], and a server
//! either completes it immediately or parks the status cell to resolve it
//! later from the transition machine or a timer callback.

use std::cell::Cell;
use std::rc::Rc;

/// Unique id of a connected session.
pub type SessionId = u64;

/// The guest thread a request was issued from.
///
/// Status cells live in guest process memory, so the resolving side keeps the
/// owning thread alongside the cell to make the process context explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientThread(pub u64);

/// A guest-side request status cell.
///
/// Starts pending; `resolve` writes the completion code. Clones alias the
/// same cell, mirroring how the kernel and the guest both reference one word
/// of guest memory.
#[derive(Debug, Clone, Default)]
pub struct StatusCell {
    inner: Rc<Cell<Option<i32>>>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, code: i32) {
        self.inner.set(Some(code));
    }

    pub fn value(&self) -> Option<i32> {
        self.inner.get()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.get().is_none()
    }
}

/// One in-flight request.
#[derive(Debug, Clone)]
pub struct IpcContext {
    pub session: SessionId,
    pub thread: ClientThread,
    pub status: StatusCell,
}

impl IpcContext {
    pub fn new(session: SessionId, thread: ClientThread) -> Self {
        Self {
            session,
            thread,
            status: StatusCell::new(),
        }
    }

    /// Completes the request with a raw status code.
    ///
    /// Positive codes are valid completions (e.g. counts); errors use the
    /// [`SysError`] table.
    pub fn complete(&self, code: i32) {
        self.status.resolve(code);
    }

    pub fn complete_err(&self, err: SysError) {
        self.status.resolve(err.code());
    }
}

/// Status codes surfaced to guests.
///
/// These cross the IPC boundary as raw `i32` completion values, so the
/// mapping is explicit rather than derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysError {
    Success,
    NotFound,
    Cancel,
    InUse,
    NotReady,
    TimedOut,
    BadHierarchyId,
    BadDomainId,
    BadSequence,
    NotJoined,
    /// Observer-log marker for a transition that has been requested but not
    /// yet acknowledged.
    Outstanding,
}

impl SysError {
    pub const fn code(self) -> i32 {
        match self {
            SysError::Success => 0,
            SysError::NotFound => -1,
            SysError::Cancel => -3,
            SysError::InUse => -14,
            SysError::NotReady => -18,
            SysError::TimedOut => -33,
            SysError::BadHierarchyId => -4561,
            SysError::BadDomainId => -4562,
            SysError::BadSequence => -4563,
            SysError::NotJoined => -4564,
            SysError::Outstanding => -4565,
        }
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => SysError::Success,
            -1 => SysError::NotFound,
            -3 => SysError::Cancel,
            -14 => SysError::InUse,
            -18 => SysError::NotReady,
            -33 => SysError::TimedOut,
            -4561 => SysError::BadHierarchyId,
            -4562 => SysError::BadDomainId,
            -4563 => SysError::BadSequence,
            -4564 => SysError::NotJoined,
            -4565 => SysError::Outstanding,
            _ => return None,
        })
    }
}

impl From<SysError> for i32 {
    fn from(err: SysError) -> Self {
        err.code()
    }
}
