//! Session and SSlot management.
//!
//! A session is one end of a logical connection to a remote endpoint.
//! SSlots (session slots) track individual request/response exchanges: each
//! session has `req_window` of them, and request `r` always lives in slot
//! `r % req_window`.

use crate::buffer::MsgBuffer;
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::flow_control::{Pacer, Timely};
use crate::transport::RoutingInfo;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created locally, waiting for the peer's session number.
    Connecting,
    /// Ready for requests.
    Connected,
    /// Being torn down; packets for it are dropped.
    Disconnecting,
}

/// Which end of the exchange this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Where a packet's request number falls relative to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktOrder {
    /// Older than the slot's current exchange.
    Past,
    /// Same exchange as the slot's current one.
    Current,
    /// Exactly one window ahead: the slot's next exchange.
    Next,
    /// Anything further ahead. Never produced by a correct peer.
    Future,
}

/// Place `req_num` relative to a slot whose current request is `cur_req_num`.
///
/// Request numbers never wrap: they are 44 bits on the wire, and a client
/// slot refuses new requests once the next number would exceed
/// [`MAX_REQ_NUM`](crate::packet::MAX_REQ_NUM).
#[inline]
pub fn classify(req_num: u64, cur_req_num: u64, req_window: u64) -> PktOrder {
    if req_num < cur_req_num {
        PktOrder::Past
    } else if req_num == cur_req_num {
        PktOrder::Current
    } else if req_num == cur_req_num + req_window {
        PktOrder::Next
    } else {
        PktOrder::Future
    }
}

/// Client-side state of an exchange.
pub struct ClientInfo<K> {
    /// Caller-supplied buffer the response is reassembled into.
    pub resp_msgbuf: Option<MsgBuffer>,
    /// Completion callback, taken when the response completes.
    pub cont: Option<K>,
    /// Opaque caller value handed back to the continuation.
    pub tag: usize,
    /// Request packets handed to the transport.
    pub req_sent: usize,
    /// Explicit credit returns received, in packet order.
    pub expl_cr_rcvd: usize,
    /// Response packets received, in packet order.
    pub resp_rcvd: usize,
    /// Time (µs) the most recent request packet left.
    pub tx_ts: f64,
}

impl<K> Default for ClientInfo<K> {
    fn default() -> Self {
        Self {
            resp_msgbuf: None,
            cont: None,
            tag: 0,
            req_sent: 0,
            expl_cr_rcvd: 0,
            resp_rcvd: 0,
            tx_ts: 0.0,
        }
    }
}

/// Server-side state of an exchange.
#[derive(Default)]
pub struct ServerInfo {
    pub req_type: u8,
    /// Reassembly buffer, kept across exchanges for reuse.
    pub req_msgbuf: Option<MsgBuffer>,
    /// Size of the current request.
    pub req_size: usize,
    /// Request packets received, in packet order.
    pub req_rcvd: usize,
    /// One-packet response buffer owned by the slot. `None` while lent to a
    /// handler or while it is the slot's `tx_msgbuf`.
    pub pre_resp_msgbuf: Option<MsgBuffer>,
    /// True when `tx_msgbuf` is the preallocated buffer.
    pub prealloc_used: bool,
}

/// Session Slot (SSlot) for tracking a single request/response exchange.
pub struct SSlot<K> {
    /// Slot index within the session (0..req_window).
    pub index: usize,
    /// Request number of the exchange this slot currently holds.
    pub cur_req_num: u64,
    /// Client: the request being sent. Server: the response, once ready.
    pub tx_msgbuf: Option<MsgBuffer>,
    pub client_info: ClientInfo<K>,
    pub server_info: ServerInfo,
}

impl<K> SSlot<K> {
    /// Create an idle slot. Its first exchange will be `index + req_window`.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            cur_req_num: index as u64,
            tx_msgbuf: None,
            client_info: ClientInfo::default(),
            server_info: ServerInfo::default(),
        }
    }

    /// Drain every buffer the slot holds.
    pub fn take_buffers(&mut self) -> Vec<MsgBuffer> {
        [
            self.tx_msgbuf.take(),
            self.client_info.resp_msgbuf.take(),
            self.server_info.req_msgbuf.take(),
            self.server_info.pre_resp_msgbuf.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// A handle to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u16);

impl SessionHandle {
    /// Get the session number.
    #[inline]
    pub fn session_num(&self) -> u16 {
        self.0
    }
}

/// Session: one end of a connection, with `req_window` slots.
///
/// `K` is the continuation type stored in client slots.
pub struct Session<K> {
    pub local_session_num: u16,
    /// Session number at the peer, stamped into every outgoing header.
    pub remote_session_num: u16,
    pub role: SessionRole,
    pub state: SessionState,
    /// Resolved routing info of the peer.
    pub remote_routing_info: RoutingInfo,
    pub sslots: Vec<SSlot<K>>,
    /// Request packets this client may still send unacknowledged.
    pub credits: usize,
    pub req_window: usize,
    /// Timely state, when congestion control is enabled.
    pub cc: Option<Timely>,
    pub pacer: Pacer,
    free_sslots: Vec<usize>,
    max_credits: usize,
}

impl<K> Session<K> {
    pub fn new(
        local_session_num: u16,
        role: SessionRole,
        remote_routing_info: RoutingInfo,
        config: &RpcConfig,
    ) -> Self {
        let req_window = config.req_window;
        let cc = (config.enable_cc && role == SessionRole::Client)
            .then(|| Timely::new(config.timely));
        let state = match role {
            SessionRole::Client => SessionState::Connecting,
            SessionRole::Server => SessionState::Connected,
        };

        Self {
            local_session_num,
            remote_session_num: 0,
            role,
            state,
            remote_routing_info,
            sslots: (0..req_window).map(SSlot::new).collect(),
            credits: config.session_credits,
            req_window,
            cc,
            pacer: Pacer::new(),
            free_sslots: (0..req_window).rev().collect(),
            max_credits: config.session_credits,
        }
    }

    #[inline]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle(self.local_session_num)
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Record the peer's session number and mark as connected.
    pub fn connect(&mut self, remote_session_num: u16) {
        self.remote_session_num = remote_session_num;
        self.state = SessionState::Connected;
    }

    /// Slot that holds request `req_num`.
    #[inline]
    pub fn sslot_idx(&self, req_num: u64) -> usize {
        (req_num % self.req_window as u64) as usize
    }

    #[inline]
    pub fn sslot(&self, idx: usize) -> Option<&SSlot<K>> {
        self.sslots.get(idx)
    }

    #[inline]
    pub fn sslot_mut(&mut self, idx: usize) -> Option<&mut SSlot<K>> {
        self.sslots.get_mut(idx)
    }

    /// Take an idle client slot.
    #[inline]
    pub fn alloc_sslot(&mut self) -> Option<usize> {
        self.free_sslots.pop()
    }

    /// Return a client slot once its exchange has completed.
    pub fn free_sslot(&mut self, idx: usize) {
        debug_assert!(idx < self.req_window);
        debug_assert!(!self.free_sslots.contains(&idx));
        self.free_sslots.push(idx);
    }

    /// Number of idle client slots.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.free_sslots.len()
    }

    /// Number of client slots with an exchange in progress.
    #[inline]
    pub fn active_slots(&self) -> usize {
        self.req_window - self.free_sslots.len()
    }

    #[inline]
    pub fn available_credits(&self) -> usize {
        self.credits
    }

    #[inline]
    pub fn max_credits(&self) -> usize {
        self.max_credits
    }

    /// Return `n` credits.
    pub fn return_credits(&mut self, n: usize) {
        self.credits += n;
        debug_assert!(self.credits <= self.max_credits);
    }
}

/// Session table for managing multiple sessions.
pub struct SessionTable<K> {
    sessions: Vec<Option<Session<K>>>,
    /// Next session number to allocate.
    next_session_num: u16,
}

impl<K> SessionTable<K> {
    /// Create a new session table.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: (0..max_sessions).map(|_| None).collect(),
            next_session_num: 0,
        }
    }

    /// Allocate a new session number.
    fn alloc_session_num(&mut self) -> Option<u16> {
        let start = self.next_session_num as usize;
        for i in 0..self.sessions.len() {
            let idx = (start + i) % self.sessions.len();
            if self.sessions[idx].is_none() {
                self.next_session_num = ((idx + 1) % self.sessions.len()) as u16;
                return Some(idx as u16);
            }
        }
        None
    }

    /// Create a new session.
    pub fn create_session(
        &mut self,
        role: SessionRole,
        remote_routing_info: RoutingInfo,
        config: &RpcConfig,
    ) -> Result<SessionHandle> {
        let session_num = self
            .alloc_session_num()
            .ok_or(Error::TooManySessions(self.sessions.len()))?;

        let session = Session::new(session_num, role, remote_routing_info, config);
        let handle = session.handle();

        self.sessions[session_num as usize] = Some(session);
        Ok(handle)
    }

    /// Get a reference to a session.
    pub fn get(&self, handle: SessionHandle) -> Option<&Session<K>> {
        self.sessions
            .get(handle.0 as usize)
            .and_then(|s| s.as_ref())
    }

    /// Get a mutable reference to a session.
    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session<K>> {
        self.sessions
            .get_mut(handle.0 as usize)
            .and_then(|s| s.as_mut())
    }

    /// Remove a session.
    pub fn remove(&mut self, handle: SessionHandle) -> Option<Session<K>> {
        self.sessions
            .get_mut(handle.0 as usize)
            .and_then(|s| s.take())
    }

    /// Get the number of active sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    /// Iterate over all active sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session<K>> {
        self.sessions.iter().filter_map(|s| s.as_ref())
    }

    /// Iterate mutably over all active sessions.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<K>> {
        self.sessions.iter_mut().filter_map(|s| s.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let w = 8;
        assert_eq!(classify(8, 8, w), PktOrder::Current);
        assert_eq!(classify(16, 8, w), PktOrder::Next);
        assert_eq!(classify(0, 8, w), PktOrder::Past);
        assert_eq!(classify(24, 8, w), PktOrder::Future);
        assert_eq!(classify(9, 8, w), PktOrder::Future);
    }

    #[test]
    fn test_sslot_initial_req_num() {
        let config = RpcConfig::new().with_req_window(4);
        let session: Session<()> =
            Session::new(0, SessionRole::Server, RoutingInfo::default(), &config);

        for (i, sslot) in session.sslots.iter().enumerate() {
            assert_eq!(sslot.cur_req_num, i as u64);
            assert_eq!(session.sslot_idx(sslot.cur_req_num + 4), i);
        }
        assert!(session.is_connected());
    }

    #[test]
    fn test_client_starts_connecting() {
        let config = RpcConfig::default();
        let mut session: Session<()> =
            Session::new(3, SessionRole::Client, RoutingInfo::default(), &config);

        assert_eq!(session.state, SessionState::Connecting);
        assert!(session.cc.is_none());
        session.connect(7);
        assert!(session.is_connected());
        assert_eq!(session.remote_session_num, 7);
    }

    #[test]
    fn test_sslot_alloc_free() {
        let config = RpcConfig::new().with_req_window(2);
        let mut session: Session<()> =
            Session::new(0, SessionRole::Client, RoutingInfo::default(), &config);

        assert_eq!(session.alloc_sslot(), Some(0));
        assert_eq!(session.alloc_sslot(), Some(1));
        assert_eq!(session.alloc_sslot(), None);
        assert_eq!(session.active_slots(), 2);

        session.free_sslot(1);
        assert_eq!(session.free_slots(), 1);
        assert_eq!(session.alloc_sslot(), Some(1));
    }

    #[test]
    fn test_credits() {
        let config = RpcConfig::new().with_session_credits(4).with_cc(true);
        let mut session: Session<()> =
            Session::new(0, SessionRole::Client, RoutingInfo::default(), &config);

        assert_eq!(session.available_credits(), 4);
        session.credits -= 3;
        session.return_credits(2);
        assert_eq!(session.available_credits(), 3);
        assert_eq!(session.max_credits(), 4);
        assert!(session.cc.is_some());
    }

    #[test]
    fn test_server_has_no_cc() {
        let config = RpcConfig::new().with_cc(true);
        let session: Session<()> =
            Session::new(0, SessionRole::Server, RoutingInfo::default(), &config);
        assert!(session.cc.is_none());
    }

    #[test]
    fn test_session_table() {
        let config = RpcConfig::default();
        let mut table: SessionTable<()> = SessionTable::new(2);

        let a = table
            .create_session(SessionRole::Client, RoutingInfo::default(), &config)
            .unwrap();
        let b = table
            .create_session(SessionRole::Server, RoutingInfo::default(), &config)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(table.active_count(), 2);

        let err = table
            .create_session(SessionRole::Client, RoutingInfo::default(), &config)
            .err();
        assert!(matches!(err, Some(Error::TooManySessions(2))));

        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert_eq!(table.get(b).map(|s| s.role), Some(SessionRole::Server));
    }
}
