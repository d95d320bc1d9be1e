//! Main RPC implementation.
//!
//! [`Rpc`] owns a transport, the session table, the buffer allocator and
//! the application context. Everything runs on the calling thread: the
//! application drives the engine with [`Rpc::run_event_loop_once`], and
//! request handlers and continuations are plain functions that receive the
//! engine back, so they can allocate buffers, respond and issue new requests
//! from inside a callback.

use crate::buffer::{HugeAlloc, MsgBuffer};
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::packet::{MAX_MSG_SIZE, MAX_PKT_NUM, PKT_HDR_SIZE, PacketHeader};
use crate::session::{Session, SessionHandle, SessionRole, SessionState, SessionTable};
use crate::transport::{MemRegistrar, RoutingInfo, Transport};

mod handle;
mod rx;
mod tx;

pub use handle::{Continuation, ReqHandle, ReqHandler, RespHandle};

/// Session type stored by an [`Rpc`].
pub type RpcSession<T, C> = Session<Continuation<T, C>>;

/// RPC engine instance.
///
/// `T` is the transport, `C` the application context handed to every
/// handler and continuation through [`Rpc::context_mut`].
pub struct Rpc<T: Transport, C> {
    transport: T,
    context: C,
    config: RpcConfig,
    sessions: SessionTable<Continuation<T, C>>,
    req_handlers: Vec<Option<ReqHandler<T, C>>>,
    huge_alloc: HugeAlloc,
    max_data_per_pkt: usize,
    /// Client slots with request packets waiting for credits or pacing.
    stallq: Vec<(SessionHandle, usize)>,
    stallq_scratch: Vec<(SessionHandle, usize)>,
    /// Receive scratch, one MTU.
    rx_pkt: Vec<u8>,
    local_routing_info: RoutingInfo,
    epoch: minstant::Instant,
}

impl<T: Transport, C> Rpc<T, C> {
    /// Create a new RPC instance.
    pub fn new(transport: T, config: RpcConfig, context: C) -> Result<Self> {
        config.validate()?;

        let max_data_per_pkt = transport.max_data_per_pkt();
        if max_data_per_pkt == 0 {
            return Err(Error::InvalidConfig(format!(
                "transport MTU {} leaves no room for payload",
                transport.mtu()
            )));
        }

        let mut local_routing_info = RoutingInfo::default();
        transport.fill_local_routing_info(&mut local_routing_info);

        tracing::debug!(
            transport = %transport.transport_type(),
            mtu = transport.mtu(),
            req_window = config.req_window,
            session_credits = config.session_credits,
            enable_cc = config.enable_cc,
            "created rpc"
        );

        Ok(Self {
            rx_pkt: vec![0; transport.mtu()],
            transport,
            context,
            sessions: SessionTable::new(config.max_sessions),
            req_handlers: vec![None; u8::MAX as usize + 1],
            config,
            huge_alloc: HugeAlloc::new(),
            max_data_per_pkt,
            stallq: Vec::new(),
            stallq_scratch: Vec::new(),
            local_routing_info,
            epoch: minstant::Instant::now(),
        })
    }

    /// Register the handler for `req_type`, replacing any previous one.
    pub fn register_req_handler(&mut self, req_type: u8, handler: ReqHandler<T, C>) {
        if self.req_handlers[req_type as usize].replace(handler).is_some() {
            tracing::debug!(req_type, "replaced request handler");
        }
    }

    #[inline]
    pub fn context(&self) -> &C {
        &self.context
    }

    #[inline]
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[inline]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Get the configuration.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Get the maximum payload per packet.
    #[inline]
    pub fn max_data_per_pkt(&self) -> usize {
        self.max_data_per_pkt
    }

    /// Routing info peers use to reach this endpoint.
    pub fn local_routing_info(&self) -> &RoutingInfo {
        &self.local_routing_info
    }

    pub fn huge_alloc(&self) -> &HugeAlloc {
        &self.huge_alloc
    }

    pub fn session(&self, session: SessionHandle) -> Option<&RpcSession<T, C>> {
        self.sessions.get(session)
    }

    pub fn session_mut(&mut self, session: SessionHandle) -> Option<&mut RpcSession<T, C>> {
        self.sessions.get_mut(session)
    }

    /// Get the number of active sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.active_count()
    }

    /// Microseconds since the engine was created.
    #[inline]
    pub fn now_us(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1e6
    }

    // ---------------------------------------------------------------------
    // Message buffers
    // ---------------------------------------------------------------------

    /// Allocate a message buffer for up to `max_data_size` bytes.
    ///
    /// The buffer starts at its maximum size.
    pub fn alloc_msg_buffer(&mut self, max_data_size: usize) -> Result<MsgBuffer> {
        alloc_msgbuf(
            &mut self.huge_alloc,
            &mut self.transport,
            self.max_data_per_pkt,
            self.config.max_msg_size,
            max_data_size,
        )
    }

    /// Resize a message buffer within its allocated maximum.
    pub fn resize_msg_buffer(&self, msgbuf: &mut MsgBuffer, new_data_size: usize) -> Result<()> {
        msgbuf.resize(new_data_size)
    }

    /// Return a message buffer to the allocator.
    pub fn free_msg_buffer(&mut self, msgbuf: MsgBuffer) {
        self.huge_alloc.free(msgbuf.into_buffer());
    }

    /// Return both buffers of a completed exchange to the allocator.
    pub fn release_response(&mut self, resp: RespHandle) {
        let (req, resp) = resp.into_msgbufs();
        self.free_msg_buffer(req);
        self.free_msg_buffer(resp);
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    /// Create a client session towards `remote`. The session stays
    /// `Connecting` until [`Rpc::connect_client_session`].
    pub fn create_client_session(&mut self, mut remote: RoutingInfo) -> Result<SessionHandle> {
        self.transport.resolve_remote_routing_info(&mut remote)?;
        let handle = self
            .sessions
            .create_session(SessionRole::Client, remote, &self.config)?;
        tracing::debug!(session = handle.0, "created client session");
        Ok(handle)
    }

    /// Complete a client session with the server's session number.
    pub fn connect_client_session(
        &mut self,
        session: SessionHandle,
        remote_session_num: u16,
    ) -> Result<()> {
        let sess = self
            .sessions
            .get_mut(session)
            .ok_or(Error::SessionNotFound(session.0))?;
        if !sess.is_client() || sess.state != SessionState::Connecting {
            return Err(Error::InvalidSessionState(session.0));
        }
        sess.connect(remote_session_num);
        tracing::debug!(session = session.0, remote_session_num, "client session connected");
        Ok(())
    }

    /// Create a connected server session for a client whose session number
    /// is `remote_session_num`. Each slot gets a one-packet preallocated
    /// response buffer.
    pub fn create_server_session(
        &mut self,
        mut remote: RoutingInfo,
        remote_session_num: u16,
    ) -> Result<SessionHandle> {
        self.transport.resolve_remote_routing_info(&mut remote)?;
        let handle = self
            .sessions
            .create_session(SessionRole::Server, remote, &self.config)?;

        if let Err(e) = self.init_server_session(handle, remote_session_num) {
            self.destroy_session(handle)?;
            return Err(e);
        }
        tracing::debug!(session = handle.0, remote_session_num, "created server session");
        Ok(handle)
    }

    fn init_server_session(
        &mut self,
        handle: SessionHandle,
        remote_session_num: u16,
    ) -> Result<()> {
        let Some(sess) = self.sessions.get_mut(handle) else {
            return Err(Error::SessionNotFound(handle.0));
        };
        sess.connect(remote_session_num);
        for sslot in &mut sess.sslots {
            sslot.server_info.pre_resp_msgbuf = Some(alloc_msgbuf(
                &mut self.huge_alloc,
                &mut self.transport,
                self.max_data_per_pkt,
                self.config.max_msg_size,
                self.max_data_per_pkt,
            )?);
        }
        Ok(())
    }

    /// Tear down a session, returning every buffer its slots hold.
    ///
    /// Outstanding client requests are abandoned; their continuations never
    /// run. Deferred responses still held by the application become stale.
    pub fn destroy_session(&mut self, session: SessionHandle) -> Result<()> {
        let mut sess = self
            .sessions
            .remove(session)
            .ok_or(Error::SessionNotFound(session.0))?;
        sess.state = SessionState::Disconnecting;

        let abandoned = if sess.is_client() {
            sess.active_slots()
        } else {
            0
        };
        for sslot in &mut sess.sslots {
            for msgbuf in sslot.take_buffers() {
                self.huge_alloc.free(msgbuf.into_buffer());
            }
        }
        self.stallq.retain(|&(s, _)| s != session);

        tracing::debug!(session = session.0, abandoned, "destroyed session");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Event loop
    // ---------------------------------------------------------------------

    /// Run one iteration of the event loop.
    ///
    /// Drains up to `rx_batch` packets, then retries credit-stalled
    /// requests. Returns the number of packets received. A fatal error stops
    /// the batch; non-fatal packet errors are logged and the packet dropped.
    pub fn run_event_loop_once(&mut self) -> Result<usize> {
        let mut pkt = std::mem::take(&mut self.rx_pkt);
        let received = self.rx_burst(&mut pkt);
        self.rx_pkt = pkt;

        let received = received?;
        self.drain_stallq()?;
        Ok(received)
    }

    fn rx_burst(&mut self, pkt: &mut [u8]) -> Result<usize> {
        let mut received = 0;
        while received < self.config.rx_batch {
            let Some(len) = self.transport.poll_recv(pkt) else {
                break;
            };
            received += 1;

            let res = PacketHeader::from_bytes(&pkt[..len])
                .and_then(|hdr| self.process_pkt(&hdr, &pkt[PKT_HDR_SIZE..len]));
            match res {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(error = %e, "dropping packet"),
            }
        }
        Ok(received)
    }
}

impl<T: Transport, C> Drop for Rpc<T, C> {
    fn drop(&mut self) {
        self.huge_alloc.deregister_all(&mut self.transport);
    }
}

/// Allocate a message buffer. Takes the allocator and registrar separately
/// so it can run while a session is borrowed.
fn alloc_msgbuf(
    huge_alloc: &mut HugeAlloc,
    reg: &mut dyn MemRegistrar,
    max_data_per_pkt: usize,
    max_msg_size: usize,
    max_data_size: usize,
) -> Result<MsgBuffer> {
    let max = max_msg_size.min(MAX_MSG_SIZE);
    let num_pkts = PacketHeader::calc_num_pkts(max_data_size, max_data_per_pkt);
    if max_data_size > max || num_pkts > MAX_PKT_NUM as usize + 1 {
        return Err(Error::MessageTooLarge {
            size: max_data_size,
            max,
        });
    }

    let buffer = huge_alloc.alloc(
        MsgBuffer::required_capacity(max_data_size, num_pkts),
        reg,
    )?;
    MsgBuffer::from_buffer(buffer, max_data_size, max_data_per_pkt)
}
