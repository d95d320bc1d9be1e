//! Common test utilities for dgrpc integration tests.

#![allow(dead_code)]

use std::rc::Rc;

use dgrpc::{
    Fabric, LoopbackTransport, PacketHeader, ReqHandle, RespHandle, RoutingInfo, Rpc, RpcConfig,
    SessionHandle, Transport,
};

pub const REQ_ECHO: u8 = 1;

pub type TestRpc = Rpc<LoopbackTransport, Ctx>;

/// Application context shared by the test handlers and continuations.
#[derive(Default)]
pub struct Ctx {
    /// Request handler invocations.
    pub handled: usize,
    /// Park requests in `deferred` instead of responding.
    pub defer: bool,
    pub deferred: Vec<ReqHandle>,
    /// Respond with this many pattern bytes instead of echoing.
    pub resp_size: Option<usize>,
    pub completions: Vec<Completion>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub tag: usize,
    pub req_num: u64,
    pub data: Vec<u8>,
}

/// Deterministic payload bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn echo_handler(rpc: &mut TestRpc, req: ReqHandle) {
    rpc.context_mut().handled += 1;
    if rpc.context().defer {
        rpc.context_mut().deferred.push(req);
        return;
    }
    respond(rpc, req);
}

/// Fill and send the response for `req`, using the preallocated buffer
/// when it is large enough.
pub fn respond(rpc: &mut TestRpc, mut req: ReqHandle) {
    let data = match rpc.context().resp_size {
        Some(n) => pattern(n, req.req_num() as u8),
        None => req.req_msgbuf().data().to_vec(),
    };

    if data.len() <= req.pre_resp_msgbuf().max_data_size() {
        let resp = req.pre_resp_msgbuf_mut();
        resp.resize(data.len()).unwrap();
        resp.data_mut().copy_from_slice(&data);
    } else {
        let mut dyn_resp = rpc.alloc_msg_buffer(data.len()).unwrap();
        dyn_resp.data_mut().copy_from_slice(&data);
        assert!(req.set_dyn_resp_msgbuf(dyn_resp).is_none());
    }
    rpc.enqueue_response(req).unwrap();
}

pub fn record(rpc: &mut TestRpc, resp: RespHandle, tag: usize) {
    let completion = Completion {
        tag,
        req_num: resp.req_num(),
        data: resp.resp_msgbuf().data().to_vec(),
    };
    rpc.context_mut().completions.push(completion);
    rpc.release_response(resp);
}

pub fn routing_info(transport: &LoopbackTransport) -> RoutingInfo {
    let mut info = RoutingInfo::default();
    transport.fill_local_routing_info(&mut info);
    info
}

/// Raw wire form of a packet.
pub fn wire(hdr: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut pkt = hdr.encode().to_vec();
    pkt.extend_from_slice(payload);
    pkt
}

/// Receive everything queued for a raw endpoint.
pub fn drain(peer: &mut LoopbackTransport) -> Vec<(PacketHeader, Vec<u8>)> {
    let mut buf = vec![0u8; peer.mtu()];
    let mut pkts = Vec::new();
    while let Some(len) = peer.poll_recv(&mut buf) {
        let hdr = PacketHeader::from_bytes(&buf[..len]).unwrap();
        pkts.push((hdr, buf[dgrpc::PKT_HDR_SIZE..len].to_vec()));
    }
    pkts
}

/// A client and a server engine connected through one session.
pub struct Pair {
    pub fabric: Rc<Fabric>,
    pub client: TestRpc,
    pub server: TestRpc,
    pub cs: SessionHandle,
    pub ss: SessionHandle,
}

impl Pair {
    pub fn new(config: RpcConfig) -> Self {
        let fabric = Fabric::new();
        let mut client =
            Rpc::new(LoopbackTransport::new(&fabric), config.clone(), Ctx::default()).unwrap();
        let mut server = Rpc::new(LoopbackTransport::new(&fabric), config, Ctx::default()).unwrap();
        server.register_req_handler(REQ_ECHO, echo_handler);

        let cs = client
            .create_client_session(*server.local_routing_info())
            .unwrap();
        let ss = server
            .create_server_session(*client.local_routing_info(), cs.session_num())
            .unwrap();
        client.connect_client_session(cs, ss.session_num()).unwrap();

        Self {
            fabric,
            client,
            server,
            cs,
            ss,
        }
    }

    /// Enqueue an echo request carrying `data`.
    pub fn send(&mut self, data: &[u8], resp_capacity: usize, tag: usize) -> u64 {
        let mut req = self.client.alloc_msg_buffer(data.len()).unwrap();
        req.data_mut().copy_from_slice(data);
        let resp = self.client.alloc_msg_buffer(resp_capacity).unwrap();
        self.client
            .enqueue_request(self.cs, REQ_ECHO, req, resp, record, tag)
            .unwrap()
    }

    /// Run both event loops until nothing is in flight.
    pub fn run_until_idle(&mut self) {
        for _ in 0..10_000 {
            let rx = self.server.run_event_loop_once().unwrap()
                + self.client.run_event_loop_once().unwrap();
            if rx == 0 && self.fabric.in_flight() == 0 && self.client.stalled_requests() == 0 {
                return;
            }
        }
        panic!("event loops did not go idle");
    }

    pub fn completions(&self) -> &[Completion] {
        &self.client.context().completions
    }
}

/// A server engine with one session whose client is a raw endpoint.
pub struct ServerHarness {
    pub fabric: Rc<Fabric>,
    pub peer: LoopbackTransport,
    pub server: TestRpc,
    pub ss: SessionHandle,
}

impl ServerHarness {
    pub fn new(config: RpcConfig) -> Self {
        let fabric = Fabric::new();
        let peer = LoopbackTransport::new(&fabric);
        let mut server = Rpc::new(LoopbackTransport::new(&fabric), config, Ctx::default()).unwrap();
        server.register_req_handler(REQ_ECHO, echo_handler);
        let ss = server.create_server_session(routing_info(&peer), 0).unwrap();

        Self {
            fabric,
            peer,
            server,
            ss,
        }
    }

    pub fn req_hdr(&self, req_num: u64, pkt_num: u16, msg_size: usize) -> PacketHeader {
        PacketHeader::new_req(REQ_ECHO, msg_size, self.ss.session_num(), pkt_num, req_num)
    }

    pub fn tx_count(&self) -> usize {
        self.server.transport().tx_log().len()
    }

    pub fn flush_count(&self) -> usize {
        self.server.transport().tx_flush_count()
    }
}

/// A client engine with one connected session whose server is a raw
/// endpoint.
pub struct ClientHarness {
    pub fabric: Rc<Fabric>,
    pub peer: LoopbackTransport,
    pub client: TestRpc,
    pub cs: SessionHandle,
}

/// Session number the raw server pretends to use.
pub const PEER_SESSION_NUM: u16 = 5;

impl ClientHarness {
    pub fn new(config: RpcConfig) -> Self {
        let fabric = Fabric::new();
        let peer = LoopbackTransport::new(&fabric);
        let mut client = Rpc::new(LoopbackTransport::new(&fabric), config, Ctx::default()).unwrap();
        let cs = client.create_client_session(routing_info(&peer)).unwrap();
        client.connect_client_session(cs, PEER_SESSION_NUM).unwrap();

        Self {
            fabric,
            peer,
            client,
            cs,
        }
    }

    pub fn send(&mut self, data: &[u8], resp_capacity: usize, tag: usize) -> u64 {
        let mut req = self.client.alloc_msg_buffer(data.len()).unwrap();
        req.data_mut().copy_from_slice(data);
        let resp = self.client.alloc_msg_buffer(resp_capacity).unwrap();
        self.client
            .enqueue_request(self.cs, REQ_ECHO, req, resp, record, tag)
            .unwrap()
    }

    /// Deliver a packet to the client and run one event loop pass.
    pub fn deliver(&mut self, hdr: &PacketHeader, payload: &[u8]) -> dgrpc::Result<usize> {
        self.fabric.inject(self.client.transport().port(), &wire(hdr, payload));
        self.client.run_event_loop_once()
    }

    pub fn expl_cr(&self, req_num: u64, pkt_num: u16) -> PacketHeader {
        PacketHeader::new_expl_cr(REQ_ECHO, self.cs.session_num(), pkt_num, req_num)
    }

    pub fn resp_hdr(&self, req_num: u64, pkt_num: u16, msg_size: usize) -> PacketHeader {
        PacketHeader::new_resp(REQ_ECHO, msg_size, self.cs.session_num(), pkt_num, req_num)
    }

    pub fn credits(&self) -> usize {
        self.client.session(self.cs).unwrap().available_credits()
    }
}
