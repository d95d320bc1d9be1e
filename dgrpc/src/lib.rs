//! # dgrpc - datagram RPC datapath
//!
//! Request/response RPC over an unreliable, connectionless transport, in
//! the style of eRPC (NSDI 2019). The transport may drop or duplicate
//! packets; the datapath re-derives ordering per session slot, invokes each
//! request handler at most once, fires each continuation exactly once, and
//! paces clients with Timely rate control.
//!
//! ## Usage
//!
//! ```
//! use dgrpc::{Fabric, LoopbackTransport, ReqHandle, RespHandle, Rpc, RpcConfig};
//!
//! const ECHO: u8 = 1;
//!
//! fn echo(rpc: &mut Rpc<LoopbackTransport, usize>, mut req: ReqHandle) {
//!     let len = req.req_msgbuf().data_size();
//!     let data = req.req_msgbuf().data().to_vec();
//!     let resp = req.pre_resp_msgbuf_mut();
//!     resp.resize(len).unwrap();
//!     resp.data_mut().copy_from_slice(&data);
//!     rpc.enqueue_response(req).unwrap();
//! }
//!
//! fn done(rpc: &mut Rpc<LoopbackTransport, usize>, resp: RespHandle, _tag: usize) {
//!     assert_eq!(resp.resp_msgbuf().data(), b"ping");
//!     *rpc.context_mut() += 1;
//!     rpc.release_response(resp);
//! }
//!
//! let fabric = Fabric::new();
//! let config = RpcConfig::default();
//! let mut client = Rpc::new(LoopbackTransport::new(&fabric), config.clone(), 0).unwrap();
//! let mut server = Rpc::new(LoopbackTransport::new(&fabric), config, 0).unwrap();
//! server.register_req_handler(ECHO, echo);
//!
//! // Out-of-band handshake: exchange routing info and session numbers.
//! let cs = client.create_client_session(*server.local_routing_info()).unwrap();
//! let ss = server
//!     .create_server_session(*client.local_routing_info(), cs.session_num())
//!     .unwrap();
//! client.connect_client_session(cs, ss.session_num()).unwrap();
//!
//! let mut req = client.alloc_msg_buffer(4).unwrap();
//! req.data_mut().copy_from_slice(b"ping");
//! let resp = client.alloc_msg_buffer(64).unwrap();
//! client.enqueue_request(cs, ECHO, req, resp, done, 0).unwrap();
//!
//! while *client.context() == 0 {
//!     server.run_event_loop_once().unwrap();
//!     client.run_event_loop_once().unwrap();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`packet`]: 16-byte wire header (`PacketHeader`)
//! - [`buffer`]: Registered buffer allocator and message layout (`MsgBuffer`)
//! - [`transport`]: Transport trait and the in-process loopback fabric
//! - [`session`]: Sessions, slots and packet classification
//! - [`flow_control`]: Timely rate control and pacing
//! - [`rpc`]: Main RPC API (`Rpc`)
//!
//! ## References
//!
//! - [eRPC: General-Purpose RPCs for the Datacenter (NSDI 2019)](https://www.usenix.org/conference/nsdi19/presentation/kalia)
//! - [TIMELY: RTT-based Congestion Control for the Datacenter (SIGCOMM 2015)](https://dl.acm.org/doi/10.1145/2785956.2787510)

pub mod buffer;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod transport;

// Re-export main types
pub use buffer::{HugeAlloc, MsgBuffer};
pub use config::{RpcConfig, TimelyConfig};
pub use error::{Error, Result};
pub use flow_control::{Pacer, Timely};
pub use packet::{PKT_HDR_SIZE, PacketHeader, PktKind};
pub use rpc::{Continuation, ReqHandle, ReqHandler, RespHandle, Rpc};
pub use session::{PktOrder, SSlot, Session, SessionHandle, SessionRole, SessionState, classify};
pub use transport::{
    Fabric, LoopbackTransport, MemRegInfo, MemRegistrar, RoutingInfo, Transport, TransportType,
    TxItem,
};
