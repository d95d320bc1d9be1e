//! dgrpc microbenchmarks.
//!
//! Measures:
//! 1. Packet header encode/decode
//! 2. Timely rate updates
//! 3. RPC latency over the loopback fabric (single request, wait for response)
//! 4. RPC throughput over the loopback fabric (pipelined requests)
//!
//! Client and server share one thread, so the RPC numbers are the datapath's
//! own cost with no NIC or cross-core traffic involved.
//!
//! Run with:
//! ```bash
//! cargo bench --package dgrpc --bench rpc_bench
//! ```

use std::hint::black_box;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use dgrpc::{
    Fabric, LoopbackTransport, MsgBuffer, PacketHeader, ReqHandle, RespHandle, Rpc, RpcConfig,
    SessionHandle, Timely, TimelyConfig,
};

// =============================================================================
// Constants
// =============================================================================

const REQ_ECHO: u8 = 1;
const SMALL_MSG_SIZE: usize = 32;
// Spans four packets at the loopback MTU.
const LARGE_MSG_SIZE: usize = 4000;
const PIPELINE_DEPTH: usize = 8;

// =============================================================================
// Setup
// =============================================================================

#[derive(Default)]
struct ClientCtx {
    completed: u64,
    /// Request/response buffer pairs ready for reuse.
    free: Vec<(MsgBuffer, MsgBuffer)>,
}

type Client = Rpc<LoopbackTransport, ClientCtx>;
type Server = Rpc<LoopbackTransport, ()>;

struct BenchmarkSetup {
    client: Client,
    server: Server,
    session: SessionHandle,
}

fn echo(rpc: &mut Server, mut req: ReqHandle) {
    let len = req.req_msgbuf().data_size();
    if len <= req.pre_resp_msgbuf().max_data_size() {
        let data = req.req_msgbuf().data().to_vec();
        let resp = req.pre_resp_msgbuf_mut();
        if resp.resize(len).is_err() {
            return;
        }
        resp.data_mut().copy_from_slice(&data);
    } else {
        let Ok(mut resp) = rpc.alloc_msg_buffer(len) else {
            return;
        };
        resp.data_mut().copy_from_slice(req.req_msgbuf().data());
        if let Some(old) = req.set_dyn_resp_msgbuf(resp) {
            rpc.free_msg_buffer(old);
        }
    }
    let _ = rpc.enqueue_response(req);
}

fn on_response(rpc: &mut Client, resp: RespHandle, _tag: usize) {
    let ctx = rpc.context_mut();
    ctx.completed += 1;
    ctx.free.push(resp.into_msgbufs());
}

fn setup_benchmark(msg_size: usize, depth: usize) -> BenchmarkSetup {
    let fabric = Fabric::new();
    let config = RpcConfig::default().with_req_window(depth.max(1));

    let mut client = Rpc::new(
        LoopbackTransport::new(&fabric),
        config.clone(),
        ClientCtx::default(),
    )
    .expect("Failed to create client");
    let mut server =
        Rpc::new(LoopbackTransport::new(&fabric), config, ()).expect("Failed to create server");
    server.register_req_handler(REQ_ECHO, echo);

    let session = client
        .create_client_session(*server.local_routing_info())
        .expect("Failed to create client session");
    let server_session = server
        .create_server_session(*client.local_routing_info(), session.session_num())
        .expect("Failed to create server session");
    client
        .connect_client_session(session, server_session.session_num())
        .expect("Failed to connect");

    for _ in 0..depth {
        let mut req = client.alloc_msg_buffer(msg_size).expect("alloc request");
        req.data_mut().fill(0xAA);
        let resp = client.alloc_msg_buffer(msg_size).expect("alloc response");
        client.context_mut().free.push((req, resp));
    }

    BenchmarkSetup {
        client,
        server,
        session,
    }
}

impl BenchmarkSetup {
    fn send_one(&mut self) -> bool {
        let Some((req, resp)) = self.client.context_mut().free.pop() else {
            return false;
        };
        self.client
            .enqueue_request(self.session, REQ_ECHO, req, resp, on_response, 0)
            .is_ok()
    }

    fn poll(&mut self) {
        let _ = self.server.run_event_loop_once();
        let _ = self.client.run_event_loop_once();
    }
}

// =============================================================================
// Benchmark Functions
// =============================================================================

/// Ping-pong latency benchmark (single request, wait for response).
fn run_latency_bench(setup: &mut BenchmarkSetup, iters: u64) -> Duration {
    let start = minstant::Instant::now();

    for _ in 0..iters {
        let target = setup.client.context().completed + 1;
        if !setup.send_one() {
            continue;
        }
        while setup.client.context().completed < target {
            setup.poll();
        }
    }

    start.elapsed()
}

/// Throughput benchmark (pipelined requests).
fn run_throughput_bench(setup: &mut BenchmarkSetup, iters: u64) -> Duration {
    let base = setup.client.context().completed;
    let mut sent = 0u64;

    let start = minstant::Instant::now();

    while setup.client.context().completed - base < iters {
        while sent < iters && setup.send_one() {
            sent += 1;
        }
        setup.poll();
    }

    start.elapsed()
}

fn bench_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("dgrpc_header");
    group.throughput(Throughput::Elements(1));

    let hdr = PacketHeader::new_req(REQ_ECHO, 4000, 7, 3, 1 << 40);
    let bytes = hdr.encode();

    group.bench_function("encode", |b| b.iter(|| black_box(&hdr).encode()));
    group.bench_function("decode", |b| {
        b.iter(|| PacketHeader::from_bytes(black_box(&bytes)))
    });

    group.finish();
}

fn bench_timely(c: &mut Criterion) {
    let mut group = c.benchmark_group("dgrpc_timely");
    group.throughput(Throughput::Elements(1));

    group.bench_function("update_rate", |b| {
        let mut timely = Timely::new(TimelyConfig::default());
        let mut now = 0.0;
        b.iter(|| {
            now += 1.0;
            // Sweep all three delay regions.
            let rtt = 20.0 + (now % 1200.0);
            timely.update_rate(black_box(rtt), now);
        });
        black_box(timely.rate());
    });

    group.finish();
}

fn bench_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("dgrpc_latency");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(3));
    group.throughput(Throughput::Elements(1));

    for (name, size) in [("32B", SMALL_MSG_SIZE), ("4KB", LARGE_MSG_SIZE)] {
        let mut setup = setup_benchmark(size, 1);
        group.bench_function(BenchmarkId::new("pingpong", name), |b| {
            b.iter_custom(|iters| run_latency_bench(&mut setup, iters));
        });
    }

    group.finish();
}

fn bench_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("dgrpc_throughput");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(3));
    group.throughput(Throughput::Elements(1));

    for (name, size) in [("32B", SMALL_MSG_SIZE), ("4KB", LARGE_MSG_SIZE)] {
        let mut setup = setup_benchmark(size, PIPELINE_DEPTH);
        group.bench_function(
            BenchmarkId::new("pipelined", format!("{name}_depth{PIPELINE_DEPTH}")),
            |b| {
                b.iter_custom(|iters| run_throughput_bench(&mut setup, iters));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_header,
    bench_timely,
    bench_latency,
    bench_throughput
);
criterion_main!(benches);
