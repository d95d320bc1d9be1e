//! Transmit path: requests, responses and explicit credit returns.

use crate::buffer::MsgBuffer;
use crate::error::{Error, Result};
use crate::packet::{MAX_REQ_NUM, PKT_HDR_SIZE, PacketHeader};
use crate::session::{ClientInfo, SessionHandle, SessionRole};
use crate::transport::{Transport, TxItem};

use super::{Continuation, ReqHandle, Rpc};

impl<T: Transport, C> Rpc<T, C> {
    /// Enqueue a request on a connected client session.
    ///
    /// The request is transmitted as far as session credits (and the pacer,
    /// with congestion control) allow; the rest goes out from later event
    /// loop passes. `cont` runs exactly once, with `tag`, when the whole
    /// response has arrived in `resp_msgbuf` (grown if it is too small).
    ///
    /// If the request cannot be enqueued, both buffers are returned to the
    /// allocator and the error is returned. Transmit failures after that
    /// point leave the request stalled; later event loop passes retry it.
    pub fn enqueue_request(
        &mut self,
        session: SessionHandle,
        req_type: u8,
        req_msgbuf: MsgBuffer,
        resp_msgbuf: MsgBuffer,
        cont: Continuation<T, C>,
        tag: usize,
    ) -> Result<u64> {
        let claimed =
            self.claim_client_sslot(session, req_type, req_msgbuf, resp_msgbuf, cont, tag);
        let req_num = match claimed {
            Ok(req_num) => req_num,
            Err((e, bufs)) => {
                for msgbuf in bufs {
                    self.free_msg_buffer(msgbuf);
                }
                return Err(e);
            }
        };

        let sslot_idx = self
            .sessions
            .get(session)
            .map(|sess| sess.sslot_idx(req_num))
            .ok_or(Error::SessionNotFound(session.0))?;
        match self.try_send_request(session, sslot_idx) {
            Ok(true) => {}
            Ok(false) => self.stall(session, sslot_idx),
            Err(e) => {
                // The slot owns the request now; retry from the event loop.
                tracing::warn!(
                    session = session.0,
                    sslot_idx,
                    req_num,
                    error = %e,
                    "request send failed"
                );
                self.stall(session, sslot_idx);
            }
        }
        Ok(req_num)
    }

    /// Bind a request to a free client slot, stamping its headers.
    fn claim_client_sslot(
        &mut self,
        session: SessionHandle,
        req_type: u8,
        mut req_msgbuf: MsgBuffer,
        resp_msgbuf: MsgBuffer,
        cont: Continuation<T, C>,
        tag: usize,
    ) -> std::result::Result<u64, (Error, [MsgBuffer; 2])> {
        let Some(sess) = self.sessions.get_mut(session) else {
            return Err((Error::SessionNotFound(session.0), [req_msgbuf, resp_msgbuf]));
        };
        if sess.role != SessionRole::Client {
            return Err((Error::InvalidSessionState(session.0), [req_msgbuf, resp_msgbuf]));
        }
        if !sess.is_connected() {
            return Err((Error::SessionNotConnected(session.0), [req_msgbuf, resp_msgbuf]));
        }
        let Some(sslot_idx) = sess.alloc_sslot() else {
            return Err((Error::NoFreeSlots(session.0), [req_msgbuf, resp_msgbuf]));
        };

        let req_window = sess.req_window as u64;
        if sess.sslots[sslot_idx].cur_req_num + req_window > MAX_REQ_NUM {
            sess.free_sslot(sslot_idx);
            return Err((Error::ReqNumExhausted(session.0), [req_msgbuf, resp_msgbuf]));
        }
        let remote_session_num = sess.remote_session_num;
        let sslot = &mut sess.sslots[sslot_idx];
        sslot.cur_req_num += req_window;
        let req_num = sslot.cur_req_num;

        let data_size = req_msgbuf.data_size();
        for n in 0..req_msgbuf.num_pkts() {
            let hdr =
                PacketHeader::new_req(req_type, data_size, remote_session_num, n as u16, req_num);
            req_msgbuf.set_pkthdr(n, &hdr);
        }
        req_msgbuf.reset_progress();

        sslot.tx_msgbuf = Some(req_msgbuf);
        sslot.client_info = ClientInfo {
            resp_msgbuf: Some(resp_msgbuf),
            cont: Some(cont),
            tag,
            ..ClientInfo::default()
        };

        tracing::trace!(session = session.0, sslot_idx, req_num, req_type, "enqueued request");
        Ok(req_num)
    }

    /// Send as many remaining packets of a client slot's request as credits
    /// and pacing allow. Returns true once every packet has been sent, or if
    /// the slot no longer holds a request.
    pub(super) fn try_send_request(
        &mut self,
        session: SessionHandle,
        sslot_idx: usize,
    ) -> Result<bool> {
        let now = self.now_us();
        let Self {
            sessions,
            transport,
            ..
        } = self;
        let Some(sess) = sessions.get_mut(session) else {
            return Ok(true);
        };
        let Some(sslot) = sess.sslots.get_mut(sslot_idx) else {
            return Ok(true);
        };
        let Some(req) = sslot.tx_msgbuf.as_mut() else {
            return Ok(true);
        };
        let ci = &mut sslot.client_info;

        while ci.req_sent < req.num_pkts() {
            if sess.credits == 0 {
                return Ok(false);
            }
            if sess.cc.is_some() && !sess.pacer.is_ready(now) {
                return Ok(false);
            }

            let (hdr, payload) = req.pkt(ci.req_sent);
            let payload_len = payload.len();
            transport.enqueue(TxItem {
                routing_info: &sess.remote_routing_info,
                hdr,
                payload,
                lkey: req.lkey(),
            })?;

            req.record_sent(payload_len);
            ci.req_sent += 1;
            ci.tx_ts = now;
            sess.credits -= 1;
            if let Some(cc) = &sess.cc {
                sess.pacer.on_send(PKT_HDR_SIZE + payload_len, cc.rate(), now);
            }
        }
        Ok(true)
    }

    /// Park a partially sent request until credits or pacing allow more.
    pub(super) fn stall(&mut self, session: SessionHandle, sslot_idx: usize) {
        if !self.stallq.contains(&(session, sslot_idx)) {
            tracing::trace!(session = session.0, sslot_idx, "request stalled");
            self.stallq.push((session, sslot_idx));
        }
    }

    /// Retry every stalled request once.
    pub(super) fn drain_stallq(&mut self) -> Result<()> {
        if self.stallq.is_empty() {
            return Ok(());
        }

        let mut pending = std::mem::take(&mut self.stallq_scratch);
        std::mem::swap(&mut pending, &mut self.stallq);

        let mut res = Ok(());
        for (i, &(session, sslot_idx)) in pending.iter().enumerate() {
            match self.try_send_request(session, sslot_idx) {
                Ok(true) => {}
                Ok(false) => self.stall(session, sslot_idx),
                Err(e) => {
                    for &(session, sslot_idx) in &pending[i..] {
                        self.stall(session, sslot_idx);
                    }
                    res = Err(e);
                    break;
                }
            }
        }

        pending.clear();
        self.stallq_scratch = pending;
        res
    }

    /// Number of client slots waiting on credits or pacing.
    pub fn stalled_requests(&self) -> usize {
        self.stallq.len()
    }

    /// Respond to a request, either from inside its handler or later.
    ///
    /// Sends the dynamic response buffer if one was attached, the
    /// preallocated one otherwise. If the exchange is gone (the session was
    /// destroyed, or it already has a response) the handle's buffers are
    /// freed and [`Error::StaleResponseHandle`] is returned.
    pub fn enqueue_response(&mut self, handle: ReqHandle) -> Result<()> {
        let ReqHandle {
            session,
            sslot_idx,
            req_num,
            req_type,
            req_msgbuf,
            pre_resp_msgbuf,
            dyn_resp_msgbuf,
        } = handle;

        let live = self.sessions.get(session).is_some_and(|sess| {
            sess.role == SessionRole::Server
                && sess
                    .sslot(sslot_idx)
                    .is_some_and(|s| s.cur_req_num == req_num && s.tx_msgbuf.is_none())
        });
        let Some(sess) = self.sessions.get_mut(session).filter(|_| live) else {
            tracing::debug!(session = session.0, req_num, "stale response handle");
            for msgbuf in [Some(req_msgbuf), Some(pre_resp_msgbuf), dyn_resp_msgbuf]
                .into_iter()
                .flatten()
            {
                self.huge_alloc.free(msgbuf.into_buffer());
            }
            return Err(Error::StaleResponseHandle {
                session_num: session.0,
                req_num,
            });
        };

        let remote_session_num = sess.remote_session_num;
        let sslot = &mut sess.sslots[sslot_idx];
        let si = &mut sslot.server_info;
        si.req_msgbuf = Some(req_msgbuf);

        let mut resp = match dyn_resp_msgbuf {
            Some(dyn_resp) => {
                si.pre_resp_msgbuf = Some(pre_resp_msgbuf);
                si.prealloc_used = false;
                dyn_resp
            }
            None => {
                si.prealloc_used = true;
                pre_resp_msgbuf
            }
        };

        let data_size = resp.data_size();
        for n in 0..resp.num_pkts() {
            let hdr =
                PacketHeader::new_resp(req_type, data_size, remote_session_num, n as u16, req_num);
            resp.set_pkthdr(n, &hdr);
        }
        resp.reset_progress();
        sslot.tx_msgbuf = Some(resp);

        tracing::trace!(session = session.0, sslot_idx, req_num, data_size, "enqueued response");
        self.send_response(session, sslot_idx)
    }

    /// Transmit every packet of a server slot's response.
    pub(super) fn send_response(
        &mut self,
        session: SessionHandle,
        sslot_idx: usize,
    ) -> Result<()> {
        let Self {
            sessions,
            transport,
            ..
        } = self;
        let Some(sess) = sessions.get_mut(session) else {
            return Err(Error::SessionNotFound(session.0));
        };
        let Some(resp) = sess
            .sslots
            .get_mut(sslot_idx)
            .and_then(|s| s.tx_msgbuf.as_mut())
        else {
            return Ok(());
        };

        resp.reset_progress();
        for n in 0..resp.num_pkts() {
            let (hdr, payload) = resp.pkt(n);
            let payload_len = payload.len();
            transport.enqueue(TxItem {
                routing_info: &sess.remote_routing_info,
                hdr,
                payload,
                lkey: resp.lkey(),
            })?;
            resp.record_sent(payload_len);
        }
        Ok(())
    }

    /// Acknowledge request packet `pkt_num` with an explicit credit return.
    pub(super) fn send_expl_cr(
        &mut self,
        session: SessionHandle,
        req_type: u8,
        pkt_num: u16,
        req_num: u64,
    ) -> Result<()> {
        let sess = self
            .sessions
            .get(session)
            .ok_or(Error::SessionNotFound(session.0))?;
        let hdr = PacketHeader::new_expl_cr(req_type, sess.remote_session_num, pkt_num, req_num)
            .encode();
        self.transport.enqueue(TxItem {
            routing_info: &sess.remote_routing_info,
            hdr: &hdr,
            payload: &[],
            lkey: 0,
        })
    }
}
