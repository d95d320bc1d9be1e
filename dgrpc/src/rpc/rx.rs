//! Receive path: packet classification and dispatch.
//!
//! Every packet is placed relative to its slot's `cur_req_num` with
//! [`classify`] before anything is touched. Past packets are absorbed,
//! future ones are rejected with [`Error::ProtocolViolation`] and never
//! applied.

use crate::error::{Error, Result};
use crate::packet::{PacketHeader, PktKind};
use crate::session::{PktOrder, SessionHandle, SessionRole, classify};
use crate::transport::Transport;

use super::{ReqHandle, RespHandle, Rpc, alloc_msgbuf};

/// What to do with a request packet once the session borrow is released.
enum ReqAction {
    Drop,
    /// Acknowledge an in-order non-last fragment.
    CreditReturn,
    /// Acknowledge a duplicate non-last fragment again.
    ResendCr,
    /// Duplicate of an answered request.
    ResendResp,
    /// The request is complete.
    Invoke(ReqHandle),
}

/// Payload length of packet `pkt_num` in a `msg_size`-byte message, or
/// `None` if the message has no such packet.
fn pkt_payload_len(msg_size: usize, pkt_num: usize, max_data_per_pkt: usize) -> Option<usize> {
    let num_pkts = PacketHeader::calc_num_pkts(msg_size, max_data_per_pkt);
    if pkt_num >= num_pkts {
        return None;
    }
    Some((msg_size - pkt_num * max_data_per_pkt).min(max_data_per_pkt))
}

impl<T: Transport, C> Rpc<T, C> {
    /// Classify and apply one received packet.
    ///
    /// The event loop calls this for every packet it polls; it is public so
    /// packets can also be fed in directly. Errors for unknown sessions or
    /// request types are not fatal and leave all state untouched. A header
    /// without the magic is rejected with [`Error::CorruptHeader`].
    pub fn process_pkt(&mut self, hdr: &PacketHeader, payload: &[u8]) -> Result<()> {
        hdr.validate()?;
        let session = SessionHandle(hdr.dest_session_num);
        let sess = self
            .sessions
            .get(session)
            .ok_or(Error::SessionNotFound(session.0))?;
        if !sess.is_connected() {
            return Err(Error::SessionNotConnected(session.0));
        }

        let kind = hdr.kind();
        tracing::trace!(
            session = session.0,
            ?kind,
            req_num = hdr.req_num,
            pkt_num = hdr.pkt_num,
            msg_size = hdr.msg_size,
            "rx"
        );

        match (kind, sess.role) {
            (PktKind::Req, SessionRole::Server) => self.process_req_pkt(session, hdr, payload),
            (PktKind::Resp, SessionRole::Client) => self.process_resp_pkt(session, hdr, payload),
            (PktKind::ExplCr, SessionRole::Client) => self.process_expl_cr(session, hdr),
            (kind, role) => {
                tracing::debug!(
                    session = session.0,
                    ?kind,
                    ?role,
                    "packet does not match session role"
                );
                Ok(())
            }
        }
    }

    fn process_req_pkt(
        &mut self,
        session: SessionHandle,
        hdr: &PacketHeader,
        payload: &[u8],
    ) -> Result<()> {
        let Some(handler) = self.req_handlers[hdr.req_type as usize] else {
            return Err(Error::UnknownReqType(hdr.req_type));
        };
        let msg_size = hdr.msg_size();
        if msg_size > self.config.max_msg_size {
            return Err(Error::MessageTooLarge {
                size: msg_size,
                max: self.config.max_msg_size,
            });
        }
        let pkt_num = hdr.pkt_num as usize;
        if pkt_payload_len(msg_size, pkt_num, self.max_data_per_pkt) != Some(payload.len()) {
            tracing::debug!(
                session = session.0,
                pkt_num,
                len = payload.len(),
                "malformed request packet"
            );
            return Ok(());
        }

        let (sslot_idx, action) = self.apply_req_pkt(session, hdr, payload)?;
        match action {
            ReqAction::Drop => Ok(()),
            ReqAction::CreditReturn => {
                self.send_expl_cr(session, hdr.req_type, hdr.pkt_num, hdr.req_num)
            }
            ReqAction::ResendCr => {
                self.send_expl_cr(session, hdr.req_type, hdr.pkt_num, hdr.req_num)?;
                self.transport.tx_flush()
            }
            ReqAction::ResendResp => {
                self.send_response(session, sslot_idx)?;
                self.transport.tx_flush()
            }
            ReqAction::Invoke(handle) => {
                tracing::trace!(
                    session = session.0,
                    sslot_idx,
                    req_num = hdr.req_num,
                    "invoking handler"
                );
                handler(self, handle);
                Ok(())
            }
        }
    }

    /// Update the server slot for a request packet.
    fn apply_req_pkt(
        &mut self,
        session: SessionHandle,
        hdr: &PacketHeader,
        payload: &[u8],
    ) -> Result<(usize, ReqAction)> {
        let Self {
            sessions,
            transport,
            huge_alloc,
            config,
            max_data_per_pkt,
            ..
        } = self;
        let sess = sessions
            .get_mut(session)
            .ok_or(Error::SessionNotFound(session.0))?;
        let req_window = sess.req_window as u64;
        let sslot_idx = sess.sslot_idx(hdr.req_num);
        let sslot = &mut sess.sslots[sslot_idx];

        let msg_size = hdr.msg_size();
        let num_pkts = PacketHeader::calc_num_pkts(msg_size, *max_data_per_pkt);
        let pkt_num = hdr.pkt_num as usize;

        match classify(hdr.req_num, sslot.cur_req_num, req_window) {
            PktOrder::Future => {
                let expected = sslot.cur_req_num + req_window;
                tracing::error!(
                    session = session.0,
                    sslot_idx,
                    req_num = hdr.req_num,
                    expected,
                    "request beyond window"
                );
                return Err(Error::ProtocolViolation {
                    session_num: session.0,
                    sslot_idx,
                    req_num: hdr.req_num,
                    expected,
                });
            }
            PktOrder::Past => {
                tracing::trace!(
                    session = session.0,
                    sslot_idx,
                    req_num = hdr.req_num,
                    "stale request"
                );
                return Ok((sslot_idx, ReqAction::Drop));
            }
            PktOrder::Current => {
                let req_rcvd = sslot.server_info.req_rcvd;
                if pkt_num < req_rcvd {
                    let action = if pkt_num + 1 < num_pkts {
                        ReqAction::ResendCr
                    } else if sslot.tx_msgbuf.is_some() {
                        ReqAction::ResendResp
                    } else {
                        tracing::debug!(
                            session = session.0,
                            sslot_idx,
                            req_num = hdr.req_num,
                            "duplicate request, response not ready"
                        );
                        ReqAction::Drop
                    };
                    return Ok((sslot_idx, action));
                }
                if pkt_num > req_rcvd || msg_size != sslot.server_info.req_size {
                    tracing::debug!(
                        session = session.0,
                        sslot_idx,
                        pkt_num,
                        req_rcvd,
                        "out-of-order request packet"
                    );
                    return Ok((sslot_idx, ReqAction::Drop));
                }
            }
            PktOrder::Next => {
                if pkt_num != 0 {
                    tracing::debug!(
                        session = session.0,
                        sslot_idx,
                        pkt_num,
                        "out-of-order request packet"
                    );
                    return Ok((sslot_idx, ReqAction::Drop));
                }
                if sslot.tx_msgbuf.is_none() && sslot.server_info.pre_resp_msgbuf.is_none() {
                    tracing::debug!(
                        session = session.0,
                        sslot_idx,
                        "previous request still with its handler"
                    );
                    return Ok((sslot_idx, ReqAction::Drop));
                }

                let si = &mut sslot.server_info;
                let reusable = si
                    .req_msgbuf
                    .as_ref()
                    .is_some_and(|m| m.max_data_size() >= msg_size);
                if !reusable {
                    let fresh = alloc_msgbuf(
                        huge_alloc,
                        transport,
                        *max_data_per_pkt,
                        config.max_msg_size,
                        msg_size,
                    )?;
                    if let Some(old) = si.req_msgbuf.replace(fresh) {
                        huge_alloc.free(old.into_buffer());
                    }
                }

                if let Some(prev) = sslot.tx_msgbuf.take() {
                    if si.prealloc_used {
                        si.pre_resp_msgbuf = Some(prev);
                    } else {
                        huge_alloc.free(prev.into_buffer());
                    }
                }
                si.prealloc_used = false;
                si.req_type = hdr.req_type;
                si.req_size = msg_size;
                si.req_rcvd = 0;
                sslot.cur_req_num = hdr.req_num;
            }
        }

        let si = &mut sslot.server_info;
        let Some(req) = si.req_msgbuf.as_mut() else {
            return Ok((sslot_idx, ReqAction::Drop));
        };
        if pkt_num == 0 {
            req.resize(msg_size)?;
        }
        let range = req.pkt_data_range(pkt_num);
        req.data_mut()[range].copy_from_slice(payload);
        si.req_rcvd += 1;

        if si.req_rcvd < num_pkts {
            return Ok((sslot_idx, ReqAction::CreditReturn));
        }

        let (Some(req_msgbuf), Some(pre_resp_msgbuf)) =
            (si.req_msgbuf.take(), si.pre_resp_msgbuf.take())
        else {
            return Ok((sslot_idx, ReqAction::Drop));
        };
        let mut pre_resp_msgbuf = pre_resp_msgbuf;
        let max = pre_resp_msgbuf.max_data_size();
        pre_resp_msgbuf.resize(max)?;

        Ok((
            sslot_idx,
            ReqAction::Invoke(ReqHandle {
                session,
                sslot_idx,
                req_num: hdr.req_num,
                req_type: hdr.req_type,
                req_msgbuf,
                pre_resp_msgbuf,
                dyn_resp_msgbuf: None,
            }),
        ))
    }

    fn process_resp_pkt(
        &mut self,
        session: SessionHandle,
        hdr: &PacketHeader,
        payload: &[u8],
    ) -> Result<()> {
        let msg_size = hdr.msg_size();
        if msg_size > self.config.max_msg_size {
            return Err(Error::MessageTooLarge {
                size: msg_size,
                max: self.config.max_msg_size,
            });
        }
        let pkt_num = hdr.pkt_num as usize;
        if pkt_payload_len(msg_size, pkt_num, self.max_data_per_pkt) != Some(payload.len()) {
            tracing::debug!(
                session = session.0,
                pkt_num,
                len = payload.len(),
                "malformed response packet"
            );
            return Ok(());
        }

        let now = self.now_us();
        let Self {
            sessions,
            transport,
            huge_alloc,
            config,
            max_data_per_pkt,
            ..
        } = self;
        let sess = sessions
            .get_mut(session)
            .ok_or(Error::SessionNotFound(session.0))?;
        let req_window = sess.req_window as u64;
        let sslot_idx = sess.sslot_idx(hdr.req_num);
        let sslot = &mut sess.sslots[sslot_idx];

        match classify(hdr.req_num, sslot.cur_req_num, req_window) {
            PktOrder::Current => {}
            PktOrder::Past => {
                tracing::trace!(
                    session = session.0,
                    sslot_idx,
                    req_num = hdr.req_num,
                    "stale response"
                );
                return Ok(());
            }
            PktOrder::Next | PktOrder::Future => {
                tracing::error!(
                    session = session.0,
                    sslot_idx,
                    req_num = hdr.req_num,
                    expected = sslot.cur_req_num,
                    "response for a request never sent"
                );
                return Err(Error::ProtocolViolation {
                    session_num: session.0,
                    sslot_idx,
                    req_num: hdr.req_num,
                    expected: sslot.cur_req_num,
                });
            }
        }

        let Some(req) = sslot.tx_msgbuf.as_ref() else {
            tracing::debug!(
                session = session.0,
                sslot_idx,
                req_num = hdr.req_num,
                "duplicate response"
            );
            return Ok(());
        };
        let ci = &mut sslot.client_info;
        if ci.req_sent < req.num_pkts() {
            tracing::error!(
                session = session.0,
                sslot_idx,
                req_num = hdr.req_num,
                req_sent = ci.req_sent,
                "response before the request was fully sent"
            );
            return Err(Error::ProtocolViolation {
                session_num: session.0,
                sslot_idx,
                req_num: hdr.req_num,
                expected: sslot.cur_req_num,
            });
        }
        if pkt_num != ci.resp_rcvd {
            tracing::debug!(
                session = session.0,
                sslot_idx,
                pkt_num,
                resp_rcvd = ci.resp_rcvd,
                "out-of-order response packet"
            );
            return Ok(());
        }

        if pkt_num == 0 {
            let fits = ci
                .resp_msgbuf
                .as_ref()
                .is_some_and(|m| m.max_data_size() >= msg_size);
            if !fits {
                let grown = alloc_msgbuf(
                    huge_alloc,
                    transport,
                    *max_data_per_pkt,
                    config.max_msg_size,
                    msg_size,
                )?;
                if let Some(old) = ci.resp_msgbuf.replace(grown) {
                    tracing::debug!(
                        session = session.0,
                        old = old.max_data_size(),
                        new = msg_size,
                        "grew response buffer"
                    );
                    huge_alloc.free(old.into_buffer());
                }
            }
        }
        let Some(resp) = ci.resp_msgbuf.as_mut() else {
            return Ok(());
        };
        if pkt_num == 0 {
            resp.resize(msg_size)?;
        } else if resp.data_size() != msg_size {
            tracing::debug!(
                session = session.0,
                sslot_idx,
                pkt_num,
                "response size changed mid-message"
            );
            return Ok(());
        }
        let range = resp.pkt_data_range(pkt_num);
        resp.data_mut()[range].copy_from_slice(payload);
        ci.resp_rcvd += 1;

        if ci.resp_rcvd < resp.num_pkts() {
            return Ok(());
        }

        // Exchange complete.
        let ci = std::mem::take(&mut sslot.client_info);
        let req_msgbuf = sslot.tx_msgbuf.take();
        let rtt = now - ci.tx_ts;
        sess.return_credits(ci.req_sent - ci.expl_cr_rcvd);
        if let Some(cc) = sess.cc.as_mut() {
            cc.update_rate(rtt, now);
        }
        sess.free_sslot(sslot_idx);

        let completed = match (ci.cont, req_msgbuf, ci.resp_msgbuf) {
            (Some(cont), Some(req_msgbuf), Some(resp_msgbuf)) => Some((
                cont,
                RespHandle {
                    session,
                    req_num: hdr.req_num,
                    req_type: hdr.req_type,
                    req_msgbuf,
                    resp_msgbuf,
                },
                ci.tag,
            )),
            (_, req_msgbuf, resp_msgbuf) => {
                for msgbuf in req_msgbuf.into_iter().chain(resp_msgbuf) {
                    huge_alloc.free(msgbuf.into_buffer());
                }
                None
            }
        };

        tracing::trace!(
            session = session.0,
            sslot_idx,
            req_num = hdr.req_num,
            rtt,
            "request complete"
        );
        if let Some((cont, resp, tag)) = completed {
            cont(self, resp, tag);
        }
        self.drain_stallq()
    }

    fn process_expl_cr(&mut self, session: SessionHandle, hdr: &PacketHeader) -> Result<()> {
        let sess = self
            .sessions
            .get_mut(session)
            .ok_or(Error::SessionNotFound(session.0))?;
        let req_window = sess.req_window as u64;
        let sslot_idx = sess.sslot_idx(hdr.req_num);
        let sslot = &mut sess.sslots[sslot_idx];

        match classify(hdr.req_num, sslot.cur_req_num, req_window) {
            PktOrder::Current => {}
            PktOrder::Past => {
                tracing::trace!(
                    session = session.0,
                    sslot_idx,
                    req_num = hdr.req_num,
                    "stale credit return"
                );
                return Ok(());
            }
            PktOrder::Next | PktOrder::Future => {
                tracing::error!(
                    session = session.0,
                    sslot_idx,
                    req_num = hdr.req_num,
                    expected = sslot.cur_req_num,
                    "credit return for a request never sent"
                );
                return Err(Error::ProtocolViolation {
                    session_num: session.0,
                    sslot_idx,
                    req_num: hdr.req_num,
                    expected: sslot.cur_req_num,
                });
            }
        }

        let Some(req) = sslot.tx_msgbuf.as_ref() else {
            tracing::debug!(
                session = session.0,
                sslot_idx,
                "credit return for a completed request"
            );
            return Ok(());
        };
        let ci = &mut sslot.client_info;
        let pkt_num = hdr.pkt_num as usize;
        if pkt_num != ci.expl_cr_rcvd || pkt_num >= ci.req_sent || pkt_num + 1 >= req.num_pkts() {
            tracing::debug!(
                session = session.0,
                sslot_idx,
                pkt_num,
                expl_cr_rcvd = ci.expl_cr_rcvd,
                "unexpected credit return"
            );
            return Ok(());
        }
        ci.expl_cr_rcvd += 1;
        sess.return_credits(1);

        self.drain_stallq()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkt_payload_len() {
        assert_eq!(pkt_payload_len(0, 0, 1000), Some(0));
        assert_eq!(pkt_payload_len(0, 1, 1000), None);
        assert_eq!(pkt_payload_len(1000, 0, 1000), Some(1000));
        assert_eq!(pkt_payload_len(1500, 0, 1000), Some(1000));
        assert_eq!(pkt_payload_len(1500, 1, 1000), Some(500));
        assert_eq!(pkt_payload_len(1500, 2, 1000), None);
    }
}
