//! Handles passed to request handlers and continuations.

use crate::buffer::MsgBuffer;
use crate::session::SessionHandle;

use super::Rpc;

/// Request handler, registered per request type.
///
/// The handler owns the [`ReqHandle`] and must eventually pass it to
/// [`Rpc::enqueue_response`], either before returning or later.
pub type ReqHandler<T, C> = fn(&mut Rpc<T, C>, ReqHandle);

/// Completion callback for a request, called exactly once with the response
/// and the tag given to [`Rpc::enqueue_request`].
pub type Continuation<T, C> = fn(&mut Rpc<T, C>, RespHandle, usize);

/// A fully received request, handed to its handler.
pub struct ReqHandle {
    pub(crate) session: SessionHandle,
    pub(crate) sslot_idx: usize,
    pub(crate) req_num: u64,
    pub(crate) req_type: u8,
    pub(crate) req_msgbuf: MsgBuffer,
    pub(crate) pre_resp_msgbuf: MsgBuffer,
    pub(crate) dyn_resp_msgbuf: Option<MsgBuffer>,
}

impl ReqHandle {
    /// Server-side session the request arrived on.
    #[inline]
    pub fn session(&self) -> SessionHandle {
        self.session
    }

    #[inline]
    pub fn req_num(&self) -> u64 {
        self.req_num
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// The reassembled request.
    #[inline]
    pub fn req_msgbuf(&self) -> &MsgBuffer {
        &self.req_msgbuf
    }

    /// The slot's one-packet response buffer, sent unless a dynamic
    /// response buffer is attached.
    #[inline]
    pub fn pre_resp_msgbuf(&self) -> &MsgBuffer {
        &self.pre_resp_msgbuf
    }

    #[inline]
    pub fn pre_resp_msgbuf_mut(&mut self) -> &mut MsgBuffer {
        &mut self.pre_resp_msgbuf
    }

    /// Respond with `msgbuf` instead of the preallocated buffer.
    ///
    /// Returns a previously attached buffer, if any.
    pub fn set_dyn_resp_msgbuf(&mut self, msgbuf: MsgBuffer) -> Option<MsgBuffer> {
        self.dyn_resp_msgbuf.replace(msgbuf)
    }
}

/// A completed exchange, handed to its continuation.
///
/// Owns both message buffers. Return them with [`Rpc::release_response`] or
/// keep them for reuse.
pub struct RespHandle {
    pub(crate) session: SessionHandle,
    pub(crate) req_num: u64,
    pub(crate) req_type: u8,
    pub(crate) req_msgbuf: MsgBuffer,
    pub(crate) resp_msgbuf: MsgBuffer,
}

impl RespHandle {
    /// Client-side session the request was sent on.
    #[inline]
    pub fn session(&self) -> SessionHandle {
        self.session
    }

    #[inline]
    pub fn req_num(&self) -> u64 {
        self.req_num
    }

    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    #[inline]
    pub fn req_msgbuf(&self) -> &MsgBuffer {
        &self.req_msgbuf
    }

    /// The reassembled response.
    #[inline]
    pub fn resp_msgbuf(&self) -> &MsgBuffer {
        &self.resp_msgbuf
    }

    /// Take both buffers, request first.
    pub fn into_msgbufs(self) -> (MsgBuffer, MsgBuffer) {
        (self.req_msgbuf, self.resp_msgbuf)
    }
}
