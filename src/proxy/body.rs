use crate::balancer::stats::Stats;
use crate::proxy::context::BoxBody;
use bytes::Bytes;
use hyper::body::{Body, Frame};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Streaming response interceptor: counts data-frame bytes as they pass
/// through and reports the total to the stats collector exactly once, when
/// the stream ends or the body is dropped. Never buffers.
pub struct CountingBody {
    inner: BoxBody,
    stats: Arc<Stats>,
    addr: String,
    counted: u64,
    reported: bool,
}

impl CountingBody {
    pub fn wrap(inner: BoxBody, stats: Arc<Stats>, addr: String) -> BoxBody {
        use http_body_util::BodyExt;
        Self {
            inner,
            stats,
            addr,
            counted: 0,
            reported: false,
        }
        .boxed()
    }

    fn report(&mut self) {
        if !self.reported {
            self.reported = true;
            self.stats.add_send_bytes(&self.addr, self.counted);
        }
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.counted += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.report();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.report();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        self.report();
    }
}
