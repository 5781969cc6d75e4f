//! The four-stage pipeline: Link / Transport / Message / Service.
//!
//! Send path: `Message::encode` → `Transport::wrap` → `Link::write`.
//! Receive path: `Link::read` → `Transport::unwrap` → `Message::dispatch`
//! → `Service::handle` → application handler.
//!
//! The receive loop is single-threaded and cooperative: [`Pipeline::run`]
//! calls [`Pipeline::process_one`] until stopped, sleeping briefly when
//! the link is idle. Composition is static — each stage is a concrete
//! type parameter — so a fully assembled pipeline has no dispatch cost
//! between stages.
//!
//! # Example
//!
//! ```rust
//! use conduit::link::LoopbackLink;
//! use conduit::message::RawBytes;
//! use conduit::pipeline::builder;
//! use conduit::service::Direct;
//! use conduit::transport::CrcLengthPrefixed;
//! use conduit::endpoint::EndpointId;
//!
//! let (a, b) = LoopbackLink::pair(16);
//! let mut tx = builder(a)
//!     .transport(CrcLengthPrefixed::default())
//!     .message(RawBytes::new())
//!     .service(Direct);
//! let mut rx = builder(b)
//!     .transport(CrcLengthPrefixed::default())
//!     .message(RawBytes::new())
//!     .service(Direct);
//!
//! assert!(tx.send(EndpointId::new(0, 0, 2), &b"hello".to_vec()));
//!
//! let mut got = None;
//! assert!(rx.process_one(&mut |msg| got = Some(msg)));
//! assert_eq!(got.unwrap(), b"hello");
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::endpoint::EndpointId;
use crate::link::{Link, LinkStats};
use crate::message::Message;
use crate::service::Service;
use crate::transport::Transport;

/// Sleep between polls when the link has nothing to read.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// Remotely stops a running pipeline loop.
///
/// Cloneable and cheap; hand one to a signal handler or another thread.
#[derive(Clone, Debug)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request the loop to exit after the current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether the loop is currently marked running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// A four-stage communication pipeline.
pub struct Pipeline<L, T, M, S> {
    link: L,
    transport: T,
    message: M,
    service: S,
    running: Arc<AtomicBool>,
}

impl<L, T, M, S> Pipeline<L, T, M, S>
where
    L: Link,
    T: Transport,
    M: Message,
    S: Service<M::Item>,
{
    /// Assemble a pipeline from its four stages.
    pub fn new(link: L, transport: T, message: M, service: S) -> Self {
        Self {
            link,
            transport,
            message,
            service,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Encode, wrap and transmit one item toward `dst`.
    ///
    /// Returns false as soon as any stage refuses.
    pub fn send(&mut self, dst: EndpointId, item: &M::Item) -> bool {
        let Some(encoded) = self.message.encode(item) else {
            return false;
        };
        let Some(wrapped) = self.transport.wrap(&encoded) else {
            return false;
        };
        self.link.write(dst, &wrapped)
    }

    /// Transmit raw bytes toward `dst`, bypassing the message codec.
    pub fn send_buffer(&mut self, dst: EndpointId, data: &[u8]) -> bool {
        let Some(wrapped) = self.transport.wrap(data) else {
            return false;
        };
        self.link.write(dst, &wrapped)
    }

    /// Send items until one fails, returning how many were sent.
    pub fn send_batch<'a, I>(&mut self, dst: EndpointId, items: I) -> usize
    where
        I: IntoIterator<Item = &'a M::Item>,
        M::Item: 'a,
    {
        let mut sent = 0;
        for item in items {
            if !self.send(dst, item) {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Pump one packet through the receive path.
    ///
    /// Returns true iff the link produced a packet — including packets the
    /// transport or codec subsequently dropped (work happened; the caller
    /// should poll again without sleeping).
    pub fn process_one(&mut self, handler: &mut dyn FnMut(M::Item)) -> bool {
        let Some(packet) = self.link.read() else {
            return false;
        };
        let Some(payload) = self.transport.unwrap(&packet) else {
            return true;
        };

        let service = &mut self.service;
        self.message.dispatch(&payload, &mut |item| {
            if let Err(err) = service.handle(item, &mut *handler) {
                tracing::warn!(%err, "service refused message");
            }
        });
        true
    }

    /// Receive loop: pump packets until [`StopHandle::stop`] (or
    /// [`Pipeline::close`]) is called, sleeping ~100 µs when idle.
    pub fn run(&mut self, mut handler: impl FnMut(M::Item)) {
        self.running.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            if !self.process_one(&mut handler) {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }

    /// Like [`Pipeline::run`], exiting once `timeout` elapses.
    pub fn run_for(&mut self, mut handler: impl FnMut(M::Item), timeout: Duration) {
        self.running.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;
        while self.running.load(Ordering::Acquire) && Instant::now() < deadline {
            if !self.process_one(&mut handler) {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }

    /// A handle that can stop a running loop from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Request the loop to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether a loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the loop and close the link.
    pub fn close(&mut self) {
        self.stop();
        self.link.close();
    }

    /// The link's MTU.
    pub fn mtu(&self) -> usize {
        self.link.mtu()
    }

    /// Whether the link is usable.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// The link's transfer counters.
    pub fn stats(&self) -> LinkStats {
        self.link.stats()
    }

    /// The link stage.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The link stage, mutable.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// The transport stage.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport stage, mutable.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The message stage.
    pub fn message(&self) -> &M {
        &self.message
    }

    /// The message stage, mutable.
    pub fn message_mut(&mut self) -> &mut M {
        &mut self.message
    }

    /// The service stage.
    pub fn service(&self) -> &S {
        &self.service
    }

    /// The service stage, mutable.
    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }
}

/// Start a staged pipeline builder from the link upward.
pub fn builder<L: Link>(link: L) -> PipelineBuilder<L> {
    PipelineBuilder { link }
}

/// Builder stage holding the link.
pub struct PipelineBuilder<L> {
    link: L,
}

impl<L: Link> PipelineBuilder<L> {
    /// Add the transport stage.
    pub fn transport<T: Transport>(self, transport: T) -> PipelineBuilderT<L, T> {
        PipelineBuilderT {
            link: self.link,
            transport,
        }
    }
}

/// Builder stage holding link and transport.
pub struct PipelineBuilderT<L, T> {
    link: L,
    transport: T,
}

impl<L: Link, T: Transport> PipelineBuilderT<L, T> {
    /// Add the message stage.
    pub fn message<M: Message>(self, message: M) -> PipelineBuilderM<L, T, M> {
        PipelineBuilderM {
            link: self.link,
            transport: self.transport,
            message,
        }
    }
}

/// Builder stage holding link, transport and message codec.
pub struct PipelineBuilderM<L, T, M> {
    link: L,
    transport: T,
    message: M,
}

impl<L: Link, T: Transport, M: Message> PipelineBuilderM<L, T, M> {
    /// Add the service stage, completing the pipeline.
    pub fn service<S: Service<M::Item>>(self, service: S) -> Pipeline<L, T, M, S> {
        Pipeline::new(self.link, self.transport, self.message, service)
    }
}
