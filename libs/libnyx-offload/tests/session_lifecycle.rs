//! Session lifecycle tests
//!
//! Drive client sessions end to end against the loopback remote processor:
//! handshake, data path, buffer registration and close.

use libnyx_offload::loopback::{HandshakePolicy, Loopback, SimBuffer, BROKER_ADDR, FIRST_REMOTE_ADDR};
use libnyx_offload::translate::{MAP_INFO_SIZE, PACKET_HEADER_SIZE};
use libnyx_offload::wire::{Disconnect, Frame, MessageType, HEADER_SIZE};
use libnyx_offload::{
    BufferKind, Channel, ConnectionState, ControlReply, ControlRequest, EndpointAddr,
    EndpointHandler, MemHandle, OffloadConfig, OffloadContext, OffloadError, OpenFlags,
    Readiness, RemoteLink, Session,
};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const SERVICE: &str = "rpmsg-omx0";

fn setup(config: OffloadConfig) -> (Loopback, OffloadContext) {
    let remote = Loopback::new(SERVICE);
    let ctx = OffloadContext::new(config, remote.platform()).unwrap();
    ctx.bind_channel(SERVICE, remote.link()).unwrap();
    (remote, ctx)
}

fn short_timeout() -> OffloadConfig {
    OffloadConfig {
        connect_timeout_ms: 50,
        ..OffloadConfig::default()
    }
}

async fn connected(ctx: &OffloadContext) -> Session {
    let session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();
    session.connect("OMX").await.unwrap();
    session
}

/// Payload with a packet header and `slots` buffer references
fn packet(map_type: u32, slots: &[u32]) -> Vec<u8> {
    let mut payload = vec![0xEEu8; PACKET_HEADER_SIZE];
    payload.extend_from_slice(&map_type.to_le_bytes());
    payload.extend_from_slice(&(MAP_INFO_SIZE as i32).to_le_bytes());
    for slot in slots {
        payload.extend_from_slice(&slot.to_le_bytes());
    }
    payload
}

fn slot(payload: &[u8], index: usize) -> u32 {
    let at = PACKET_HEADER_SIZE + MAP_INFO_SIZE + index * 4;
    u32::from_le_bytes(payload[at..at + 4].try_into().unwrap())
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_connect_assigns_remote_address() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Unconnected);
    assert_eq!(session.remote_addr(), None);

    session.connect("OMX").await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.remote_addr(), Some(FIRST_REMOTE_ADDR));

    let requests = remote.channel.sent_of_type(MessageType::ConnectRequest);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].src, session.local_addr());
    assert_eq!(requests[0].dst, BROKER_ADDR);

    // Header declares name plus terminator, field is padded to 48 bytes
    let frame = Frame::decode(&requests[0].data).unwrap();
    assert_eq!(frame.header.len, 4);
    assert_eq!(requests[0].data.len(), HEADER_SIZE + 48);
    assert_eq!(frame.payload, b"OMX\0");
}

#[tokio::test]
async fn test_connect_timeout_reverts_to_unconnected() {
    let (remote, ctx) = setup(short_timeout());
    remote.channel.set_policy(HandshakePolicy::Ignore);

    let session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();
    assert!(matches!(session.connect("OMX").await, Err(OffloadError::Timeout)));
    assert_eq!(session.state(), ConnectionState::Unconnected);

    // A fresh attempt is allowed after a timeout
    remote.channel.set_policy(HandshakePolicy::Accept);
    session.connect("OMX").await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_late_reply_after_timeout_is_ignored() {
    let (remote, ctx) = setup(short_timeout());
    remote.channel.set_policy(HandshakePolicy::Defer);

    let session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();
    assert!(matches!(session.connect("OMX").await, Err(OffloadError::Timeout)));

    assert_eq!(remote.channel.release_deferred(), 1);
    assert_eq!(session.state(), ConnectionState::Unconnected);
    assert_eq!(session.remote_addr(), None);
}

#[tokio::test]
async fn test_stale_reply_does_not_complete_new_handshake() {
    let config = OffloadConfig {
        connect_timeout_ms: 100,
        ..OffloadConfig::default()
    };
    let (remote, ctx) = setup(config);
    remote.channel.set_policy(HandshakePolicy::Defer);

    let session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();
    assert!(matches!(session.connect("OMX").await, Err(OffloadError::Timeout)));

    // Both replies arrive during the second attempt; only the second counts
    let (result, released) = tokio::join!(session.connect("OMX"), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.channel.release_deferred()
    });
    assert_eq!(released, 2);
    result.unwrap();
    assert_eq!(session.remote_addr(), Some(FIRST_REMOTE_ADDR + 1));
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let session = connected(&ctx).await;

    assert!(matches!(
        session.connect("OMX").await,
        Err(OffloadError::AlreadyConnected)
    ));
    assert_eq!(remote.channel.sent_of_type(MessageType::ConnectRequest).len(), 1);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_rejected_handshake_fails_connection() {
    let (remote, ctx) = setup(OffloadConfig::default());
    remote.channel.set_policy(HandshakePolicy::Reject(1));

    let session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();
    assert!(matches!(
        session.connect("OMX").await,
        Err(OffloadError::RemoteUnavailable)
    ));
    assert_eq!(session.state(), ConnectionState::Failed);
    assert_eq!(session.poll(), Readiness::ERROR);

    // A refusal never assigns a remote endpoint
    assert_eq!(session.remote_addr(), None);
    assert_eq!(session.info().remote_addr, None);
    assert!(matches!(session.write(b"x"), Err(OffloadError::Unreachable)));
}

#[tokio::test]
async fn test_invalid_names() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();

    assert!(matches!(session.connect("").await, Err(OffloadError::InvalidName(_))));
    let long = "x".repeat(48);
    assert!(matches!(session.connect(&long).await, Err(OffloadError::InvalidName(_))));
    assert!(remote.channel.sent_frames().is_empty());
    assert_eq!(session.state(), ConnectionState::Unconnected);

    session.connect(&"x".repeat(47)).await.unwrap();
}

#[tokio::test]
async fn test_interrupted_connect() {
    let (remote, ctx) = setup(OffloadConfig::default());
    remote.channel.set_policy(HandshakePolicy::Ignore);
    let session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();

    let (result, _) = tokio::join!(session.connect("OMX"), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.interrupt();
    });
    assert!(matches!(result, Err(OffloadError::Interrupted)));
    assert_eq!(session.state(), ConnectionState::Unconnected);
}

/// Channel that runs a hook after every send to the broker
struct HookedChannel {
    inner: Arc<dyn Channel>,
    on_broker_send: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl Channel for HookedChannel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn local_addr(&self) -> EndpointAddr {
        self.inner.local_addr()
    }

    fn broker_addr(&self) -> EndpointAddr {
        self.inner.broker_addr()
    }

    fn create_endpoint(
        &self,
        handler: Arc<dyn EndpointHandler>,
    ) -> libnyx_offload::Result<EndpointAddr> {
        self.inner.create_endpoint(handler)
    }

    fn destroy_endpoint(&self, addr: EndpointAddr) {
        self.inner.destroy_endpoint(addr)
    }

    fn send(
        &self,
        src: EndpointAddr,
        dst: EndpointAddr,
        data: &[u8],
    ) -> libnyx_offload::Result<()> {
        self.inner.send(src, dst, data)?;
        if dst == BROKER_ADDR {
            if let Some(hook) = self.on_broker_send.get() {
                hook();
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_interrupt_during_connect_send() {
    let remote = Loopback::new(SERVICE);
    remote.channel.set_policy(HandshakePolicy::Ignore);
    let hooked = Arc::new(HookedChannel {
        inner: remote.channel.clone(),
        on_broker_send: OnceLock::new(),
    });
    let ctx = OffloadContext::new(OffloadConfig::default(), remote.platform()).unwrap();
    ctx.bind_channel(SERVICE, RemoteLink::new(hooked.clone(), remote.mapper.clone()))
        .unwrap();

    let session = Arc::new(ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap());
    let target = Arc::downgrade(&session);
    let _ = hooked.on_broker_send.set(Box::new(move || {
        if let Some(session) = target.upgrade() {
            session.interrupt();
        }
    }));

    // The interrupt lands before the handshake starts waiting
    let result = tokio::time::timeout(Duration::from_secs(1), session.connect("OMX"))
        .await
        .expect("connect missed an interrupt raised during its send");
    assert!(matches!(result, Err(OffloadError::Interrupted)));
    assert_eq!(session.state(), ConnectionState::Unconnected);
    assert_eq!(remote.channel.sent_of_type(MessageType::ConnectRequest).len(), 1);
}

#[tokio::test]
async fn test_earlier_interrupt_does_not_cancel_later_read() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let session = connected(&ctx).await;
    session.interrupt();

    let reader = async {
        let mut buf = [0u8; 16];
        let n = session.read(&mut buf).await?;
        Ok::<_, OffloadError>(buf[..n].to_vec())
    };
    let (read, _) = tokio::join!(reader, async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let remote_addr = session.remote_addr().unwrap();
        remote.channel.push_to_client(remote_addr, b"late").unwrap();
    });
    assert_eq!(read.unwrap(), b"late");
}

// ============================================================================
// Data path
// ============================================================================

#[tokio::test]
async fn test_io_requires_connection() {
    let (_remote, ctx) = setup(OffloadConfig::default());
    let session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();
    let mut buf = [0u8; 16];

    assert!(matches!(session.write(b"hi"), Err(OffloadError::NotConnected)));
    assert!(matches!(session.read(&mut buf).await, Err(OffloadError::NotConnected)));
}

#[tokio::test]
async fn test_write_and_read_echo_in_order() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let session = connected(&ctx).await;

    let messages: [&[u8]; 3] = [b"first", b"second", b"third"];
    for message in messages {
        assert_eq!(session.write(message).unwrap(), message.len());
    }

    let sent = remote.channel.sent_of_type(MessageType::ApplicationData);
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].dst, FIRST_REMOTE_ADDR);
    assert_eq!(session.info().queued, 3);

    let mut buf = [0u8; 64];
    for expected in messages {
        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], expected);
    }
}

#[tokio::test]
async fn test_short_read_truncates_message() {
    let (_remote, ctx) = setup(OffloadConfig::default());
    let session = connected(&ctx).await;
    session.write(b"0123456789").unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(session.read(&mut buf).await.unwrap(), 4);
    assert_eq!(&buf, b"0123");
    assert!(!session.poll().contains(Readiness::READABLE));
}

#[tokio::test]
async fn test_oversize_write_is_rejected() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let session = connected(&ctx).await;

    let result = session.write(&[0u8; 501]);
    assert!(matches!(
        result,
        Err(OffloadError::MessageTooLarge { len: 501, max: 500 })
    ));
    assert!(remote.channel.sent_of_type(MessageType::ApplicationData).is_empty());
    assert_eq!(session.state(), ConnectionState::Connected);

    assert_eq!(session.write(&[0u8; 500]).unwrap(), 500);
}

#[tokio::test]
async fn test_nonblocking_read_on_empty_queue() {
    let (_remote, ctx) = setup(OffloadConfig::default());
    let session = ctx.open(SERVICE, OpenFlags::nonblocking()).await.unwrap();
    session.connect("OMX").await.unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(session.read(&mut buf).await, Err(OffloadError::WouldBlock)));
}

#[tokio::test]
async fn test_blocked_read_wakes_on_remote_message() {
    let (remote, ctx) = setup(OffloadConfig::default());
    remote.channel.set_echo(false);
    let session = connected(&ctx).await;
    let remote_addr = session.remote_addr().unwrap();

    let mut buf = [0u8; 32];
    let (result, _) = tokio::join!(session.read(&mut buf), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.channel.push_to_client(remote_addr, b"event").unwrap();
    });
    assert_eq!(result.unwrap(), 5);
    assert_eq!(&buf[..5], b"event");
}

#[tokio::test]
async fn test_interrupted_read() {
    let (_remote, ctx) = setup(OffloadConfig::default());
    let session = connected(&ctx).await;

    let mut buf = [0u8; 8];
    let (result, _) = tokio::join!(session.read(&mut buf), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.interrupt();
    });
    assert!(matches!(result, Err(OffloadError::Interrupted)));
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_poll_readiness() {
    let (remote, ctx) = setup(OffloadConfig::default());
    remote.channel.set_echo(false);
    let session = connected(&ctx).await;
    assert_eq!(session.poll(), Readiness::WRITABLE);

    remote
        .channel
        .push_to_client(session.remote_addr().unwrap(), b"x")
        .unwrap();
    assert_eq!(session.poll(), Readiness::READABLE | Readiness::WRITABLE);
}

#[tokio::test]
async fn test_inbound_garbage_is_dropped() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let session = connected(&ctx).await;

    // Short frame, then a header claiming more payload than delivered
    remote.channel.inject(FIRST_REMOTE_ADDR, session.local_addr(), &[5, 0, 0]);
    let mut lying = Vec::new();
    lying.extend_from_slice(&5u32.to_le_bytes());
    lying.extend_from_slice(&0u32.to_le_bytes());
    lying.extend_from_slice(&64u32.to_le_bytes());
    lying.extend_from_slice(b"abc");
    remote.channel.inject(FIRST_REMOTE_ADDR, session.local_addr(), &lying);

    assert_eq!(session.info().queued, 0);
    assert_eq!(session.state(), ConnectionState::Connected);
}

// ============================================================================
// Buffers
// ============================================================================

#[tokio::test]
async fn test_two_buf_translation_skips_absent_reference() {
    let (remote, ctx) = setup(OffloadConfig::default());
    remote.memory.add_contiguous(10, 0x8000_2000, 4096);
    let session = connected(&ctx).await;

    let handle = session.register_buffer(10).unwrap();
    assert_eq!(handle.kind(), Some(BufferKind::Plain));

    session.write(&packet(2, &[handle.raw(), 0])).unwrap();

    let sent = remote.channel.sent_of_type(MessageType::ApplicationData);
    let frame = Frame::decode(&sent[0].data).unwrap();
    assert_eq!(slot(frame.payload, 0), 0xA000_2000);
    assert_eq!(slot(frame.payload, 1), 0);
    assert!(frame.payload[..PACKET_HEADER_SIZE].iter().all(|&b| b == 0xEE));

    let mut echoed = [0u8; 64];
    let n = session.read(&mut echoed).await.unwrap();
    assert_eq!(slot(&echoed[..n], 0), 0xA000_2000);
}

#[tokio::test]
async fn test_paged_buffer_translates_to_page_table() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let pages = vec![0x8100_0000, 0x8340_1000, 0x8000_9000];
    remote.memory.add_scattered(11, pages.clone());
    let session = connected(&ctx).await;

    let handle = session.register_buffer(11).unwrap();
    assert_eq!(handle.kind(), Some(BufferKind::Paged));
    assert_eq!(remote.memory.live_tables(), 1);

    session.write(&packet(1, &[handle.raw()])).unwrap();
    let sent = remote.channel.sent_of_type(MessageType::ApplicationData);
    let frame = Frame::decode(&sent[0].data).unwrap();
    let table = slot(frame.payload, 0);
    assert_eq!(remote.memory.page_table(table), Some(pages));
}

#[tokio::test]
async fn test_unresolvable_reference_sends_nothing() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let session = connected(&ctx).await;

    let result = session.write(&packet(1, &[0x4000_0001]));
    assert!(matches!(result, Err(OffloadError::UnresolvableBuffer(0x4000_0001))));
    assert!(remote.channel.sent_of_type(MessageType::ApplicationData).is_empty());

    let result = session.write(&packet(7, &[0]));
    assert!(matches!(result, Err(OffloadError::InvalidMapInfo(_))));
}

#[tokio::test]
async fn test_register_and_unregister_release_once() {
    let (remote, ctx) = setup(OffloadConfig::default());
    remote.memory.add_scattered(12, vec![0x8100_0000, 0x8100_5000]);
    let session = connected(&ctx).await;

    let handle = session.register_buffer(12).unwrap();
    assert_eq!(session.buffer_count(), 1);
    assert_eq!(remote.memory.live_handles(), 1);
    assert_eq!(remote.memory.live_dma_mappings(), 1);

    session.unregister_buffer(handle).unwrap();
    assert_eq!(session.buffer_count(), 0);
    assert_eq!(remote.memory.live_handles(), 0);
    assert_eq!(remote.memory.live_dma_mappings(), 0);
    assert_eq!(remote.memory.live_tables(), 0);

    assert!(matches!(
        session.unregister_buffer(handle),
        Err(OffloadError::StaleHandle(_))
    ));

    // Stale handle embedded in a payload is no longer resolvable
    assert!(matches!(
        session.write(&packet(1, &[handle.raw()])),
        Err(OffloadError::UnresolvableBuffer(_))
    ));
}

#[tokio::test]
async fn test_register_bad_descriptor() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let session = connected(&ctx).await;

    assert!(matches!(
        session.register_buffer(99),
        Err(OffloadError::BadDescriptor(99))
    ));
    assert_eq!(session.buffer_count(), 0);
    assert_eq!(remote.memory.live_handles(), 0);
}

#[tokio::test]
async fn test_failed_wrap_releases_import() {
    let (remote, ctx) = setup(OffloadConfig::default());
    remote.memory.add_scattered(13, vec![0x8100_0000, 0x8100_1000]);
    remote.memory.fail_next_table_alloc();
    let session = connected(&ctx).await;

    assert!(matches!(
        session.register_buffer(13),
        Err(OffloadError::PageTableAlloc(_))
    ));
    assert_eq!(remote.memory.live_handles(), 0);
    assert_eq!(remote.memory.live_dma_mappings(), 0);
}

#[tokio::test]
async fn test_register_shared_caps_and_skips() {
    let (remote, ctx) = setup(OffloadConfig::default());
    remote.memory.add_buffers(
        20,
        vec![
            SimBuffer::Contiguous {
                pa: 0x8000_4000,
                len: 4096,
            },
            SimBuffer::Scattered(vec![0x8200_0000, 0x8300_0000]),
            SimBuffer::Contiguous {
                pa: 0x8000_8000,
                len: 4096,
            },
        ],
    );
    remote.memory.add_buffers(21, vec![SimBuffer::Scattered(Vec::new())]);
    let session = connected(&ctx).await;

    let handles = session.register_shared(20).unwrap();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[0].kind(), Some(BufferKind::Plain));
    assert_eq!(handles[1].kind(), Some(BufferKind::Paged));

    // An unwrappable buffer is skipped, not fatal
    assert!(session.register_shared(21).unwrap().is_empty());
    assert_eq!(session.buffer_count(), 2);
    assert_eq!(remote.memory.live_handles(), 2);
}

#[tokio::test]
async fn test_register_shared_releases_excess_imports() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let pages = |base: u64| SimBuffer::Contiguous {
        pa: base,
        len: 4096,
    };
    remote
        .memory
        .add_buffers(22, vec![pages(0x8000_4000), pages(0x8000_8000), pages(0x8000_c000)]);
    remote.memory.ignore_shared_limit();
    let session = connected(&ctx).await;

    let handles = session.register_shared(22).unwrap();
    assert_eq!(handles.len(), 2);
    assert_eq!(session.buffer_count(), 2);
    assert_eq!(remote.memory.live_handles(), 2);
    assert_eq!(remote.memory.release_count(MemHandle(3)), 1);

    session.close();
    assert_eq!(remote.memory.live_handles(), 0);
}

// ============================================================================
// Control requests and close
// ============================================================================

#[tokio::test]
async fn test_control_dispatch() {
    let (remote, ctx) = setup(OffloadConfig::default());
    remote.memory.add_contiguous(30, 0x8000_c000, 8192);
    let session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();

    let reply = session
        .control(ControlRequest::Connect { name: "OMX".into() })
        .await
        .unwrap();
    assert_eq!(reply, ControlReply::Connected);

    let handle = match session
        .control(ControlRequest::RegisterBuffer { fd: 30 })
        .await
        .unwrap()
    {
        ControlReply::Registered(handle) => handle,
        other => panic!("unexpected reply {:?}", other),
    };

    let first = match session.control(ControlRequest::GetTimer).await.unwrap() {
        ControlReply::Timer(snapshot) => snapshot,
        other => panic!("unexpected reply {:?}", other),
    };
    let second = session.timer();
    assert!(second.persistent_timer > first.persistent_timer);

    let reply = session
        .control(ControlRequest::UnregisterBuffer { handle })
        .await
        .unwrap();
    assert_eq!(reply, ControlReply::Unregistered);
}

#[tokio::test]
async fn test_close_disconnects_and_releases() {
    let (remote, ctx) = setup(OffloadConfig::default());
    remote.memory.add_scattered(40, vec![0x8100_0000, 0x8100_2000]);
    remote.memory.add_contiguous(41, 0x8000_0000, 4096);
    let session = connected(&ctx).await;
    session.register_buffer(40).unwrap();
    session.register_buffer(41).unwrap();
    let remote_addr = session.remote_addr().unwrap();
    assert_eq!(remote.channel.remote_session_count(), 1);

    session.close();

    let disconnects = remote.channel.sent_of_type(MessageType::Disconnect);
    assert_eq!(disconnects.len(), 1);
    assert_eq!(disconnects[0].dst, BROKER_ADDR);
    let frame = Frame::decode(&disconnects[0].data).unwrap();
    assert_eq!(Disconnect::decode(frame.payload).unwrap().addr, remote_addr);

    assert_eq!(remote.channel.remote_session_count(), 0);
    assert_eq!(remote.channel.endpoint_count(), 0);
    assert_eq!(remote.memory.live_handles(), 0);
    assert_eq!(remote.memory.live_tables(), 0);
    assert_eq!(ctx.service(SERVICE).unwrap().connection_count(), 0);
}

#[tokio::test]
async fn test_drop_unconnected_sends_no_disconnect() {
    let (remote, ctx) = setup(OffloadConfig::default());
    {
        let _session = ctx.open(SERVICE, OpenFlags::blocking()).await.unwrap();
        assert_eq!(remote.channel.endpoint_count(), 1);
    }

    assert!(remote.channel.sent_of_type(MessageType::Disconnect).is_empty());
    assert_eq!(remote.channel.endpoint_count(), 0);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let (remote, ctx) = setup(OffloadConfig::default());
    let a = connected(&ctx).await;
    let b = connected(&ctx).await;
    assert_ne!(a.local_addr(), b.local_addr());
    assert_ne!(a.remote_addr(), b.remote_addr());

    a.write(b"for a").unwrap();
    assert_eq!(a.info().queued, 1);
    assert_eq!(b.info().queued, 0);

    drop(a);
    assert_eq!(remote.channel.remote_session_count(), 1);
    assert_eq!(b.state(), ConnectionState::Connected);
    assert_eq!(ctx.services()[0].connections, 1);
}
