//! The conversation worker.
//!
//! One task per tenant per session, owning the tenant's four sockets. Each
//! side of the conversation is a small state machine: the vehicle side is
//! unbound until its first datagram or TCP accept, after which UDP and TCP
//! are mutually exclusive (a UDP datagram wins over an established TCP
//! stream); the engineer side is either one pinned UDP peer or up to
//! [`MAX_COMM2_LINKS`] TCP slots, each of which may turn out to be plain
//! MAVLink, a WebSocket, or a TLS-wrapped WebSocket. Frames pump between the
//! sides in arrival order; ten seconds of silence on an active side ends the
//! conversation and the traffic counters are folded into the tenant record.

pub mod link;

use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Instant,
};

use futures::stream::{FuturesUnordered, StreamExt};
use keydb::KeyStore;
use mavlink_codec::frame::Frame;
use network_helpers::{socket, websocket};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    error::Error,
    session::link::{chan_comm2, Admit, Link, CHAN_COMM1},
};

/// Engineer-side TCP endpoints multiplexed into one conversation. Slot `i`
/// maps onto MAVLink channel `chan_comm2(i)`.
pub const MAX_COMM2_LINKS: usize = 8;

const BUF_LEN: usize = 10240;

/// The four listeners a tenant owns for the lifetime of one conversation.
pub struct SessionSockets {
    pub udp1: UdpSocket,
    pub udp2: UdpSocket,
    pub tcp1: TcpListener,
    pub tcp2: TcpListener,
}

impl SessionSockets {
    /// Bind all four tenant sockets; failing any of them closes the rest.
    pub fn bind(bind_address: &str, port1: u16, port2: u16) -> Result<Self, Error> {
        let addr = |port: u16| -> Result<SocketAddr, Error> {
            format!("{bind_address}:{port}").parse().map_err(|_| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad bind address {bind_address}"),
                ))
            })
        };
        Ok(Self {
            udp1: socket::bind_udp(addr(port1)?)?,
            udp2: socket::bind_udp(addr(port2)?)?,
            tcp1: socket::bind_tcp(addr(port1)?)?,
            tcp2: socket::bind_tcp(addr(port2)?)?,
        })
    }
}

/// Vehicle-side transport state. The TCP listener disappears on the first
/// UDP datagram; the UDP socket outlives a TCP accept so a later datagram
/// can still claim the side.
enum VehicleSide {
    Idle { udp: UdpSocket, listener: TcpListener },
    Udp { socket: UdpSocket, link: Link },
    Tcp { stream: TcpStream, link: Link, udp: UdpSocket },
    Empty,
}

enum VehicleEvent {
    UdpPacket(usize, SocketAddr),
    UdpData(usize),
    /// A datagram is pending while a TCP stream holds the side.
    UdpReadable,
    TcpAccepted(TcpStream, SocketAddr),
    TcpData(usize),
}

impl VehicleSide {
    fn is_active(&self) -> bool {
        matches!(self, VehicleSide::Udp { .. } | VehicleSide::Tcp { .. })
    }

    fn link_mut(&mut self) -> Option<&mut Link> {
        match self {
            VehicleSide::Udp { link, .. } | VehicleSide::Tcp { link, .. } => Some(link),
            _ => None,
        }
    }

    async fn wait(&mut self, buf: &mut [u8]) -> io::Result<VehicleEvent> {
        match self {
            VehicleSide::Idle { udp, listener } => tokio::select! {
                r = udp.recv_from(buf) => r.map(|(n, from)| VehicleEvent::UdpPacket(n, from)),
                r = listener.accept() => r.map(|(s, a)| VehicleEvent::TcpAccepted(s, a)),
            },
            VehicleSide::Udp { socket, .. } => socket.recv(buf).await.map(VehicleEvent::UdpData),
            VehicleSide::Tcp { stream, udp, .. } => tokio::select! {
                r = stream.read(buf) => r.map(VehicleEvent::TcpData),
                r = udp.readable() => r.map(|()| VehicleEvent::UdpReadable),
            },
            VehicleSide::Empty => std::future::pending().await,
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            VehicleSide::Udp { socket, .. } => socket.send(bytes).await.map(|_| ()),
            VehicleSide::Tcp { stream, .. } => stream.write_all(bytes).await,
            _ => Ok(()),
        }
    }
}

/// One engineer TCP endpoint. `rbuf` is the slot's private read buffer so
/// every slot can be polled concurrently.
struct EngineerSlot {
    transport: SlotTransport,
    link: Link,
    rbuf: Box<[u8]>,
    peer: SocketAddr,
}

enum SlotTransport {
    /// Accepted but not yet classified.
    Sniffing(TcpStream),
    Plain(TcpStream),
    Ws(Box<websocket::WsConnection>),
    Detached,
}

impl SlotTransport {
    async fn write_all(&mut self, bytes: &[u8]) -> bool {
        match self {
            SlotTransport::Sniffing(stream) | SlotTransport::Plain(stream) => {
                stream.write_all(bytes).await.is_ok()
            }
            SlotTransport::Ws(conn) => conn.send(bytes).await.is_ok(),
            SlotTransport::Detached => false,
        }
    }
}

enum SlotEvent {
    /// First readability on a still-unclassified slot.
    Readable,
    Data(usize),
    Closed,
}

impl EngineerSlot {
    fn new(slot: usize, port2: u16, store_path: PathBuf, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            transport: SlotTransport::Sniffing(stream),
            link: Link::new_signed(chan_comm2(slot), port2 as u32, store_path),
            rbuf: vec![0u8; BUF_LEN].into_boxed_slice(),
            peer,
        }
    }

    async fn wait(&mut self) -> SlotEvent {
        match &mut self.transport {
            SlotTransport::Sniffing(stream) => {
                if socket::peer_alive(stream).await {
                    SlotEvent::Readable
                } else {
                    SlotEvent::Closed
                }
            }
            SlotTransport::Plain(stream) => match stream.read(&mut self.rbuf).await {
                Ok(0) | Err(_) => SlotEvent::Closed,
                Ok(n) => SlotEvent::Data(n),
            },
            SlotTransport::Ws(conn) => match conn.recv(&mut self.rbuf).await {
                Ok(n) => SlotEvent::Data(n),
                Err(_) => SlotEvent::Closed,
            },
            SlotTransport::Detached => SlotEvent::Closed,
        }
    }

    /// Classify the stream and terminate WebSocket/TLS. Runs inline in the
    /// event loop once the socket turns readable, like the original blocking
    /// accept did.
    async fn establish(&mut self, cert_dir: &Path) -> Result<(), Error> {
        let transport = std::mem::replace(&mut self.transport, SlotTransport::Detached);
        let SlotTransport::Sniffing(stream) = transport else {
            self.transport = transport;
            return Ok(());
        };
        self.transport = match websocket::sniff(&stream).await? {
            websocket::Transport::Plain => SlotTransport::Plain(stream),
            websocket::Transport::WebSocket => {
                let conn = websocket::WsConnection::accept(stream).await?;
                debug!("engineer connection from {} is websocket", self.peer);
                SlotTransport::Ws(Box::new(conn))
            }
            websocket::Transport::TlsWebSocket => {
                let acceptor = websocket::tls_acceptor(cert_dir)?;
                let conn = websocket::WsConnection::accept_tls(stream, &acceptor).await?;
                debug!("engineer connection from {} is TLS websocket", self.peer);
                SlotTransport::Ws(Box::new(conn))
            }
        };
        Ok(())
    }
}

/// Engineer-side transport state: one pinned UDP peer, or TCP slots. The
/// first UDP datagram wins the side outright, closing the listener and any
/// established slots.
enum EngineerSide {
    Idle { udp: UdpSocket, listener: TcpListener },
    Udp { socket: UdpSocket, link: Link },
    Tcp { listener: TcpListener, udp: UdpSocket, slots: Vec<Option<EngineerSlot>> },
    Empty,
}

enum EngineerEvent {
    UdpPacket(usize, SocketAddr),
    UdpData(usize),
    TcpAccepted(TcpStream, SocketAddr),
    Slot(usize, SlotEvent),
}

impl EngineerSide {
    fn is_active(&self) -> bool {
        match self {
            EngineerSide::Udp { .. } => true,
            EngineerSide::Tcp { slots, .. } => slots.iter().any(Option::is_some),
            _ => false,
        }
    }

    async fn wait(&mut self, buf: &mut [u8]) -> io::Result<EngineerEvent> {
        match self {
            EngineerSide::Idle { udp, listener } => tokio::select! {
                r = udp.recv_from(buf) => r.map(|(n, from)| EngineerEvent::UdpPacket(n, from)),
                r = listener.accept() => r.map(|(s, a)| EngineerEvent::TcpAccepted(s, a)),
            },
            EngineerSide::Udp { socket, .. } => {
                socket.recv(buf).await.map(EngineerEvent::UdpData)
            }
            EngineerSide::Tcp { listener, udp, slots } => {
                let mut reads: FuturesUnordered<_> = slots
                    .iter_mut()
                    .enumerate()
                    .filter_map(|(i, s)| {
                        s.as_mut().map(|slot| async move { (i, slot.wait().await) })
                    })
                    .collect();
                tokio::select! {
                    r = udp.recv_from(buf) => r.map(|(n, from)| EngineerEvent::UdpPacket(n, from)),
                    r = listener.accept() => r.map(|(s, a)| EngineerEvent::TcpAccepted(s, a)),
                    Some((i, ev)) = reads.next() => Ok(EngineerEvent::Slot(i, ev)),
                }
            }
            EngineerSide::Empty => std::future::pending().await,
        }
    }
}

/// One tenant conversation.
pub struct Session {
    port2: u16,
    config: RelayConfig,
    vehicle: VehicleSide,
    engineer: EngineerSide,
    last_pkt1: Instant,
    last_pkt2: Instant,
    count1: u32,
    count2: u32,
    buf1: Vec<u8>,
    buf2: Vec<u8>,
}

impl Session {
    pub fn new(port2: u16, sockets: SessionSockets, config: RelayConfig) -> Self {
        Self {
            port2,
            vehicle: VehicleSide::Idle {
                udp: sockets.udp1,
                listener: sockets.tcp1,
            },
            engineer: EngineerSide::Idle {
                udp: sockets.udp2,
                listener: sockets.tcp2,
            },
            last_pkt1: Instant::now(),
            last_pkt2: Instant::now(),
            count1: 0,
            count2: 0,
            buf1: vec![0u8; BUF_LEN],
            buf2: vec![0u8; BUF_LEN],
            config,
        }
    }

    /// Run the conversation to completion, then fold the traffic counters
    /// into the tenant record.
    pub async fn run(mut self) {
        self.event_loop().await;
        self.finish().await;
    }

    async fn event_loop(&mut self) {
        enum Ev {
            Vehicle(io::Result<VehicleEvent>),
            Engineer(io::Result<EngineerEvent>),
            Tick,
        }

        let idle = self.config.idle_timeout();
        loop {
            let now = Instant::now();
            if self.vehicle.is_active() && now.duration_since(self.last_pkt1) > idle {
                debug!("[{}] conn1 idle", self.port2);
                break;
            }
            if self.engineer.is_active() && now.duration_since(self.last_pkt2) > idle {
                debug!("[{}] conn2 idle", self.port2);
                break;
            }

            let ev = {
                let Session {
                    vehicle,
                    engineer,
                    buf1,
                    buf2,
                    ..
                } = self;
                tokio::select! {
                    r = vehicle.wait(buf1) => Ev::Vehicle(r),
                    r = engineer.wait(buf2) => Ev::Engineer(r),
                    _ = sleep(idle) => Ev::Tick,
                }
            };

            let keep_going = match ev {
                Ev::Tick => continue,
                Ev::Vehicle(Ok(ev)) => self.handle_vehicle_event(ev).await,
                Ev::Engineer(Ok(ev)) => self.handle_engineer_event(ev).await,
                Ev::Vehicle(Err(e)) => {
                    debug!("[{}] conn1 transport error: {e}", self.port2);
                    false
                }
                Ev::Engineer(Err(e)) => {
                    debug!("[{}] conn2 transport error: {e}", self.port2);
                    false
                }
            };
            if !keep_going {
                break;
            }
        }
    }

    async fn handle_vehicle_event(&mut self, ev: VehicleEvent) -> bool {
        match ev {
            VehicleEvent::UdpPacket(n, from) => self.vehicle_udp_packet(n, from).await,
            VehicleEvent::UdpReadable => {
                // a datagram while TCP holds the side: receive it and let it
                // take over
                let received = {
                    let VehicleSide::Tcp { udp, .. } = &self.vehicle else {
                        return true;
                    };
                    match udp.try_recv_from(&mut self.buf1) {
                        Ok(x) => Some(x),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
                        Err(e) => {
                            debug!("[{}] conn1 transport error: {e}", self.port2);
                            return false;
                        }
                    }
                };
                match received {
                    Some((n, from)) => self.vehicle_udp_packet(n, from).await,
                    None => true,
                }
            }
            VehicleEvent::UdpData(n) => {
                self.count1 += 1;
                self.last_pkt1 = Instant::now();
                self.pump_vehicle(n).await
            }
            VehicleEvent::TcpAccepted(stream, from) => {
                let _ = stream.set_nodelay(true);
                match std::mem::replace(&mut self.vehicle, VehicleSide::Empty) {
                    VehicleSide::Idle { udp, listener } => {
                        // the accepted stream replaces the listener
                        drop(listener);
                        info!("[{}] have TCP conn1 from {from}", self.port2);
                        self.last_pkt1 = Instant::now();
                        self.vehicle = VehicleSide::Tcp {
                            stream,
                            link: Link::new_unsigned(CHAN_COMM1, self.config.keydb_path.clone()),
                            udp,
                        };
                    }
                    other => self.vehicle = other,
                }
                true
            }
            VehicleEvent::TcpData(0) => {
                info!("[{}] EOF TCP conn1", self.port2);
                false
            }
            VehicleEvent::TcpData(n) => {
                self.count1 += 1;
                self.last_pkt1 = Instant::now();
                self.pump_vehicle(n).await
            }
        }
    }

    /// A datagram claims (or reclaims) the vehicle side: pin the peer, drop
    /// whatever TCP path existed, bring up the link and pump the payload.
    async fn vehicle_udp_packet(&mut self, n: usize, from: SocketAddr) -> bool {
        self.count1 += 1;
        self.last_pkt1 = Instant::now();
        let udp = match std::mem::replace(&mut self.vehicle, VehicleSide::Empty) {
            VehicleSide::Idle { udp, .. } => {
                info!("[{}] have conn1 from {from}", self.port2);
                udp
            }
            VehicleSide::Tcp { udp, .. } => {
                // first-mover-wins: the datagram displaces the stream
                info!("[{}] UDP conn1 replaces TCP from {from}", self.port2);
                udp
            }
            other => {
                self.vehicle = other;
                return true;
            }
        };
        if let Err(e) = udp.connect(from).await {
            debug!("[{}] conn1 connect failed: {e}", self.port2);
            return false;
        }
        self.vehicle = VehicleSide::Udp {
            socket: udp,
            link: Link::new_unsigned(CHAN_COMM1, self.config.keydb_path.clone()),
        };
        self.pump_vehicle(n).await
    }

    async fn handle_engineer_event(&mut self, ev: EngineerEvent) -> bool {
        match ev {
            EngineerEvent::UdpPacket(n, from) => {
                self.count2 += 1;
                self.last_pkt2 = Instant::now();
                let udp = match std::mem::replace(&mut self.engineer, EngineerSide::Empty) {
                    EngineerSide::Idle { udp, .. } => {
                        info!("[{}] have conn2 from {from}", self.port2);
                        udp
                    }
                    EngineerSide::Tcp { udp, .. } => {
                        // drops the listener and any TCP slots with it
                        info!("[{}] UDP conn2 replaces TCP from {from}", self.port2);
                        udp
                    }
                    other => {
                        self.engineer = other;
                        return true;
                    }
                };
                if let Err(e) = udp.connect(from).await {
                    debug!("[{}] conn2 connect failed: {e}", self.port2);
                    return false;
                }
                let mut link = Link::new_signed(
                    chan_comm2(0),
                    self.port2 as u32,
                    self.config.keydb_path.clone(),
                );
                Self::spawn_pending_save(&mut link);
                self.engineer = EngineerSide::Udp { socket: udp, link };
                self.pump_engineer_udp(n).await
            }
            EngineerEvent::UdpData(n) => {
                self.count2 += 1;
                self.last_pkt2 = Instant::now();
                self.pump_engineer_udp(n).await
            }
            EngineerEvent::TcpAccepted(stream, from) => {
                let _ = stream.set_nodelay(true);
                if matches!(self.engineer, EngineerSide::Idle { .. }) {
                    let EngineerSide::Idle { udp, listener } =
                        std::mem::replace(&mut self.engineer, EngineerSide::Empty)
                    else {
                        unreachable!()
                    };
                    let mut slots: Vec<Option<EngineerSlot>> =
                        (0..MAX_COMM2_LINKS).map(|_| None).collect();
                    let mut slot = EngineerSlot::new(
                        0,
                        self.port2,
                        self.config.keydb_path.clone(),
                        stream,
                        from,
                    );
                    Self::spawn_pending_save(&mut slot.link);
                    slots[0] = Some(slot);
                    info!("[{}] have TCP conn2 from {from}", self.port2);
                    self.last_pkt2 = Instant::now();
                    self.engineer = EngineerSide::Tcp {
                        listener,
                        udp,
                        slots,
                    };
                    return true;
                }
                let port2 = self.port2;
                let store_path = self.config.keydb_path.clone();
                if let EngineerSide::Tcp { slots, .. } = &mut self.engineer {
                    match slots.iter().position(Option::is_none) {
                        Some(i) => {
                            let mut slot = EngineerSlot::new(i, port2, store_path, stream, from);
                            Self::spawn_pending_save(&mut slot.link);
                            slots[i] = Some(slot);
                            info!("[{port2}] have TCP conn2 from {from} (slot {i})");
                            self.last_pkt2 = Instant::now();
                        }
                        None => {
                            info!("[{port2}] engineer slots full, refusing {from}");
                        }
                    }
                }
                // a pinned UDP engineer excludes TCP peers: the stream drops
                true
            }
            EngineerEvent::Slot(i, SlotEvent::Readable) => {
                let cert_dir = self.config.tls_cert_dir.clone();
                let EngineerSide::Tcp { slots, .. } = &mut self.engineer else {
                    return true;
                };
                let Some(slot) = slots[i].as_mut() else {
                    return true;
                };
                if let Err(e) = slot.establish(&cert_dir).await {
                    warn!(
                        "[{}] engineer connection setup failed for {}: {e}",
                        self.port2, slot.peer
                    );
                    return self.close_slot(i);
                }
                true
            }
            EngineerEvent::Slot(i, SlotEvent::Data(n)) => {
                self.count2 += 1;
                self.last_pkt2 = Instant::now();
                self.pump_slot(i, n).await
            }
            EngineerEvent::Slot(i, SlotEvent::Closed) => {
                info!("[{}] EOF TCP conn2 (slot {i})", self.port2);
                self.close_slot(i)
            }
        }
    }

    /// Clear a slot; the conversation ends when the last one goes.
    fn close_slot(&mut self, i: usize) -> bool {
        if let EngineerSide::Tcp { slots, .. } = &mut self.engineer {
            slots[i] = None;
            if slots.iter().all(Option::is_none) {
                return false;
            }
        }
        true
    }

    /// Parse vehicle bytes and fan each frame out to every engineer
    /// endpoint. Bytes are not parsed until an engineer is present.
    async fn pump_vehicle(&mut self, n: usize) -> bool {
        if !self.engineer.is_active() {
            return true;
        }
        let Session {
            vehicle,
            engineer,
            buf1,
            port2,
            ..
        } = self;
        let Some(link) = vehicle.link_mut() else {
            return true;
        };
        let mut input = &buf1[..n];
        while !input.is_empty() {
            let (used, frame) = link.advance(input);
            input = &input[used..];
            let Some(frame) = frame else { continue };
            if !Self::forward_to_engineer(engineer, *port2, &frame).await {
                return false;
            }
        }
        true
    }

    async fn forward_to_engineer(
        engineer: &mut EngineerSide,
        port2: u16,
        frame: &Frame,
    ) -> bool {
        match engineer {
            EngineerSide::Udp { socket, link } => {
                let buffers = match link.prepare_send(frame) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("{e}");
                        return false;
                    }
                };
                for bytes in &buffers {
                    if socket.send(bytes).await.is_err() {
                        return false;
                    }
                }
                Self::spawn_pending_save(link);
                true
            }
            EngineerSide::Tcp { slots, .. } => {
                let mut remaining = false;
                for slot_opt in slots.iter_mut() {
                    let Some(slot) = slot_opt.as_mut() else { continue };
                    let mut ok = true;
                    match slot.link.prepare_send(frame) {
                        Ok(buffers) => {
                            for bytes in &buffers {
                                if !slot.transport.write_all(bytes).await {
                                    ok = false;
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("{e}");
                            ok = false;
                        }
                    }
                    if ok {
                        Self::spawn_pending_save(&mut slot.link);
                        remaining = true;
                    } else {
                        info!("[{port2}] engineer slot {} send failed, closing", slot.peer);
                        *slot_opt = None;
                    }
                }
                remaining
            }
            _ => true,
        }
    }

    /// Parse and admit bytes from the pinned UDP engineer. Frames only flow
    /// once the vehicle side is connected.
    async fn pump_engineer_udp(&mut self, n: usize) -> bool {
        if !self.vehicle.is_active() {
            return true;
        }
        let Session {
            vehicle,
            engineer,
            buf2,
            ..
        } = self;
        let EngineerSide::Udp { socket, link } = engineer else {
            return true;
        };
        let mut input = &buf2[..n];
        while !input.is_empty() {
            let (used, frame) = link.advance(input);
            input = &input[used..];
            let Some(frame) = frame else { continue };
            match link.admit(&frame) {
                Admit::Forward => {
                    if !Self::forward_to_vehicle(vehicle, &frame).await {
                        return false;
                    }
                }
                Admit::Drop => {}
                Admit::DropWithNotice(bytes) => {
                    let _ = socket.send(&bytes).await;
                }
                Admit::SetupSigning(setup) => link.apply_setup_signing(&setup),
            }
        }
        true
    }

    /// Same admission path for one TCP (or WebSocket) engineer slot.
    async fn pump_slot(&mut self, i: usize, n: usize) -> bool {
        if !self.vehicle.is_active() {
            return true;
        }
        let Session {
            vehicle, engineer, ..
        } = self;
        let EngineerSide::Tcp { slots, .. } = engineer else {
            return true;
        };
        let Some(slot) = slots[i].as_mut() else {
            return true;
        };
        let EngineerSlot {
            transport,
            link,
            rbuf,
            ..
        } = slot;
        let mut input = &rbuf[..n];
        while !input.is_empty() {
            let (used, frame) = link.advance(input);
            input = &input[used..];
            let Some(frame) = frame else { continue };
            match link.admit(&frame) {
                Admit::Forward => {
                    if !Self::forward_to_vehicle(vehicle, &frame).await {
                        return false;
                    }
                }
                Admit::Drop => {}
                Admit::DropWithNotice(bytes) => {
                    let _ = transport.write_all(&bytes).await;
                }
                Admit::SetupSigning(setup) => link.apply_setup_signing(&setup),
            }
        }
        true
    }

    async fn forward_to_vehicle(vehicle: &mut VehicleSide, frame: &Frame) -> bool {
        let buffers = match vehicle.link_mut() {
            Some(link) => match link.prepare_send(frame) {
                Ok(b) => b,
                Err(e) => {
                    warn!("{e}");
                    return false;
                }
            },
            None => return true,
        };
        for bytes in &buffers {
            if vehicle.write_all(bytes).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Hand a queued signing-timestamp watermark to a background store
    /// writer so the event loop never blocks on store I/O.
    fn spawn_pending_save(link: &mut Link) {
        if let Some((path, key_id, timestamp)) = link.take_pending_save() {
            tokio::task::spawn_blocking(move || {
                link::save_signing_timestamp(path, key_id, timestamp)
            });
        }
    }

    /// Fold this conversation's counters into the tenant record. Nothing is
    /// written for a conversation that never saw traffic.
    async fn finish(&mut self) {
        if self.count1 == 0 && self.count2 == 0 {
            return;
        }
        info!(
            "[{}] Closed connection count1={} count2={}",
            self.port2, self.count1, self.count2
        );
        let path = self.config.keydb_path.clone();
        let (port2, count1, count2) = (self.port2 as u32, self.count1, self.count2);
        let result = tokio::task::spawn_blocking(move || -> Result<(), keydb::Error> {
            let store = KeyStore::open(&path)?;
            let mut txn = store.begin()?;
            if let Some(mut record) = txn.load(port2)? {
                record.count1 = record.count1.wrapping_add(count1);
                record.count2 = record.count2.wrapping_add(count2);
                record.connections = record.connections.wrapping_add(1);
                txn.save(port2, &record)?;
                txn.commit()?;
            }
            Ok(())
        })
        .await;
        match result {
            Ok(Err(e)) => warn!("[{}] counter update failed: {e}", port2),
            Err(e) => warn!("[{}] counter task failed: {e}", port2),
            Ok(Ok(())) => {}
        }
    }
}
