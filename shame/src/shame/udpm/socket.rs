use net2::UdpBuilder;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const LEN_IP_HEADER: usize = 20;
const LEN_UDP_HEADER: usize = 8;

/// How often the receive thread checks whether it has been told to stop.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A UDP multicast socket pair: one ephemeral sender with its TTL set, one
/// receiver bound to the multicast port with address reuse and a group join.
///
/// A TTL of 0 keeps datagrams on the local host, and since nothing then
/// crosses a physical link the packet budget grows from the Ethernet MTU to
/// the full IP datagram size.
pub struct Socket {
    max_len_packet: usize,
    ep_multicast: SocketAddr,
    socket_send: UdpSocket,
    socket_recv: UdpSocket,
    enable_thread_receive: Arc<AtomicBool>,
    handle_thread_receive: Option<thread::JoinHandle<()>>,
}

impl Socket {
    pub fn new(multicast_addr: Ipv4Addr, multicast_port: u16, ttl: u32) -> io::Result<Socket> {
        let max_len_packet =
            (if ttl == 0 { 65535 } else { 1500 }) - LEN_IP_HEADER - LEN_UDP_HEADER;
        let ep_multicast = SocketAddr::new(IpAddr::V4(multicast_addr), multicast_port);

        let inaddr_any = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));
        let socket_send = UdpSocket::bind(SocketAddr::new(inaddr_any, 0))?;
        debug!("Setting multicast packet TTL to {}", ttl);
        socket_send.set_multicast_ttl_v4(ttl)?;

        let socket_recv = Socket::setup_recv_socket(multicast_addr, multicast_port)?;

        Ok(Socket {
            max_len_packet,
            ep_multicast,
            socket_send,
            socket_recv,
            enable_thread_receive: Arc::new(AtomicBool::new(false)),
            handle_thread_receive: None,
        })
    }

    /// Sets up the receiving half: reuse the address, bind the multicast
    /// port, join the group.
    fn setup_recv_socket(multicast_addr: Ipv4Addr, multicast_port: u16) -> io::Result<UdpSocket> {
        let builder = UdpBuilder::new_v4()?;

        debug!("Setting SO_REUSEADDR");
        builder.reuse_address(true)?;

        // SO_REUSEPORT only needs to be set on MacOS and FreeBSD.
        #[cfg(any(target_os = "macos", target_os = "freebsd"))]
        {
            use net2::unix::UnixUdpBuilderExt;
            debug!("Setting SO_REUSEPORT");
            builder.reuse_port(true)?;
        }

        debug!("Binding UDP socket");
        let socket = {
            let inaddr_any = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));
            builder.bind(SocketAddr::new(inaddr_any, multicast_port))?
        };

        debug!("Joining multicast group");
        socket.join_multicast_v4(&multicast_addr, &Ipv4Addr::new(0, 0, 0, 0))?;

        Ok(socket)
    }

    /// The largest datagram that fits the path this socket was built for.
    pub fn max_len_packet(&self) -> usize {
        self.max_len_packet
    }

    /// Writes one datagram to the group endpoint. Returns the bytes the
    /// kernel accepted, which callers compare against the datagram size.
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket_send.send_to(data, self.ep_multicast)
    }

    /// Gathers `parts` into one datagram and sends it.
    pub fn send_parts(&self, parts: &[&[u8]]) -> io::Result<usize> {
        let total = parts.iter().map(|part| part.len()).sum();
        let mut datagram = Vec::with_capacity(total);
        for part in parts {
            datagram.extend_from_slice(part);
        }
        self.send(&datagram)
    }

    /// Spawns the receive thread.
    ///
    /// The callback runs on that thread, exactly once per received datagram,
    /// and takes ownership of the buffer it is handed.
    pub fn start_async_receiving<F>(&mut self, callback_recv: F) -> io::Result<()>
    where
        F: Fn(Vec<u8>, usize) + Send + 'static,
    {
        self.stop_async_receiving();

        let socket = self.socket_recv.try_clone()?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

        self.enable_thread_receive.store(true, Ordering::Release);
        let enable = self.enable_thread_receive.clone();
        let max_len_packet = self.max_len_packet;

        debug!("Starting receive thread");
        let handle = thread::Builder::new()
            .name("shame-socket-recv".into())
            .spawn(move || {
                while enable.load(Ordering::Acquire) {
                    let mut buffer = vec![0u8; max_len_packet];
                    match socket.recv_from(&mut buffer) {
                        Ok((size, _)) => callback_recv(buffer, size),
                        Err(ref e)
                            if e.kind() == io::ErrorKind::WouldBlock
                                || e.kind() == io::ErrorKind::TimedOut => {}
                        Err(e) => debug!("Dropping errored read: {}", e),
                    }
                }
            })?;
        self.handle_thread_receive = Some(handle);

        Ok(())
    }

    /// Stops the receive thread and re-arms the socket for a later restart.
    pub fn stop_async_receiving(&mut self) {
        self.enable_thread_receive.store(false, Ordering::Release);
        if let Some(handle) = self.handle_thread_receive.take() {
            if handle.join().is_err() {
                error!("The receive thread panicked");
            }
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.stop_async_receiving();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_budget_follows_ttl() {
        let group = Ipv4Addr::new(239, 255, 67, 76);

        let loopback = Socket::new(group, 24010, 0).unwrap();
        assert_eq!(loopback.max_len_packet(), 65535 - 28);

        let lan = Socket::new(group, 24011, 1).unwrap();
        assert_eq!(lan.max_len_packet(), 1500 - 28);
    }

    #[test]
    fn receive_thread_restarts() {
        let group = Ipv4Addr::new(239, 255, 67, 76);
        let mut socket = Socket::new(group, 24012, 0).unwrap();

        socket.start_async_receiving(|_, _| {}).unwrap();
        socket.stop_async_receiving();
        socket.start_async_receiving(|_, _| {}).unwrap();
        socket.stop_async_receiving();
    }
}
