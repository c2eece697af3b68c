use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, timeout_at};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

use crate::metrics::Metrics;
use crate::proto;

pub const MIN_UDP_BUFFER_SIZE: u16 = 512;

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Net {
    Udp,
    Tcp,
    TcpTls,
}

/// TLS material for a DNS-over-TLS upstream: a connector over the webpki
/// roots (plus any extra CA from the config) and the name to verify.
#[derive(Clone)]
pub struct TlsSetup {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsSetup {
    pub fn new(server_name: &str, ca_file: Option<&Path>) -> anyhow::Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = ca_file {
            let pem = std::fs::read(path)
                .with_context(|| format!("read ca file: {}", path.display()))?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.context("parse ca certificate")?;
                roots.add(cert).context("add ca certificate")?;
            }
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| anyhow!("invalid tls server name: {server_name}"))?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

/// Proxy for one remote DNS server. Owns the endpoint identity and performs a
/// single request/response exchange per call, escalating truncated UDP
/// replies to TCP.
pub struct DnsClient {
    addr: SocketAddr,
    net: Net,
    tls: Option<TlsSetup>,
    udp_buffer_size: u16,
    read_timeout: Duration,
    write_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl DnsClient {
    pub fn new(addr: SocketAddr, net: Net) -> Self {
        Self {
            addr,
            net,
            tls: None,
            udp_buffer_size: MIN_UDP_BUFFER_SIZE,
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            metrics: None,
        }
    }

    pub fn with_udp_buffer_size(mut self, size: u16) -> Self {
        self.udp_buffer_size = size.max(MIN_UDP_BUFFER_SIZE);
        self
    }

    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Installing TLS material switches the client to DNS-over-TLS.
    pub fn set_tls(&mut self, tls: TlsSetup) {
        self.net = Net::TcpTls;
        self.tls = Some(tls);
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn net(&self) -> Net {
        self.net
    }

    /// One exchange with this upstream. Cancellation drops the in-flight
    /// socket, which unblocks any pending read or write; the socket is closed
    /// on every exit path.
    pub async fn request(
        &self,
        cancel: &CancellationToken,
        query: &Message,
    ) -> anyhow::Result<Message> {
        let span = debug_span!("upstream_exchange", endpoint = %self.addr, net = ?self.net);
        let start = Instant::now();
        let resp = tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("request cancelled")),
            r = self.exchange(query).instrument(span) => r,
        }?;
        if let Some(metrics) = &self.metrics {
            metrics.record_exchange(&self.endpoint(), resp.response_code(), start.elapsed());
        }
        Ok(resp)
    }

    async fn exchange(&self, query: &Message) -> anyhow::Result<Message> {
        let query_bytes = proto::encode(query)?;
        if query_bytes.len() > u16::MAX as usize {
            bail!("query exceeds maximum dns message size");
        }
        let id = query.id();
        let mut network = self.net;
        loop {
            let resp = match network {
                Net::Udp => {
                    self.exchange_udp(&query_bytes, id, self.udp_read_size(query))
                        .await?
                }
                Net::Tcp | Net::TcpTls => self.exchange_stream(network, &query_bytes, id).await?,
            };
            // Single escalation: a truncated TCP response is accepted as-is.
            if resp.truncated() && network == Net::Udp {
                debug!(endpoint = %self.addr, "truncated udp response, retrying over tcp");
                network = Net::Tcp;
                continue;
            }
            return Ok(resp);
        }
    }

    fn udp_read_size(&self, query: &Message) -> u16 {
        let advertised = query
            .extensions()
            .as_ref()
            .map(|edns| edns.max_payload())
            .unwrap_or(MIN_UDP_BUFFER_SIZE);
        advertised.max(self.udp_buffer_size)
    }

    async fn exchange_udp(
        &self,
        query_bytes: &[u8],
        id: u16,
        read_size: u16,
    ) -> anyhow::Result<Message> {
        let socket = self.bind_udp_socket().context("open udp socket")?;
        socket
            .connect(self.addr)
            .await
            .with_context(|| format!("connect udp {}", self.addr))?;

        timeout(self.write_timeout, socket.send(query_bytes))
            .await
            .map_err(|_| anyhow!("udp write timeout"))?
            .context("udp send")?;

        let deadline = tokio::time::Instant::now() + self.read_timeout;
        let mut buf = vec![0u8; read_size as usize];
        loop {
            let len = timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| anyhow!("udp read timeout"))?
                .context("udp recv")?;
            let msg = Message::from_bytes(&buf[..len]).context("parse upstream response")?;
            if msg.id() == id {
                return Ok(msg);
            }
            // stale or misrouted datagram on the socket, keep reading
            debug!(endpoint = %self.addr, got = msg.id(), want = id, "dropping response with wrong transaction id");
        }
    }

    async fn exchange_stream(
        &self,
        network: Net,
        query_bytes: &[u8],
        id: u16,
    ) -> anyhow::Result<Message> {
        let stream = timeout(self.write_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| anyhow!("tcp connect timeout"))?
            .with_context(|| format!("connect tcp {}", self.addr))?;

        if network == Net::TcpTls {
            let tls = self
                .tls
                .as_ref()
                .context("tls transport selected without tls configuration")?;
            let stream = timeout(
                self.write_timeout,
                tls.connector.connect(tls.server_name.clone(), stream),
            )
            .await
            .map_err(|_| anyhow!("tls handshake timeout"))?
            .with_context(|| format!("tls handshake {}", self.addr))?;
            self.framed_exchange(stream, query_bytes, id).await
        } else {
            self.framed_exchange(stream, query_bytes, id).await
        }
    }

    async fn framed_exchange<S>(
        &self,
        mut stream: S,
        query_bytes: &[u8],
        id: u16,
    ) -> anyhow::Result<Message>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frame = Vec::with_capacity(2 + query_bytes.len());
        frame.extend_from_slice(&(query_bytes.len() as u16).to_be_bytes());
        frame.extend_from_slice(query_bytes);
        timeout(self.write_timeout, stream.write_all(&frame))
            .await
            .map_err(|_| anyhow!("tcp write timeout"))?
            .context("tcp write")?;

        let deadline = tokio::time::Instant::now() + self.read_timeout;
        loop {
            let mut len_buf = [0u8; 2];
            timeout_at(deadline, stream.read_exact(&mut len_buf))
                .await
                .map_err(|_| anyhow!("tcp read timeout"))?
                .context("tcp read len")?;
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            timeout_at(deadline, stream.read_exact(&mut buf))
                .await
                .map_err(|_| anyhow!("tcp read timeout"))?
                .context("tcp read body")?;
            let msg = Message::from_bytes(&buf).context("parse upstream response")?;
            if msg.id() == id {
                return Ok(msg);
            }
            debug!(endpoint = %self.addr, got = msg.id(), want = id, "dropping response with wrong transaction id");
        }
    }

    fn bind_udp_socket(&self) -> anyhow::Result<UdpSocket> {
        let domain = if self.addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .context("create udp socket")?;
        if let Err(err) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
            warn!(error = %err, "failed to set udp recv buffer size");
        }
        socket.set_nonblocking(true).context("set nonblocking")?;
        let bind_addr: SocketAddr = if self.addr.is_ipv4() {
            "0.0.0.0:0".parse().context("parse bind addr")?
        } else {
            "[::]:0".parse().context("parse bind addr")?
        };
        socket.bind(&bind_addr.into()).context("bind udp socket")?;
        UdpSocket::from_std(socket.into()).context("register udp socket")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    fn make_query(name: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(Name::from_str(name).expect("name"));
        q.set_query_type(RecordType::A);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg
    }

    fn reply_to(req: &Message, answer_count: u8) -> Message {
        let mut msg = Message::new();
        msg.set_id(req.id());
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_available(true);
        msg.set_response_code(ResponseCode::NoError);
        msg.add_queries(req.queries().to_vec());
        let name = req.queries()[0].name().clone();
        for i in 0..answer_count {
            msg.add_answer(Record::from_rdata(
                name.clone(),
                3600,
                RData::A(A(Ipv4Addr::new(10, 0, 0, i + 1))),
            ));
        }
        msg
    }

    async fn spawn_udp_truncating(socket: UdpSocket, hits: Arc<AtomicU32>) {
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                hits.fetch_add(1, Ordering::SeqCst);
                let req = Message::from_bytes(&buf[..len]).expect("parse query");
                let mut reply = reply_to(&req, 1);
                reply.set_truncated(true);
                let bytes = proto::encode(&reply).expect("encode");
                let _ = socket.send_to(&bytes, peer).await;
            }
        });
    }

    async fn spawn_tcp_responder(listener: TcpListener, hits: Arc<AtomicU32>, truncated: bool) {
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                hits.fetch_add(1, Ordering::SeqCst);
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    continue;
                }
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut buf = vec![0u8; len];
                if stream.read_exact(&mut buf).await.is_err() {
                    continue;
                }
                let req = Message::from_bytes(&buf).expect("parse query");
                let mut reply = reply_to(&req, 2);
                reply.set_truncated(truncated);
                let bytes = proto::encode(&reply).expect("encode");
                let mut out = Vec::with_capacity(2 + bytes.len());
                out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(&bytes);
                let _ = stream.write_all(&out).await;
            }
        });
    }

    #[tokio::test]
    async fn truncated_udp_response_escalates_to_tcp_once() {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind tcp");
        let addr = tcp_listener.local_addr().expect("addr");
        let udp_socket = UdpSocket::bind(addr).await.expect("bind udp");

        let udp_hits = Arc::new(AtomicU32::new(0));
        let tcp_hits = Arc::new(AtomicU32::new(0));
        spawn_udp_truncating(udp_socket, Arc::clone(&udp_hits)).await;
        spawn_tcp_responder(tcp_listener, Arc::clone(&tcp_hits), false).await;

        let client = DnsClient::new(addr, Net::Udp);
        let query = make_query("example.com.", 42);
        let cancel = CancellationToken::new();

        let resp = client.request(&cancel, &query).await.expect("request");

        assert!(!resp.truncated(), "tcp response must not be truncated");
        assert_eq!(resp.answers().len(), 2, "tcp response carries both answers");
        assert_eq!(udp_hits.load(Ordering::SeqCst), 1, "exactly one udp call");
        assert_eq!(tcp_hits.load(Ordering::SeqCst), 1, "exactly one tcp call");
    }

    #[tokio::test]
    async fn truncated_tcp_response_is_accepted_as_is() {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind tcp");
        let addr = tcp_listener.local_addr().expect("addr");
        let udp_socket = UdpSocket::bind(addr).await.expect("bind udp");

        let udp_hits = Arc::new(AtomicU32::new(0));
        let tcp_hits = Arc::new(AtomicU32::new(0));
        spawn_udp_truncating(udp_socket, Arc::clone(&udp_hits)).await;
        // the tcp answer is itself truncated, which must not trigger another retry
        spawn_tcp_responder(tcp_listener, Arc::clone(&tcp_hits), true).await;

        let client = DnsClient::new(addr, Net::Udp);
        let query = make_query("example.com.", 43);
        let cancel = CancellationToken::new();

        let resp = client.request(&cancel, &query).await.expect("request");

        assert!(resp.truncated(), "truncated tcp response is returned as-is");
        assert_eq!(resp.answers().len(), 2);
        assert_eq!(udp_hits.load(Ordering::SeqCst), 1, "exactly one udp call");
        assert_eq!(tcp_hits.load(Ordering::SeqCst), 1, "no second escalation");
    }

    #[tokio::test]
    async fn wrong_transaction_ids_are_drained_until_match() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = socket.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let req = Message::from_bytes(&buf[..len]).expect("parse");
                // first a stale datagram with a mismatched id
                let mut stale = reply_to(&req, 1);
                stale.set_id(req.id().wrapping_add(1));
                let _ = socket
                    .send_to(&proto::encode(&stale).expect("encode"), peer)
                    .await;
                let good = reply_to(&req, 1);
                let _ = socket
                    .send_to(&proto::encode(&good).expect("encode"), peer)
                    .await;
            }
        });

        let client = DnsClient::new(addr, Net::Udp);
        let query = make_query("example.com.", 7);
        let cancel = CancellationToken::new();
        let resp = client.request(&cancel, &query).await.expect("request");
        assert_eq!(resp.id(), 7);
        assert_eq!(resp.answers().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_unblocks_inflight_read() {
        // upstream that never answers
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = socket.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let _ = socket.recv_from(&mut buf).await;
            std::future::pending::<()>().await;
        });

        let client = DnsClient::new(addr, Net::Udp)
            .with_timeouts(Duration::from_secs(30), Duration::from_secs(1));
        let query = make_query("example.com.", 9);
        let cancel = CancellationToken::new();
        let handle = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let err = client.request(&cancel, &query).await.expect_err("cancelled");
        assert!(err.to_string().contains("cancelled"));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "cancellation must not wait for the read deadline"
        );
    }

    #[tokio::test]
    async fn tcp_connect_failure_surfaces_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = DnsClient::new(addr, Net::Tcp);
        let query = make_query("example.com.", 3);
        let cancel = CancellationToken::new();
        let err = client.request(&cancel, &query).await.expect_err("refused");
        assert!(err.to_string().contains("connect tcp"));
    }

    #[test]
    fn udp_read_size_prefers_advertised_edns_payload() {
        let client = DnsClient::new("127.0.0.1:53".parse().expect("addr"), Net::Udp)
            .with_udp_buffer_size(1232);
        let mut query = make_query("example.com.", 1);
        assert_eq!(client.udp_read_size(&query), 1232);
        let mut edns = hickory_proto::op::Edns::new();
        edns.set_max_payload(4096);
        query.set_edns(edns);
        assert_eq!(client.udp_read_size(&query), 4096);
    }
}
