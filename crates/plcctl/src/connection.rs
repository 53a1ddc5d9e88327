//! One TCP connection to a PLC endpoint
//!
//! Owns the socket, the ENIP session handle, and the Class 3 connection
//! ids. Exactly one exchange is in flight at a time; the `&mut self`
//! receivers enforce that statically. Reads are length-prefixed: the
//! 24-byte encapsulation header first, then exactly `length` more bytes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::cip::{
    self, service, ForwardCloseRequest, ForwardOpenReply, ForwardOpenRequest,
};
use crate::codec::enip::{EnipCommand, EnipHeader, EnipPacket, HEADER_LEN};
use crate::codec::{CipPath, CipReply, CipRequest, CipStatus, SendData};
use crate::error::{Error, Result};

/// Originator vendor id reported in Forward Open requests.
pub const VENDOR_ID: u16 = 0x00FA;

/// A PLC endpoint, the identity pools are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection lifecycle: Closed → Registered → Connected → Closed, with
/// Broken as the terminal state of a failed connection awaiting
/// replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Registered,
    Connected,
    Broken,
}

/// Socket-level deadlines.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2000),
            read_timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    endpoint: Endpoint,
    options: ConnectionOptions,
    stream: Option<TcpStream>,
    state: ConnectionState,
    session_handle: u32,
    o_t_connection_id: u32,
    t_o_connection_id: u32,
    connection_serial: u16,
    originator_serial: u32,
    seq_count: u16,
    last_activity: Option<DateTime<Utc>>,
}

impl Connection {
    pub fn new(endpoint: Endpoint, options: ConnectionOptions) -> Self {
        Self {
            endpoint,
            options,
            stream: None,
            state: ConnectionState::Closed,
            session_handle: 0,
            o_t_connection_id: 0,
            t_o_connection_id: 0,
            connection_serial: 0,
            originator_serial: rand::random(),
            seq_count: 0,
            last_activity: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_handle(&self) -> u32 {
        self.session_handle
    }

    pub fn o_t_connection_id(&self) -> u32 {
        self.o_t_connection_id
    }

    pub fn t_o_connection_id(&self) -> u32 {
        self.t_o_connection_id
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_activity
    }

    /// Demote to Broken so the pool replaces this connection instead of
    /// reusing it.
    pub fn mark_broken(&mut self) {
        self.state = ConnectionState::Broken;
    }

    /// Establish TCP and register the ENIP session.
    /// Transitions Closed → Registered.
    pub async fn open(&mut self) -> Result<()> {
        let result = self.open_inner().await;
        if result.is_err() {
            self.mark_broken();
        }
        result
    }

    async fn open_inner(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.endpoint.host, self.endpoint.port);
        let stream = timeout(self.options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::transport(format!("connect to {} timed out", addr)))?
            .map_err(|e| Error::transport_io(format!("connect to {} failed", addr), e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed on {}: {}", addr, e);
        }
        self.stream = Some(stream);

        let reply = match self.transact(EnipPacket::register_session()).await {
            Ok(reply) => reply,
            Err(Error::EnipProtocol { status }) => {
                return Err(Error::RegisterFailed { status });
            }
            Err(e) => return Err(e),
        };
        if reply.session_handle == 0 {
            return Err(Error::RegisterFailed {
                status: reply.status,
            });
        }
        let version = EnipPacket::decode_register_reply(&reply.payload)?;
        debug!(
            "registered ENIP session 0x{:08X} on {} (protocol version {})",
            reply.session_handle, self.endpoint, version
        );
        self.session_handle = reply.session_handle;
        self.state = ConnectionState::Registered;
        self.touch();
        Ok(())
    }

    /// Forward Open a Class 3 explicit connection.
    /// Transitions Registered → Connected.
    pub async fn connect(&mut self) -> Result<()> {
        let result = self.connect_inner().await;
        if result.is_err() {
            self.mark_broken();
        }
        result
    }

    async fn connect_inner(&mut self) -> Result<()> {
        if self.state != ConnectionState::Registered {
            return Err(Error::transport(format!(
                "forward open requires a registered connection, state is {:?}",
                self.state
            )));
        }
        let t_o_proposed: u32 = rand::random();
        let serial: u16 = rand::random();
        let open =
            ForwardOpenRequest::class3(t_o_proposed, serial, VENDOR_ID, self.originator_serial);
        let request = CipRequest::new(
            service::FORWARD_OPEN,
            cip::connection_manager_path(),
            open.encode()?,
        );
        let (status, data) = self.exchange_rr(request).await?;
        if !status.is_success() {
            return Err(Error::CipFault {
                general: status.general,
                extended: status.extended,
            });
        }
        let reply = ForwardOpenReply::decode(&data)?;
        self.o_t_connection_id = reply.o_t_connection_id;
        self.t_o_connection_id = reply.t_o_connection_id;
        self.connection_serial = serial;
        self.seq_count = 0;
        self.state = ConnectionState::Connected;
        debug!(
            "forward open on {}: o_t=0x{:08X} t_o=0x{:08X} serial=0x{:04X}",
            self.endpoint, reply.o_t_connection_id, reply.t_o_connection_id, serial
        );
        Ok(())
    }

    /// One unconnected (UCMM) exchange via SendRRData. With `wrap`, the
    /// request is tunneled through an Unconnected Send on the Connection
    /// Manager.
    pub async fn request_rr(
        &mut self,
        service: u8,
        path: CipPath,
        data: Vec<u8>,
        wrap: bool,
    ) -> Result<(CipStatus, Vec<u8>)> {
        if !matches!(
            self.state,
            ConnectionState::Registered | ConnectionState::Connected
        ) {
            return Err(Error::transport(format!(
                "unconnected exchange requires a registered connection, state is {:?}",
                self.state
            )));
        }
        let mut request = CipRequest::new(service, path, data);
        if wrap {
            request = cip::wrap_unconnected_send(&request)?;
        }
        let (status, data) = self.exchange_rr(request).await?;
        self.touch();
        Ok((status, data))
    }

    async fn exchange_rr(&mut self, request: CipRequest) -> Result<(CipStatus, Vec<u8>)> {
        let body = SendData::unconnected(request.encode()?);
        let packet =
            EnipPacket::request(EnipCommand::SendRRData, self.session_handle, body.encode());
        let reply = self.transact(packet).await?;
        let send = self.checked(SendData::decode(&reply.payload))?;
        for (type_id, data) in send.other_items() {
            debug!(
                "uninterpreted CPF item 0x{:04X} ({} bytes) in reply from {}",
                type_id,
                data.len(),
                self.endpoint
            );
        }
        let cip = self.checked(send.unconnected_reply())?;
        let reply = self.checked(CipReply::decode(&cip))?;
        Ok((reply.status, reply.data))
    }

    /// One Class 3 connected exchange via SendUnitData. Requires state
    /// Connected; the sequence count is pre-incremented and wraps at 2^16.
    pub async fn request_unit(
        &mut self,
        service: u8,
        path: CipPath,
        data: Vec<u8>,
    ) -> Result<(CipStatus, Vec<u8>)> {
        if self.state != ConnectionState::Connected {
            return Err(Error::transport(format!(
                "connected exchange requires forward open, state is {:?}",
                self.state
            )));
        }
        self.seq_count = self.seq_count.wrapping_add(1);
        let sequence = self.seq_count;
        let request = CipRequest::new(service, path, data);
        let body = SendData::connected(self.o_t_connection_id, sequence, request.encode()?);
        let packet =
            EnipPacket::request(EnipCommand::SendUnitData, self.session_handle, body.encode());
        let reply = self.transact(packet).await?;
        let send = self.checked(SendData::decode(&reply.payload))?;
        let (connection_id, reply_seq, cip) = self.checked(send.connected_reply())?;
        if connection_id != self.t_o_connection_id {
            return Err(self.fail(Error::malformed(format!(
                "connected reply addressed to 0x{:08X}, expected 0x{:08X}",
                connection_id, self.t_o_connection_id
            ))));
        }
        if reply_seq != sequence {
            return Err(self.fail(Error::malformed(format!(
                "connected reply sequence {} does not match request sequence {}",
                reply_seq, sequence
            ))));
        }
        let reply = self.checked(CipReply::decode(&cip))?;
        self.touch();
        Ok((reply.status, reply.data))
    }

    /// Send the keep-alive pattern as an ENIP NOP. No reply follows.
    pub async fn heartbeat_nop(&mut self, pattern: &[u8]) -> Result<()> {
        let packet = EnipPacket::nop(self.session_handle, pattern);
        self.send_packet(&packet).await?;
        self.touch();
        Ok(())
    }

    /// ListServices probe used as the keep-alive on a connected session;
    /// the reply is read and discarded.
    pub async fn probe_list_services(&mut self) -> Result<()> {
        let reply = self
            .transact(EnipPacket::list_services(self.session_handle))
            .await?;
        debug!(
            "list services probe on {}: {} payload bytes",
            self.endpoint,
            reply.payload.len()
        );
        self.touch();
        Ok(())
    }

    /// Graceful teardown: Forward Close if Connected, UnregisterSession if
    /// Registered, then drop the socket. Always ends in Closed; the first
    /// teardown error is returned, later ones are logged and swallowed.
    pub async fn close(&mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;

        if self.state == ConnectionState::Connected {
            if let Err(e) = self.forward_close().await {
                warn!("forward close on {} failed: {}", self.endpoint, e);
                first_error.get_or_insert(e);
            }
        }

        if matches!(
            self.state,
            ConnectionState::Registered | ConnectionState::Connected
        ) && self.session_handle != 0
        {
            let packet = EnipPacket::unregister_session(self.session_handle);
            if let Err(e) = self.send_packet(&packet).await {
                warn!("unregister session on {} failed: {}", self.endpoint, e);
                first_error.get_or_insert(e);
            }
        }

        self.stream = None;
        self.state = ConnectionState::Closed;
        self.session_handle = 0;
        self.o_t_connection_id = 0;
        self.t_o_connection_id = 0;
        self.seq_count = 0;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn forward_close(&mut self) -> Result<()> {
        let close =
            ForwardCloseRequest::new(self.connection_serial, VENDOR_ID, self.originator_serial);
        let request = CipRequest::new(
            service::FORWARD_CLOSE,
            cip::connection_manager_path(),
            close.encode()?,
        );
        let (status, _) = self.exchange_rr(request).await?;
        if !status.is_success() {
            return Err(Error::CipFault {
                general: status.general,
                extended: status.extended,
            });
        }
        Ok(())
    }

    /// Send one frame and read the matching reply.
    async fn transact(&mut self, packet: EnipPacket) -> Result<EnipPacket> {
        let command = packet.command;
        self.send_packet(&packet).await?;
        let reply = self.read_packet().await?;
        if reply.command != command {
            return Err(self.fail(Error::malformed(format!(
                "reply command {:?} does not match request {:?}",
                reply.command, command
            ))));
        }
        if reply.status != 0 {
            return Err(Error::EnipProtocol {
                status: reply.status,
            });
        }
        Ok(reply)
    }

    async fn send_packet(&mut self, packet: &EnipPacket) -> Result<()> {
        let result = self.send_packet_inner(packet).await;
        result.map_err(|e| self.fail(e))
    }

    async fn send_packet_inner(&mut self, packet: &EnipPacket) -> Result<()> {
        let encoded = packet.encode();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::transport("connection has no socket"))?;
        stream
            .write_all(&encoded)
            .await
            .map_err(|e| Error::transport_io("write failed", e))?;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<EnipPacket> {
        let result = self.read_packet_inner().await;
        result.map_err(|e| self.fail(e))
    }

    async fn read_packet_inner(&mut self) -> Result<EnipPacket> {
        let read_timeout = self.options.read_timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::transport("connection has no socket"))?;

        let mut header_bytes = [0u8; HEADER_LEN];
        timeout(read_timeout, stream.read_exact(&mut header_bytes))
            .await
            .map_err(|_| Error::transport("read timed out"))?
            .map_err(|e| Error::transport_io("read failed", e))?;
        let header = EnipHeader::decode(&header_bytes)?;

        let mut payload = vec![0u8; header.length as usize];
        if !payload.is_empty() {
            timeout(read_timeout, stream.read_exact(&mut payload))
                .await
                .map_err(|_| Error::transport("read timed out mid-frame"))?
                .map_err(|e| Error::transport_io("read failed mid-frame", e))?;
        }

        Ok(EnipPacket {
            command: header.command,
            session_handle: header.session_handle,
            status: header.status,
            sender_context: header.sender_context,
            options: header.options,
            payload,
        })
    }

    fn checked<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.fail(e))
    }

    fn fail(&mut self, error: Error) -> Error {
        if error.breaks_connection() {
            self.mark_broken();
        }
        error
    }

    fn touch(&mut self) {
        self.last_activity = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::cip::service;
    use crate::testsupport::FakePlc;

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_open_registers_session() {
        let plc = FakePlc::start().await;
        let mut conn = Connection::new(plc.endpoint(), options());
        conn.open().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Registered);
        assert_eq!(conn.session_handle(), 0x0000_00AB);
    }

    #[tokio::test]
    async fn test_register_failure_reports_status_and_breaks() {
        let plc = FakePlc::start().await;
        plc.behavior().set_register_status(0x69);
        let mut conn = Connection::new(plc.endpoint(), options());
        let err = conn.open().await.unwrap_err();
        assert!(matches!(err, Error::RegisterFailed { status: 0x69 }));
        assert_eq!(conn.state(), ConnectionState::Broken);
    }

    #[tokio::test]
    async fn test_forward_open_records_connection_ids() {
        let plc = FakePlc::start().await;
        let mut conn = Connection::new(plc.endpoint(), options());
        conn.open().await.unwrap();
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.o_t_connection_id(), 0x11223344);
        assert_eq!(conn.t_o_connection_id(), 0x55667788);
    }

    #[tokio::test]
    async fn test_sequence_counter_increments_per_unit_exchange() {
        let plc = FakePlc::start().await;
        let mut conn = Connection::new(plc.endpoint(), options());
        conn.open().await.unwrap();
        conn.connect().await.unwrap();
        plc.behavior()
            .set_attribute(4, 1, 3, vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        for expected_seq in 1..=5u16 {
            let (status, _) = conn
                .request_unit(
                    service::GET_ATTRIBUTE_SINGLE,
                    cip::assembly_data_path(4, 1),
                    Vec::new(),
                )
                .await
                .unwrap();
            assert!(status.is_success());
            assert_eq!(plc.behavior().last_unit_sequence(), Some(expected_seq));
        }
    }

    #[tokio::test]
    async fn test_unit_exchange_requires_connected_state() {
        let plc = FakePlc::start().await;
        let mut conn = Connection::new(plc.endpoint(), options());
        conn.open().await.unwrap();
        let err = conn
            .request_unit(
                service::GET_ATTRIBUTE_SINGLE,
                cip::assembly_data_path(4, 1),
                Vec::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn test_mid_reply_disconnect_breaks_connection() {
        let plc = FakePlc::start().await;
        let mut conn = Connection::new(plc.endpoint(), options());
        conn.open().await.unwrap();
        conn.connect().await.unwrap();
        plc.behavior().drop_next_reply();
        let err = conn
            .request_unit(
                service::GET_ATTRIBUTE_SINGLE,
                cip::assembly_data_path(4, 1),
                Vec::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(conn.state(), ConnectionState::Broken);
    }

    #[tokio::test]
    async fn test_close_sends_forward_close_and_unregister() {
        let plc = FakePlc::start().await;
        let mut conn = Connection::new(plc.endpoint(), options());
        conn.open().await.unwrap();
        conn.connect().await.unwrap();
        let handle = conn.session_handle();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        plc.wait_for_unregister(handle).await;
        assert!(plc.behavior().saw_forward_close());
    }

    #[tokio::test]
    async fn test_nop_carries_the_keep_alive_pattern() {
        let plc = FakePlc::start().await;
        let mut conn = Connection::new(plc.endpoint(), options());
        conn.open().await.unwrap();
        conn.heartbeat_nop(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
        // NOP is fire-and-forget; poll the receiver side
        for _ in 0..50 {
            if !plc.behavior().nops().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(plc.behavior().nops(), vec![vec![0xDE, 0xAD, 0xBE, 0xEF]]);
    }

    #[tokio::test]
    async fn test_close_on_closed_connection_is_a_no_op() {
        let plc = FakePlc::start().await;
        let mut conn = Connection::new(plc.endpoint(), options());
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_cip_error_does_not_break_connection() {
        let plc = FakePlc::start().await;
        let mut conn = Connection::new(plc.endpoint(), options());
        conn.open().await.unwrap();
        conn.connect().await.unwrap();
        plc.behavior().set_write_status(0x0C);
        let (status, _) = conn
            .request_unit(
                service::SET_ATTRIBUTE_SINGLE,
                cip::assembly_data_path(4, 1),
                vec![0xFF],
            )
            .await
            .unwrap();
        assert_eq!(status.general, 0x0C);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
}
