//! In-process fake PLC for tests
//!
//! Listens on a loopback port and speaks just enough ENIP/CIP to exercise
//! the client: RegisterSession, Forward Open/Close, connected and
//! unconnected attribute access, ListServices probes, and NOP. Behavior
//! knobs let tests inject protocol errors, stalls, and mid-reply
//! disconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::codec::cip::{service, CipStatus, ForwardOpenReply, ForwardOpenRequest};
use crate::codec::enip::{EnipCommand, EnipHeader, EnipPacket, HEADER_LEN};
use crate::codec::{CipPath, CipReply, CipRequest, PathSegment, SendData};
use crate::connection::Endpoint;

const DEFAULT_SESSION_HANDLE: u32 = 0x0000_00AB;
const DEFAULT_O_T_ID: u32 = 0x11223344;
const DEFAULT_T_O_ID: u32 = 0x55667788;

/// Scripted behavior shared between a test and the fake PLC tasks.
pub struct Behavior {
    register_status: AtomicU32,
    registers: AtomicUsize,
    incrementing_handles: AtomicBool,
    next_handle: AtomicU32,
    unregistered: Mutex<Vec<u32>>,
    o_t_id: AtomicU32,
    t_o_id: AtomicU32,
    forward_closes: AtomicUsize,
    attributes: Mutex<HashMap<(u16, u16, u16), Vec<u8>>>,
    write_status: AtomicU8,
    writes: Mutex<Vec<Vec<u8>>>,
    nops: Mutex<Vec<Vec<u8>>>,
    last_unit_sequence: Mutex<Option<u16>>,
    last_unit_request: Mutex<Option<Vec<u8>>>,
    drop_next_reply: AtomicBool,
    stall_probes: AtomicBool,
}

impl Behavior {
    fn new() -> Self {
        Self {
            register_status: AtomicU32::new(0),
            registers: AtomicUsize::new(0),
            incrementing_handles: AtomicBool::new(false),
            next_handle: AtomicU32::new(1),
            unregistered: Mutex::new(Vec::new()),
            o_t_id: AtomicU32::new(DEFAULT_O_T_ID),
            t_o_id: AtomicU32::new(DEFAULT_T_O_ID),
            forward_closes: AtomicUsize::new(0),
            attributes: Mutex::new(HashMap::new()),
            write_status: AtomicU8::new(0),
            writes: Mutex::new(Vec::new()),
            nops: Mutex::new(Vec::new()),
            last_unit_sequence: Mutex::new(None),
            last_unit_request: Mutex::new(None),
            drop_next_reply: AtomicBool::new(false),
            stall_probes: AtomicBool::new(false),
        }
    }

    pub fn set_register_status(&self, status: u32) {
        self.register_status.store(status, Ordering::SeqCst);
    }

    pub fn set_incrementing_handles(&self) {
        self.incrementing_handles.store(true, Ordering::SeqCst);
    }

    pub fn register_count(&self) -> usize {
        self.registers.load(Ordering::SeqCst)
    }

    pub fn unregistered_handles(&self) -> Vec<u32> {
        self.unregistered.lock().unwrap().clone()
    }

    pub fn set_attribute(&self, class: u16, instance: u16, attribute: u16, data: Vec<u8>) {
        self.attributes
            .lock()
            .unwrap()
            .insert((class, instance, attribute), data);
    }

    pub fn set_write_status(&self, general: u8) {
        self.write_status.store(general, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn nops(&self) -> Vec<Vec<u8>> {
        self.nops.lock().unwrap().clone()
    }

    pub fn last_unit_sequence(&self) -> Option<u16> {
        *self.last_unit_sequence.lock().unwrap()
    }

    pub fn last_unit_request(&self) -> Option<Vec<u8>> {
        self.last_unit_request.lock().unwrap().clone()
    }

    pub fn saw_forward_close(&self) -> bool {
        self.forward_closes.load(Ordering::SeqCst) > 0
    }

    /// Truncate the next reply mid-frame and drop the stream.
    pub fn drop_next_reply(&self) {
        self.drop_next_reply.store(true, Ordering::SeqCst);
    }

    /// Stop answering ListServices probes; the stream stays open.
    pub fn stall_probes(&self, stall: bool) {
        self.stall_probes.store(stall, Ordering::SeqCst);
    }

    fn allocate_handle(&self) -> u32 {
        if self.incrementing_handles.load(Ordering::SeqCst) {
            self.next_handle.fetch_add(1, Ordering::SeqCst)
        } else {
            DEFAULT_SESSION_HANDLE
        }
    }
}

/// A fake PLC bound to an ephemeral loopback port.
pub struct FakePlc {
    endpoint: Endpoint,
    behavior: Arc<Behavior>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Install a fmt subscriber once so failing tests can be rerun with
/// `RUST_LOG=debug` for the full exchange trace.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

impl FakePlc {
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let behavior = Arc::new(Behavior::new());
        let tasks = Arc::new(Mutex::new(Vec::new()));

        let accept_behavior = Arc::clone(&behavior);
        let accept_tasks = Arc::clone(&tasks);
        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let behavior = Arc::clone(&accept_behavior);
                        let task = tokio::spawn(async move {
                            let _ = serve(stream, behavior).await;
                        });
                        accept_tasks.lock().unwrap().push(task);
                    }
                    Err(_) => break,
                }
            }
        });
        tasks.lock().unwrap().push(acceptor);

        Self {
            endpoint: Endpoint::new("127.0.0.1", addr.port()),
            behavior,
            tasks,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    pub fn behavior(&self) -> &Behavior {
        &self.behavior
    }

    /// Kill the listener and every live stream; subsequent connects are
    /// refused.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Block until the PLC has seen an UnregisterSession for `handle`.
    pub async fn wait_for_unregister(&self, handle: u32) {
        for _ in 0..100 {
            if self.behavior.unregistered_handles().contains(&handle) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no UnregisterSession for 0x{:08X} observed", handle);
    }
}

impl Drop for FakePlc {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(mut stream: TcpStream, behavior: Arc<Behavior>) -> std::io::Result<()> {
    loop {
        let mut header_bytes = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header_bytes).await.is_err() {
            return Ok(());
        }
        let header = match EnipHeader::decode(&header_bytes) {
            Ok(header) => header,
            Err(_) => return Ok(()),
        };
        let mut payload = vec![0u8; header.length as usize];
        if !payload.is_empty() && stream.read_exact(&mut payload).await.is_err() {
            return Ok(());
        }

        let reply = match header.command {
            EnipCommand::RegisterSession => {
                behavior.registers.fetch_add(1, Ordering::SeqCst);
                let status = behavior.register_status.load(Ordering::SeqCst);
                let handle = if status == 0 { behavior.allocate_handle() } else { 0 };
                Some(EnipPacket {
                    command: EnipCommand::RegisterSession,
                    session_handle: handle,
                    status,
                    sender_context: header.sender_context,
                    options: 0,
                    payload: vec![0x01, 0x00, 0x00, 0x00],
                })
            }
            EnipCommand::UnregisterSession => {
                behavior
                    .unregistered
                    .lock()
                    .unwrap()
                    .push(header.session_handle);
                None
            }
            EnipCommand::Nop => {
                behavior.nops.lock().unwrap().push(payload);
                None
            }
            EnipCommand::ListServices => {
                if behavior.stall_probes.load(Ordering::SeqCst) {
                    continue;
                }
                Some(EnipPacket {
                    command: EnipCommand::ListServices,
                    session_handle: header.session_handle,
                    status: 0,
                    sender_context: header.sender_context,
                    options: 0,
                    payload: vec![0x00, 0x00],
                })
            }
            EnipCommand::SendRRData => {
                handle_rr(&behavior, &header, &payload)
            }
            EnipCommand::SendUnitData => {
                handle_unit(&behavior, &header, &payload)
            }
            _ => None,
        };

        if let Some(reply) = reply {
            let encoded = reply.encode();
            if behavior.drop_next_reply.swap(false, Ordering::SeqCst) {
                let half = encoded.len() / 2;
                let _ = stream.write_all(&encoded[..half]).await;
                let _ = stream.shutdown().await;
                return Ok(());
            }
            stream.write_all(&encoded).await?;
        }
    }
}

fn handle_rr(behavior: &Behavior, header: &EnipHeader, payload: &[u8]) -> Option<EnipPacket> {
    let send = SendData::decode(payload).ok()?;
    let cip = send.unconnected_reply().ok()?;
    let request = CipRequest::decode(&cip).ok()?;
    let reply = dispatch_service(behavior, &request);
    let body = SendData::unconnected(reply.encode());
    Some(EnipPacket {
        command: EnipCommand::SendRRData,
        session_handle: header.session_handle,
        status: 0,
        sender_context: header.sender_context,
        options: 0,
        payload: body.encode(),
    })
}

fn handle_unit(behavior: &Behavior, header: &EnipHeader, payload: &[u8]) -> Option<EnipPacket> {
    let send = SendData::decode(payload).ok()?;
    let (_connection_id, sequence, cip) = send.connected_reply().ok()?;
    *behavior.last_unit_sequence.lock().unwrap() = Some(sequence);
    *behavior.last_unit_request.lock().unwrap() = Some(cip.clone());
    let request = CipRequest::decode(&cip).ok()?;
    let reply = dispatch_service(behavior, &request);
    let body = SendData::connected(
        behavior.t_o_id.load(Ordering::SeqCst),
        sequence,
        reply.encode(),
    );
    Some(EnipPacket {
        command: EnipCommand::SendUnitData,
        session_handle: header.session_handle,
        status: 0,
        sender_context: header.sender_context,
        options: 0,
        payload: body.encode(),
    })
}

fn dispatch_service(behavior: &Behavior, request: &CipRequest) -> CipReply {
    match request.service {
        service::UNCONNECTED_SEND => {
            // unwrap the embedded message and serve it
            let embedded = request
                .data
                .get(2..4)
                .map(|size| u16::from_le_bytes([size[0], size[1]]) as usize)
                .and_then(|size| request.data.get(4..4 + size));
            match embedded.and_then(|bytes| CipRequest::decode(bytes).ok()) {
                Some(inner) => dispatch_service(behavior, &inner),
                None => CipReply {
                    service: service::UNCONNECTED_SEND,
                    status: CipStatus {
                        general: 0x13,
                        extended: None,
                    },
                    data: Vec::new(),
                },
            }
        }
        service::FORWARD_OPEN => {
            let reply = match ForwardOpenRequest::decode(&request.data) {
                Ok(open) => ForwardOpenReply {
                    o_t_connection_id: behavior.o_t_id.load(Ordering::SeqCst),
                    t_o_connection_id: behavior.t_o_id.load(Ordering::SeqCst),
                    connection_serial: open.connection_serial,
                    vendor_id: open.vendor_id,
                    originator_serial: open.originator_serial,
                    o_t_api_us: open.o_t_rpi_us,
                    t_o_api_us: open.t_o_rpi_us,
                },
                Err(_) => {
                    return CipReply {
                        service: service::FORWARD_OPEN,
                        status: CipStatus {
                            general: 0x13,
                            extended: None,
                        },
                        data: Vec::new(),
                    }
                }
            };
            CipReply {
                service: service::FORWARD_OPEN,
                status: CipStatus::SUCCESS,
                data: reply.encode(),
            }
        }
        service::FORWARD_CLOSE => {
            behavior.forward_closes.fetch_add(1, Ordering::SeqCst);
            CipReply {
                service: service::FORWARD_CLOSE,
                status: CipStatus::SUCCESS,
                data: Vec::new(),
            }
        }
        service::GET_ATTRIBUTE_SINGLE => {
            let ids = path_ids(&request.path);
            match behavior.attributes.lock().unwrap().get(&ids) {
                Some(data) => CipReply {
                    service: service::GET_ATTRIBUTE_SINGLE,
                    status: CipStatus::SUCCESS,
                    data: data.clone(),
                },
                None => CipReply {
                    service: service::GET_ATTRIBUTE_SINGLE,
                    status: CipStatus {
                        general: 0x05,
                        extended: None,
                    },
                    data: Vec::new(),
                },
            }
        }
        service::SET_ATTRIBUTE_SINGLE => {
            behavior.writes.lock().unwrap().push(request.data.clone());
            let general = behavior.write_status.load(Ordering::SeqCst);
            let ids = path_ids(&request.path);
            if general == 0 {
                behavior
                    .attributes
                    .lock()
                    .unwrap()
                    .insert(ids, request.data.clone());
            }
            CipReply {
                service: service::SET_ATTRIBUTE_SINGLE,
                status: CipStatus {
                    general,
                    extended: None,
                },
                data: Vec::new(),
            }
        }
        other => CipReply {
            service: other,
            status: CipStatus {
                general: 0x08,
                extended: None,
            },
            data: Vec::new(),
        },
    }
}

fn path_ids(path: &CipPath) -> (u16, u16, u16) {
    let (mut class, mut instance, mut attribute) = (0, 0, 0);
    for segment in path.segments() {
        match segment {
            PathSegment::Class(v) => class = *v,
            PathSegment::Instance(v) => instance = *v,
            PathSegment::Attribute(v) => attribute = *v,
            _ => {}
        }
    }
    (class, instance, attribute)
}
