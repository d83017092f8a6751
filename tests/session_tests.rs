//! Integration tests for meter sessions over real Modbus TCP sockets

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use shark_modbus::codec::text_to_words;
use shark_modbus::registers::{
    BUSY_LOCK_ADDRESS, ENGAGE_ADDRESS, ENGAGE_ENABLE_BIT, LOCK_ENGAGED, LOCK_FREE, LOCK_REQUEST, NETWORK_CHANNEL,
    WINDOW_DATA_ADDRESS,
};
use shark_modbus::simulator::{demo_catalog, DEMO_VOLTS_REGISTER};
use shark_modbus::*;

/// Serve read-holding-register requests from a fixed register map until the
/// client hangs up. Unmapped registers read as zero.
async fn spawn_tcp_meter(registers: HashMap<u16, u16>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        while socket.read_exact(&mut request).await.is_ok() {
            let unit = request[6];
            let function = request[7];
            let start = u16::from_be_bytes([request[8], request[9]]);
            let quantity = u16::from_be_bytes([request[10], request[11]]);

            let mut pdu = vec![function];
            if function == 0x03 {
                pdu.push((quantity * 2) as u8);
                for i in 0..quantity {
                    let value = registers.get(&(start + i)).copied().unwrap_or(0);
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
            } else {
                pdu = vec![function | 0x80, 0x01];
            }

            let mut frame = vec![request[0], request[1], 0x00, 0x00];
            frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
            frame.push(unit);
            frame.extend(pdu);
            if socket.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    address
}

fn identity_registers() -> HashMap<u16, u16> {
    let mut registers = HashMap::new();
    for (start, text, words) in [(0u16, "Shark 270", 8), (8, "0098765432", 8), (26, "S270", 4)] {
        for (i, word) in text_to_words(text, words).into_iter().enumerate() {
            registers.insert(start + i as u16, word);
        }
    }
    registers
}

#[tokio::test]
async fn test_connect_reads_identity() {
    let address = spawn_tcp_meter(identity_registers()).await;

    let mut session: MeterSession = MeterSession::new().with_timeout(Duration::from_secs(2));
    let identity = session
        .connect(1, &address.ip().to_string(), address.port())
        .await
        .unwrap();

    assert_eq!(identity.name, "Shark 270");
    assert_eq!(identity.serial, "0098765432");
    assert_eq!(identity.model, "S270");
    assert!(session.is_connected());

    let stats = session.stats().unwrap();
    assert_eq!(stats.requests_sent, 2);
    assert_eq!(stats.errors, 0);

    session.disconnect().await.unwrap();
    assert!(!session.is_connected());
    assert!(matches!(
        session.read_holding_registers(0, 1).await,
        Err(MeterError::Connection { .. })
    ));
}

#[tokio::test]
async fn test_poll_over_tcp() {
    let mut registers = identity_registers();
    // FLOAT 230.5 at registers 1000-1001 (addresses 999-1000)
    let [high, low] = codec::float_to_words(230.5);
    registers.insert(999, high);
    registers.insert(1000, low);
    let address = spawn_tcp_meter(registers).await;

    let mut session: MeterSession = MeterSession::new();
    session
        .connect(1, &address.ip().to_string(), address.port())
        .await
        .unwrap();

    let polled = session.poll_registers(1000, 2, FormatTag::Float).await.unwrap();
    assert_eq!(polled[0].register, 1000);
    assert_eq!(polled[0].raw, high);
    assert_eq!(polled[0].cell, Some(DecodedValue::Float32(230.5)));
    assert_eq!(polled[1].cell, None);
}

#[tokio::test]
async fn test_exception_is_reported() {
    let address = spawn_tcp_meter(identity_registers()).await;

    let mut session: MeterSession = MeterSession::new();
    session
        .connect(1, &address.ip().to_string(), address.port())
        .await
        .unwrap();

    let err = session.write_register(0xC34B, 0x000B).await.unwrap_err();
    assert!(matches!(err, MeterError::Exception { function: 0x06, code: 0x01, .. }));
}

#[tokio::test]
async fn test_connect_refused() {
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let mut session: MeterSession = MeterSession::new().with_timeout(Duration::from_millis(500));
    let result = session.connect(1, "127.0.0.1", address.port()).await;
    assert!(matches!(result, Err(MeterError::Connection { .. })));
    assert!(!session.is_connected());
    assert!(session.identity().is_none());
}

#[tokio::test]
async fn test_session_with_simulator_slave_mismatch() {
    let meter = SimulatedMeter::new();
    meter.set_slave_id(7);

    let mut session = MeterSession::new();
    let err = session.attach(meter.clone(), 1).await.unwrap_err();
    assert!(matches!(err, MeterError::Timeout { .. }));
    // A failed attach closes the link it was given
    assert!(!session.is_connected());
    assert!(!meter.is_connected());

    let meter = SimulatedMeter::new();
    meter.set_slave_id(7);
    let mut session = MeterSession::new();
    let identity = session.attach(meter, 7).await.unwrap();
    assert_eq!(identity.model, "S270");
    assert_eq!(session.slave_id(), 7);
}

#[tokio::test]
async fn test_log_status_without_engaging() {
    let meter = SimulatedMeter::demo(30);
    let mut session = MeterSession::new();
    session.attach(meter.clone(), 1).await.unwrap();

    let status = session.read_log_status(HistoricLog::Historic1).await.unwrap();
    assert_eq!(status.records_used, 30);
    assert_eq!(status.capacity, 10_000);
    assert_eq!(status.record_size_bytes, 12);
    assert_eq!(status.holder(), None);
    assert_eq!(status.records_per_window().unwrap(), 20);
    assert_eq!(status.first_timestamp, DecodedValue::Timestamp("22/02/2023 14:00:00".into()));

    let empty = session.read_log_status(HistoricLog::Historic4).await.unwrap();
    assert_eq!(empty.records_used, 0);
    assert!(meter.writes().is_empty());
}

type SharedRegisters = Arc<StdMutex<HashMap<u16, u16>>>;

/// A meter that accepts any number of connections against one register map.
/// It grants the busy lock, marks Historic 1 engaged while the enable bit is
/// set, and holds back its answer to the first window data read for `stall`.
async fn spawn_logging_meter(registers: SharedRegisters, stall: Duration) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let stalled = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_logging_meter(socket, registers.clone(), stalled.clone(), stall));
        }
    });

    address
}

async fn serve_logging_meter(mut socket: TcpStream, registers: SharedRegisters, stalled: Arc<AtomicBool>, stall: Duration) {
    let slot = HistoricLog::Historic1.descriptor();
    let mut header = [0u8; 7];

    while socket.read_exact(&mut header).await.is_ok() {
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length - 1];
        if socket.read_exact(&mut pdu).await.is_err() {
            break;
        }
        let function = pdu[0];
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);

        let reply = match function {
            0x03 => {
                let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
                if start == WINDOW_DATA_ADDRESS && !stalled.swap(true, Ordering::SeqCst) {
                    tokio::time::sleep(stall).await;
                }
                let registers = registers.lock().unwrap();
                let engaged = registers.get(&ENGAGE_ADDRESS).map_or(false, |v| v & ENGAGE_ENABLE_BIT != 0);
                let mut reply = vec![function, (quantity * 2) as u8];
                for address in start..start + quantity {
                    let value = if address == slot.availability_address && engaged {
                        NETWORK_CHANNEL
                    } else {
                        registers.get(&address).copied().unwrap_or(0)
                    };
                    reply.extend_from_slice(&value.to_be_bytes());
                }
                reply
            }
            0x06 => {
                let value = u16::from_be_bytes([pdu[3], pdu[4]]);
                let stored = if start == BUSY_LOCK_ADDRESS && value == LOCK_REQUEST { LOCK_ENGAGED } else { value };
                registers.lock().unwrap().insert(start, stored);
                pdu.clone()
            }
            0x10 => {
                let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
                let mut registers = registers.lock().unwrap();
                for i in 0..quantity {
                    let at = 6 + i as usize * 2;
                    registers.insert(start + i, u16::from_be_bytes([pdu[at], pdu[at + 1]]));
                }
                pdu[..5].to_vec()
            }
            _ => vec![function | 0x80, 0x01],
        };

        let mut frame = header[..4].to_vec();
        frame.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend(reply);
        if socket.write_all(&frame).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn test_stalled_window_still_disengages_over_tcp() {
    let slot = HistoricLog::Historic1.descriptor();
    let mut map = identity_registers();
    // Status block: capacity 100, five 12-byte records, slot free
    for (i, word) in [0u16, 100, 0, 5, 12, 0].into_iter().enumerate() {
        map.insert(slot.status_block_address + i as u16, word);
    }
    map.insert(slot.setup_address, 1);
    map.insert(slot.setup_address + 2, DEMO_VOLTS_REGISTER);
    let registers: SharedRegisters = Arc::new(StdMutex::new(map));

    let address = spawn_logging_meter(registers.clone(), Duration::from_millis(600)).await;
    let mut session: MeterSession = MeterSession::new().with_timeout(Duration::from_millis(200));
    session
        .connect(1, &address.ip().to_string(), address.port())
        .await
        .unwrap();

    let catalog = demo_catalog();
    let mut engine = LogRetrievalEngine::new(&mut session, &catalog);
    let err = engine.retrieve(HistoricLog::Historic1).await.unwrap_err();
    assert!(matches!(err, MeterError::Timeout { .. }));

    {
        let registers = registers.lock().unwrap();
        assert_eq!(registers[&ENGAGE_ADDRESS], 0x0200);
        assert_eq!(registers[&BUSY_LOCK_ADDRESS], LOCK_FREE);
    }
    assert!(session.is_connected());
    assert!(!session.lock_held());
    assert_eq!(session.stats().map(|stats| stats.timeouts), Some(1));
}

#[tokio::test]
async fn test_frame_logger_sees_tcp_traffic() {
    let address = spawn_tcp_meter(identity_registers()).await;
    let lines = Arc::new(StdMutex::new(Vec::new()));
    let sink = lines.clone();
    let callback: LogCallback = Box::new(move |_, message| sink.lock().unwrap().push(message.to_string()));

    let mut session: MeterSession =
        MeterSession::new().with_logger(CallbackLogger::with_mode(Some(callback), LogLevel::Info, LoggingMode::Raw));
    session
        .connect(1, &address.ip().to_string(), address.port())
        .await
        .unwrap();

    let lines = lines.lock().unwrap();
    // Identity read: two requests, two responses
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "Modbus Request -> Raw: 010300000010");
    assert!(lines[1].starts_with("Modbus Response <- Raw: 010320"));
}
