/*
    Shared Modbus RTU bus. Any number of meter drivers queue requests, the bus
    executes them one after another and broadcasts exactly one event per
    request. Drivers pick the events addressed to their own slave.
*/

use std::time::Duration;
use log::{debug, info, warn};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ErrorKind, ModbusProto};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::config::SerialConfig;

const REQUEST_QUEUE_LEN: usize = 32;
const EVENT_QUEUE_LEN: usize = 256;
/// Slave id, function code and length/first data byte
const RTU_HEADER_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusFunction {
    ReadHoldingRegisters,
    WriteSingleRegister,
}

impl ModbusFunction {
    pub fn code(&self) -> u8 {
        match self {
            ModbusFunction::ReadHoldingRegisters => 0x03,
            ModbusFunction::WriteSingleRegister => 0x06,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusErrorKind {
    Timeout,
    Exception,
    Unsupported,
    CrcError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusRequest {
    ReadRegisters { function: ModbusFunction, slave: u8, start: u16, count: u16 },
    WriteRegister { function: ModbusFunction, slave: u8, register: u16, value: u16 },
}

impl BusRequest {
    pub fn slave(&self) -> u8 {
        match self {
            BusRequest::ReadRegisters { slave, .. } => *slave,
            BusRequest::WriteRegister { slave, .. } => *slave,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    ReadCompleted { function: ModbusFunction, slave: u8, values: Vec<u16> },
    WriteCompleted { function: ModbusFunction, slave: u8, register: u16, value: u16 },
    Error { kind: ModbusErrorKind, slave: u8, exception: u8 },
}

impl BusEvent {
    pub fn slave(&self) -> u8 {
        match self {
            BusEvent::ReadCompleted { slave, .. } => *slave,
            BusEvent::WriteCompleted { slave, .. } => *slave,
            BusEvent::Error { slave, .. } => *slave,
        }
    }
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Unable to open serial port {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("Modbus bus task is not running")]
    Closed,
}

/// Cloneable access to a running bus.
#[derive(Clone)]
pub struct BusHandle {
    requests: mpsc::Sender<BusRequest>,
    events: broadcast::Sender<BusEvent>,
}

impl BusHandle {
    /// The handle plus the bus side of its request queue and event broadcast.
    pub(crate) fn channels() -> (BusHandle, mpsc::Receiver<BusRequest>, broadcast::Sender<BusEvent>) {
        let (rtx, rrx) = mpsc::channel(REQUEST_QUEUE_LEN);
        let (etx, _) = broadcast::channel(EVENT_QUEUE_LEN);
        (BusHandle { requests: rtx, events: etx.clone() }, rrx, etx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, request: BusRequest) -> Result<(), BusError> {
        self.requests.send(request).await.map_err(|_| BusError::Closed)
    }

    pub async fn read_registers(&self, slave: u8, start: u16, count: u16) -> Result<(), BusError> {
        self.send(BusRequest::ReadRegisters {
            function: ModbusFunction::ReadHoldingRegisters,
            slave,
            start,
            count,
        }).await
    }

    pub async fn write_register(&self, slave: u8, register: u16, value: u16) -> Result<(), BusError> {
        self.send(BusRequest::WriteRegister {
            function: ModbusFunction::WriteSingleRegister,
            slave,
            register,
            value,
        }).await
    }
}

pub struct ModbusRtu<S> {
    stream: S,
    requests: mpsc::Receiver<BusRequest>,
    events: broadcast::Sender<BusEvent>,
    response_timeout: Duration,
}

impl ModbusRtu<SerialStream> {
    pub fn open(config: &SerialConfig) -> Result<(Self, BusHandle), BusError> {
        let port = tokio_serial::new(config.port.as_str(), config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .open_native_async()
            .map_err(|e| BusError::Open { port: config.port.clone(), reason: e.to_string() })?;

        info!("Opened {} at {} baud", config.port, config.baud_rate);
        Ok(ModbusRtu::new(port, Duration::from_millis(config.response_timeout_ms)))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ModbusRtu<S> {
    pub fn new(stream: S, response_timeout: Duration) -> (Self, BusHandle) {
        let (handle, rrx, etx) = BusHandle::channels();
        let bus = ModbusRtu {
            stream,
            requests: rrx,
            events: etx,
            response_timeout,
        };
        (bus, handle)
    }

    /// Runs until every `BusHandle` has been dropped.
    pub async fn start_thread(&mut self) {
        info!("Modbus RTU bus started");
        while let Some(request) = self.requests.recv().await {
            let event = self.execute(&request).await;
            /* Nobody listening is fine, the meter may just have been torn down */
            let _ = self.events.send(event);
        }
        info!("All bus users are gone, stopping Modbus RTU bus");
    }

    async fn execute(&mut self, request: &BusRequest) -> BusEvent {
        let slave = request.slave();
        let mut mreq = ModbusRequest::new(slave, ModbusProto::Rtu);
        let mut frame = Vec::new();

        let generated = match request {
            BusRequest::ReadRegisters { start, count, .. } => mreq.generate_get_holdings(*start, *count, &mut frame),
            BusRequest::WriteRegister { register, value, .. } => mreq.generate_set_holding(*register, *value, &mut frame),
        };
        if let Err(e) = generated {
            warn!("Unable to build request for slave {}: {:?}", slave, e);
            return BusEvent::Error { kind: ModbusErrorKind::Exception, slave, exception: 0 };
        }

        if let Err(e) = self.stream.write_all(&frame).await {
            warn!("Failed to write request to slave {}: {}", slave, e);
            return BusEvent::Error { kind: ModbusErrorKind::Timeout, slave, exception: 0 };
        }
        let _ = self.stream.flush().await;

        let response = match tokio::time::timeout(self.response_timeout, self.read_frame()).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                debug!("Reading response of slave {} failed: {}", slave, e);
                return BusEvent::Error { kind: ModbusErrorKind::Timeout, slave, exception: 0 };
            }
            Err(_) => {
                return BusEvent::Error { kind: ModbusErrorKind::Timeout, slave, exception: 0 };
            }
        };

        match request {
            BusRequest::ReadRegisters { function, .. } => {
                let mut values = Vec::new();
                match mreq.parse_u16(&response, &mut values) {
                    Ok(()) => BusEvent::ReadCompleted { function: *function, slave, values },
                    Err(e) => error_event(e, slave),
                }
            }
            BusRequest::WriteRegister { function, .. } => {
                if let Err(e) = mreq.parse_ok(&response) {
                    return error_event(e, slave);
                }
                if response.len() < 6 {
                    return BusEvent::Error { kind: ModbusErrorKind::Exception, slave, exception: 0 };
                }
                BusEvent::WriteCompleted {
                    function: *function,
                    slave,
                    register: u16::from_be_bytes([response[2], response[3]]),
                    value: u16::from_be_bytes([response[4], response[5]]),
                }
            }
        }
    }

    async fn read_frame(&mut self) -> std::io::Result<Vec<u8>> {
        let mut head = [0u8; RTU_HEADER_LEN];
        self.stream.read_exact(&mut head).await?;

        let len = guess_response_frame_len(&head, ModbusProto::Rtu)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{e:?}")))? as usize;

        let mut response = head.to_vec();
        if len > RTU_HEADER_LEN {
            let mut rest = vec![0u8; len - RTU_HEADER_LEN];
            self.stream.read_exact(&mut rest).await?;
            response.extend_from_slice(&rest);
        }
        Ok(response)
    }
}

fn error_event(err: ErrorKind, slave: u8) -> BusEvent {
    let (kind, exception) = classify(err);
    BusEvent::Error { kind, slave, exception }
}

fn classify(err: ErrorKind) -> (ModbusErrorKind, u8) {
    match err {
        ErrorKind::FrameCRCError => (ModbusErrorKind::CrcError, 0),
        ErrorKind::IllegalFunction => (ModbusErrorKind::Unsupported, 1),
        ErrorKind::IllegalDataAddress => (ModbusErrorKind::Exception, 2),
        ErrorKind::IllegalDataValue => (ModbusErrorKind::Exception, 3),
        ErrorKind::SlaveDeviceFailure => (ModbusErrorKind::Exception, 4),
        ErrorKind::Acknowledge => (ModbusErrorKind::Exception, 5),
        ErrorKind::SlaveDeviceBusy => (ModbusErrorKind::Exception, 6),
        ErrorKind::NegativeAcknowledge => (ModbusErrorKind::Exception, 7),
        ErrorKind::MemoryParityError => (ModbusErrorKind::Exception, 8),
        _ => (ModbusErrorKind::Exception, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crc16::{State, MODBUS};
    use tokio::io::DuplexStream;

    fn crc16(data: &[u8]) -> u16 {
        State::<MODBUS>::calculate(data)
    }

    fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    fn start_bus(timeout_ms: u64) -> (BusHandle, DuplexStream) {
        let (bus_side, meter_side) = tokio::io::duplex(256);
        let (mut bus, handle) = ModbusRtu::new(bus_side, Duration::from_millis(timeout_ms));
        tokio::spawn(async move { bus.start_thread().await });
        (handle, meter_side)
    }

    #[tokio::test]
    async fn test_read_holding_registers() {
        let (handle, mut meter) = start_bus(500);
        let mut events = handle.subscribe();
        handle.read_registers(1, 0x000B, 1).await.unwrap();

        let mut request = [0u8; 8];
        meter.read_exact(&mut request).await.unwrap();
        assert_eq!(request[..6], [0x01, 0x03, 0x00, 0x0B, 0x00, 0x01]);
        assert_eq!(u16::from_le_bytes([request[6], request[7]]), crc16(&request[..6]));

        meter.write_all(&with_crc(vec![0x01, 0x03, 0x02, 0x00, 0x47])).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event, BusEvent::ReadCompleted {
            function: ModbusFunction::ReadHoldingRegisters,
            slave: 1,
            values: vec![71],
        });
    }

    #[tokio::test]
    async fn test_write_single_register_echo() {
        let (handle, mut meter) = start_bus(500);
        let mut events = handle.subscribe();
        handle.write_register(2, 0x1103, 1).await.unwrap();

        let mut request = [0u8; 8];
        meter.read_exact(&mut request).await.unwrap();
        assert_eq!(request[..6], [0x02, 0x06, 0x11, 0x03, 0x00, 0x01]);
        /* A write single register response echoes the request */
        meter.write_all(&request).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event, BusEvent::WriteCompleted {
            function: ModbusFunction::WriteSingleRegister,
            slave: 2,
            register: 0x1103,
            value: 1,
        });
    }

    #[tokio::test]
    async fn test_timeout_when_slave_is_silent() {
        let (handle, mut meter) = start_bus(50);
        let mut events = handle.subscribe();
        handle.read_registers(5, 0x0000, 2).await.unwrap();

        let mut request = [0u8; 8];
        meter.read_exact(&mut request).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event, BusEvent::Error { kind: ModbusErrorKind::Timeout, slave: 5, exception: 0 });
    }

    #[tokio::test]
    async fn test_crc_error() {
        let (handle, mut meter) = start_bus(500);
        let mut events = handle.subscribe();
        handle.read_registers(1, 0x000B, 1).await.unwrap();

        let mut request = [0u8; 8];
        meter.read_exact(&mut request).await.unwrap();
        let mut response = with_crc(vec![0x01, 0x03, 0x02, 0x00, 0x47]);
        response[6] ^= 0xFF;
        meter.write_all(&response).await.unwrap();

        match events.recv().await.unwrap() {
            BusEvent::Error { kind, slave, .. } => {
                assert_eq!(kind, ModbusErrorKind::CrcError);
                assert_eq!(slave, 1);
            }
            e => panic!("unexpected event {e:?}"),
        }
    }

    #[tokio::test]
    async fn test_exception_response() {
        let (handle, mut meter) = start_bus(500);
        let mut events = handle.subscribe();
        handle.read_registers(1, 0x7000, 1).await.unwrap();

        let mut request = [0u8; 8];
        meter.read_exact(&mut request).await.unwrap();
        meter.write_all(&with_crc(vec![0x01, 0x83, 0x02])).await.unwrap();

        assert_eq!(events.recv().await.unwrap(),
                   BusEvent::Error { kind: ModbusErrorKind::Exception, slave: 1, exception: 2 });
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(ErrorKind::FrameCRCError), (ModbusErrorKind::CrcError, 0));
        assert_eq!(classify(ErrorKind::IllegalFunction), (ModbusErrorKind::Unsupported, 1));
        assert_eq!(classify(ErrorKind::SlaveDeviceBusy), (ModbusErrorKind::Exception, 6));
    }
}
