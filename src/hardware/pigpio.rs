//! Client for the pigpio daemon socket interface.
//!
//! Every command is a 16-byte frame of four little-endian `u32`s
//! (`cmd`, `p1`, `p2`, `p3`), optionally followed by `p3` bytes of extension
//! data. The daemon answers with the same 16-byte layout where the last word
//! is a signed result; negative values are error codes. `I2CRD` additionally
//! returns `result` bytes of payload after the frame.
//!
//! The stream is taken out of its slot for the duration of an exchange and
//! only put back once the full answer was read. An exchange that is dropped
//! halfway (cancelled task, timeout) or hits an I/O error therefore takes the
//! connection with it, and the next command reconnects instead of reading a
//! stale answer.

use super::{BusHandle, HardwareAccess, HardwareError, Level, LineMode};
use crate::config::GpioConfig;
use crate::instance_lock::{HARDWARE_SLOT, InstanceLock, InstanceSlot};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const CMD_MODES: u32 = 0;
const CMD_READ: u32 = 3;
const CMD_WRITE: u32 = 4;
const CMD_I2CO: u32 = 54;
const CMD_I2CC: u32 = 55;
const CMD_I2CRD: u32 = 56;

const MODE_INPUT: u32 = 0;
const MODE_OUTPUT: u32 = 1;

const FRAME_LEN: usize = 16;

/// Connection to a local or remote `pigpiod`.
pub struct PigpioClient {
    addr: String,
    /// `None` after an interrupted or failed exchange.
    stream: Mutex<Option<TcpStream>>,
    _instance: InstanceLock,
}

impl PigpioClient {
    /// Connect to the daemon. Fails if a client already exists.
    pub async fn connect(config: &GpioConfig) -> Result<Self, HardwareError> {
        Self::connect_with_slot(config, &HARDWARE_SLOT).await
    }

    async fn connect_with_slot(
        config: &GpioConfig,
        slot: &'static InstanceSlot,
    ) -> Result<Self, HardwareError> {
        let instance = slot.acquire()?;
        let addr = format!("{}:{}", config.host, config.port);

        info!("[GPIO] Connecting to pigpiod at {}", addr);
        let stream = open_stream(&addr).await?;

        Ok(Self {
            addr,
            stream: Mutex::new(Some(stream)),
            _instance: instance,
        })
    }

    /// Run one command and return the daemon's non-negative result.
    async fn command(&self, cmd: u32, p1: u32, p2: u32, ext: &[u8]) -> Result<u32, HardwareError> {
        let (res, _) = self.transact(cmd, p1, p2, ext, false).await?;
        Ok(res)
    }

    /// Run one command, optionally reading `result` payload bytes after the
    /// answer frame.
    async fn transact(
        &self,
        cmd: u32,
        p1: u32,
        p2: u32,
        ext: &[u8],
        with_payload: bool,
    ) -> Result<(u32, Vec<u8>), HardwareError> {
        let mut slot = self.stream.lock().await;
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => {
                warn!("[GPIO] Reconnecting to pigpiod at {}", self.addr);
                open_stream(&self.addr).await?
            }
        };

        let outcome: Result<(u32, Vec<u8>), HardwareError> = async {
            let res = exchange(&mut stream, cmd, p1, p2, ext).await?;
            let mut payload = Vec::new();
            if with_payload {
                payload.resize(res as usize, 0);
                stream.read_exact(&mut payload).await?;
            }
            Ok((res, payload))
        }
        .await;

        match &outcome {
            Ok(_) | Err(HardwareError::Daemon { .. }) => *slot = Some(stream),
            Err(e) => debug!("[GPIO] Dropping connection after failed command {}: {}", cmd, e),
        }
        outcome
    }
}

async fn open_stream(addr: &str) -> Result<TcpStream, HardwareError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| HardwareError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn exchange(
    stream: &mut TcpStream,
    cmd: u32,
    p1: u32,
    p2: u32,
    ext: &[u8],
) -> Result<u32, HardwareError> {
    stream.write_all(&encode_command(cmd, p1, p2, ext)).await?;

    let mut frame = [0u8; FRAME_LEN];
    stream.read_exact(&mut frame).await?;
    decode_result(cmd, &frame)
}

fn encode_command(cmd: u32, p1: u32, p2: u32, ext: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_LEN + ext.len());
    frame.extend_from_slice(&cmd.to_le_bytes());
    frame.extend_from_slice(&p1.to_le_bytes());
    frame.extend_from_slice(&p2.to_le_bytes());
    frame.extend_from_slice(&(ext.len() as u32).to_le_bytes());
    frame.extend_from_slice(ext);
    frame
}

fn decode_result(cmd: u32, frame: &[u8; FRAME_LEN]) -> Result<u32, HardwareError> {
    let res = i32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]]);
    if res < 0 {
        return Err(HardwareError::Daemon {
            command: cmd,
            code: res,
        });
    }
    Ok(res as u32)
}

#[async_trait]
impl HardwareAccess for PigpioClient {
    async fn set_line_mode(&self, line: u32, mode: LineMode) -> Result<(), HardwareError> {
        let mode = match mode {
            LineMode::Input => MODE_INPUT,
            LineMode::Output => MODE_OUTPUT,
        };
        self.command(CMD_MODES, line, mode, &[]).await?;
        Ok(())
    }

    async fn write_line(&self, line: u32, level: Level) -> Result<(), HardwareError> {
        self.command(CMD_WRITE, line, level.is_high() as u32, &[])
            .await?;
        Ok(())
    }

    async fn read_line(&self, line: u32) -> Result<Level, HardwareError> {
        let level = self.command(CMD_READ, line, 0, &[]).await?;
        Ok(Level::from(level != 0))
    }

    async fn open_bus_device(&self, bus: u32, addr: u32) -> Result<BusHandle, HardwareError> {
        let flags = 0u32.to_le_bytes();
        let handle = self.command(CMD_I2CO, bus, addr, &flags).await?;
        debug!("[GPIO] Opened i2c bus {} addr {} as {}", bus, addr, handle);
        Ok(BusHandle(handle))
    }

    async fn read_bus_block(
        &self,
        handle: BusHandle,
        count: usize,
    ) -> Result<Vec<u8>, HardwareError> {
        let (_, data) = self
            .transact(CMD_I2CRD, handle.0, count as u32, &[], true)
            .await?;
        Ok(data)
    }

    async fn close_bus_device(&self, handle: BusHandle) -> Result<(), HardwareError> {
        self.command(CMD_I2CC, handle.0, 0, &[]).await?;
        Ok(())
    }
}
