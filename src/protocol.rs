use crate::Error;
use std::fmt;
use std::io::{self, Read};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// The device drops commands that arrive too close to the previous exchange
pub const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_millis(60);

pub const START_BYTE: u8 = 0xdd;
pub const STOP_BYTE: u8 = 0x77;

/// Largest payload a request may carry.
pub const MAX_REQUEST_PAYLOAD: usize = 30;
/// Largest payload a response may carry.
pub const MAX_RESPONSE_PAYLOAD: usize = 64;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERROR: u8 = 0x80;

const REQUEST_HEADER_LENGTH: usize = 4;
pub const RESPONSE_HEADER_LENGTH: usize = 4;
// checksum (2 bytes) and stop byte
const TRAILER_LENGTH: usize = 3;

pub const CELLS_MAX: usize = 32;
pub const NTCS_MAX: usize = 8;
pub const HARDWARE_ID_MAX: usize = 32;

const STATUS_LENGTH: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Read = 0xa5,
    Write = 0x5a,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    Status = 0x03,
    Cells = 0x04,
    Hardware = 0x05,
    Mosfet = 0xe1,
}

fn accumulate(seed: u8, payload: &[u8]) -> u16 {
    let crc = 0u16
        .wrapping_sub(seed as u16)
        .wrapping_sub(payload.len() as u16);
    payload
        .iter()
        .fold(crc, |crc, b| crc.wrapping_sub(*b as u16))
        .swap_bytes()
}

/// Calculates the checksum of a request as the device expects it.
///
/// The result is the byte swapped two's complement of the sum over `seed`,
/// `length` and the payload, so writing it low byte first puts the high byte
/// of the sum on the wire first.
///
/// Returns 0 if `length` exceeds [`MAX_REQUEST_PAYLOAD`] or does not match the
/// payload size. No valid request has a checksum of 0.
pub fn checksum(seed: u8, length: u8, payload: &[u8]) -> u16 {
    if usize::from(length) > MAX_REQUEST_PAYLOAD || payload.len() != usize::from(length) {
        return 0;
    }
    accumulate(seed, payload)
}

fn response_checksum(status: u8, payload: &[u8]) -> u16 {
    accumulate(status, payload)
}

fn validate_len(buffer: &[u8], required: usize) -> std::result::Result<(), Error> {
    if buffer.len() < required {
        log::warn!(
            "Invalid payload size - required={} received={}",
            required,
            buffer.len()
        );
        return Err(Error::ReplySize {
            required,
            received: buffer.len(),
        });
    }
    Ok(())
}

fn be_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub direction: Direction,
    pub register: Register,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn read(register: Register) -> Self {
        Self {
            direction: Direction::Read,
            register,
            payload: Vec::new(),
        }
    }

    pub fn write(register: Register, payload: Vec<u8>) -> Self {
        Self {
            direction: Direction::Write,
            register,
            payload,
        }
    }

    /// Serializes the request into a complete frame.
    pub fn encode(&self) -> std::result::Result<Vec<u8>, Error> {
        let length = u8::try_from(self.payload.len())
            .map_err(|_| Error::Encoding(self.payload.len()))?;
        let crc = checksum(self.register as u8, length, &self.payload);
        if crc == 0 {
            log::warn!("Cannot calculate checksum of {:?}", self);
            return Err(Error::Encoding(self.payload.len()));
        }

        let mut tx_buffer =
            Vec::with_capacity(REQUEST_HEADER_LENGTH + self.payload.len() + TRAILER_LENGTH);
        tx_buffer.extend_from_slice(&[
            START_BYTE,
            self.direction as u8,
            self.register as u8,
            length,
        ]);
        tx_buffer.extend_from_slice(&self.payload);
        tx_buffer.extend_from_slice(&crc.to_le_bytes());
        tx_buffer.push(STOP_BYTE);
        Ok(tx_buffer)
    }
}

/// Reads exactly `count` bytes, appending each chunk to `raw` as it arrives so
/// a short read leaves the bytes already received in `raw`.
fn read_appending<R: Read + ?Sized>(
    reader: &mut R,
    raw: &mut Vec<u8>,
    count: usize,
) -> io::Result<()> {
    let mut buffer = [0; MAX_RESPONSE_PAYLOAD];
    let mut remaining = count;
    while remaining > 0 {
        let chunk = remaining.min(buffer.len());
        match reader.read(&mut buffer[..chunk]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("frame ended {remaining} bytes early"),
                ))
            }
            Ok(received) => {
                raw.extend_from_slice(&buffer[..received]);
                remaining -= received;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// A structurally valid response frame with a verified checksum.
///
/// The status code is not interpreted here, a response with a nonzero status
/// is still returned as long as the frame itself is intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub register: u8,
    pub status: u8,
    pub payload: Vec<u8>,
    pub checksum: u16,
}

impl Response {
    /// Reads one frame from `reader`.
    ///
    /// Every byte taken from the reader is appended to `raw`, also when the
    /// frame turns out to be invalid.
    pub fn read_from<R: Read + ?Sized>(
        reader: &mut R,
        raw: &mut Vec<u8>,
    ) -> std::result::Result<Self, Error> {
        let start_of_frame = raw.len();
        read_appending(reader, raw, RESPONSE_HEADER_LENGTH)?;
        let header = &raw[start_of_frame..];
        let (start, register, status, length) = (header[0], header[1], header[2], header[3]);
        if start != START_BYTE {
            log::warn!("Invalid start byte {:02X?}", start);
            return Err(Error::StartByte(start));
        }
        if usize::from(length) > MAX_RESPONSE_PAYLOAD {
            log::warn!("Invalid response length {}", length);
            return Err(Error::ResponseLength(length));
        }

        read_appending(reader, raw, usize::from(length) + TRAILER_LENGTH)?;
        let body = &raw[start_of_frame + RESPONSE_HEADER_LENGTH..];
        let (payload, trailer) = body.split_at(usize::from(length));
        let payload = payload.to_vec();
        let (crc_lo, crc_hi, stop) = (trailer[0], trailer[1], trailer[2]);

        if stop != STOP_BYTE {
            log::warn!("Invalid stop byte {:02X?}", stop);
            return Err(Error::StopByte(stop));
        }
        let received = u16::from_le_bytes([crc_lo, crc_hi]);
        let calculated = response_checksum(status, &payload);
        if calculated != received {
            log::warn!(
                "Invalid checksum - calculated={:04X?} received={:04X?} frame={:02X?}",
                calculated,
                received,
                raw
            );
            return Err(Error::CheckSum {
                calculated,
                received,
            });
        }

        Ok(Self {
            register,
            status,
            payload,
            checksum: received,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Packed production date: 7 bits year since 2000, 4 bits month, 5 bits day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProductionDate(pub u16);

impl ProductionDate {
    pub fn year(&self) -> u16 {
        (self.0 >> 9) + 2000
    }

    pub fn month(&self) -> u8 {
        ((self.0 >> 5) & 0x0f) as u8
    }

    pub fn day(&self) -> u8 {
        (self.0 & 0x1f) as u8
    }
}

impl fmt::Display for ProductionDate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year(), self.month(), self.day())
    }
}

/// State of the charge and discharge MOSFETs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum SwitchState {
    None = 0,
    Charge = 1,
    Discharge = 2,
    Both = 3,
}

impl SwitchState {
    pub fn new(charge: bool, discharge: bool) -> Self {
        match (charge, discharge) {
            (false, false) => SwitchState::None,
            (true, false) => SwitchState::Charge,
            (false, true) => SwitchState::Discharge,
            (true, true) => SwitchState::Both,
        }
    }

    pub fn charge(&self) -> bool {
        *self as u8 & SwitchState::Charge as u8 != 0
    }

    pub fn discharge(&self) -> bool {
        *self as u8 & SwitchState::Discharge as u8 != 0
    }

    /// Builds the write request. The device expects the bits active low.
    pub fn request(self) -> Request {
        let inverted = !(self as u8) & SwitchState::Both as u8;
        Request::write(Register::Mosfet, vec![0x00, inverted])
    }
}

impl From<u8> for SwitchState {
    fn from(bits: u8) -> Self {
        Self::new(bits & 0x01 != 0, bits & 0x02 != 0)
    }
}

/// Protection states reported in the fault word of [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Fault {
    CellOvervoltage,
    CellUndervoltage,
    Overvoltage,
    Undervoltage,
    ChargeOvertemperature,
    ChargeUndertemperature,
    DischargeOvertemperature,
    DischargeUndertemperature,
    ChargeOvercurrent,
    DischargeOvercurrent,
    ShortCircuit,
    IcError,
    MosfetSoftwareLock,
}

impl Fault {
    const ALL: [Fault; 13] = [
        Fault::CellOvervoltage,
        Fault::CellUndervoltage,
        Fault::Overvoltage,
        Fault::Undervoltage,
        Fault::ChargeOvertemperature,
        Fault::ChargeUndertemperature,
        Fault::DischargeOvertemperature,
        Fault::DischargeUndertemperature,
        Fault::ChargeOvercurrent,
        Fault::DischargeOvercurrent,
        Fault::ShortCircuit,
        Fault::IcError,
        Fault::MosfetSoftwareLock,
    ];

    pub fn decode(fault: u16) -> Vec<Self> {
        Self::ALL
            .iter()
            .enumerate()
            .filter(|(bit, _)| (fault >> bit) & 1 != 0)
            .map(|(_, f)| *f)
            .collect()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Fault::CellOvervoltage => write!(f, "Cell overvoltage protection"),
            Fault::CellUndervoltage => write!(f, "Cell undervoltage protection"),
            Fault::Overvoltage => write!(f, "Pack overvoltage protection"),
            Fault::Undervoltage => write!(f, "Pack undervoltage protection"),
            Fault::ChargeOvertemperature => write!(f, "Charging over temperature protection"),
            Fault::ChargeUndertemperature => write!(f, "Charging low temperature protection"),
            Fault::DischargeOvertemperature => {
                write!(f, "Discharging over temperature protection")
            }
            Fault::DischargeUndertemperature => {
                write!(f, "Discharging low temperature protection")
            }
            Fault::ChargeOvercurrent => write!(f, "Charging over current protection"),
            Fault::DischargeOvercurrent => write!(f, "Discharging over current protection"),
            Fault::ShortCircuit => write!(f, "Short circuit protection"),
            Fault::IcError => write!(f, "Front-end IC error"),
            Fault::MosfetSoftwareLock => write!(f, "MOSFET software lock"),
        }
    }
}

/// Converts a NTC reading in 0.1 K to 0.1 °C.
///
/// Readings beyond the `i16` range, such as `0xFFFF` from an open sensor,
/// saturate at `i16::MAX`.
pub fn deci_celsius(deci_kelvin: u16) -> i16 {
    i16::try_from(i32::from(deci_kelvin) - 2731).unwrap_or(i16::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Status {
    pub voltage: u16,            // 10 mV
    pub current: i16,            // 10 mA, positive=charging, negative=discharging
    pub remaining_capacity: u16, // 10 mAh
    pub nominal_capacity: u16,   // 10 mAh
    pub cycles: u16,
    pub production_date: ProductionDate,
    pub balance_low: u16,  // cells 1..16
    pub balance_high: u16, // cells 17..32
    pub fault: u16,
    pub version: u8,
    pub current_capacity: u8, // percent
    pub mosfet_status: SwitchState,
    pub cells: u8,
    pub ntcs: u8,
    pub temperatures: Vec<u16>, // 0.1 K
}

impl Status {
    pub fn request() -> Request {
        Request::read(Register::Status)
    }

    pub fn decode(payload: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(payload, STATUS_LENGTH)?;
        let ntcs = payload[22];
        let available = (payload.len() - STATUS_LENGTH) / 2;
        let n_temperatures = usize::from(ntcs).min(NTCS_MAX).min(available);
        if n_temperatures < usize::from(ntcs) {
            log::warn!(
                "Status reports {} NTCs, decoding {} temperatures",
                ntcs,
                n_temperatures
            );
        }
        Ok(Self {
            voltage: be_u16(payload, 0),
            current: be_u16(payload, 2) as i16,
            remaining_capacity: be_u16(payload, 4),
            nominal_capacity: be_u16(payload, 6),
            cycles: be_u16(payload, 8),
            production_date: ProductionDate(be_u16(payload, 10)),
            balance_low: be_u16(payload, 12),
            balance_high: be_u16(payload, 14),
            fault: be_u16(payload, 16),
            version: payload[18],
            current_capacity: payload[19],
            mosfet_status: SwitchState::from(payload[20]),
            cells: payload[21],
            ntcs,
            temperatures: (0..n_temperatures)
                .map(|i| be_u16(payload, STATUS_LENGTH + 2 * i))
                .collect(),
        })
    }

    /// Renders the balancing state of each cell as '0' or '1', first cell first.
    pub fn balance(&self) -> String {
        let bits = u32::from(self.balance_high) << 16 | u32::from(self.balance_low);
        let cells = usize::from(self.cells).min(CELLS_MAX);
        (0..cells)
            .map(|cell| if (bits >> cell) & 1 != 0 { '1' } else { '0' })
            .collect()
    }

    pub fn faults(&self) -> Vec<Fault> {
        Fault::decode(self.fault)
    }

    pub fn temperatures_celsius(&self) -> Vec<f32> {
        self.temperatures
            .iter()
            .map(|t| f32::from(deci_celsius(*t)) / 10.0)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cells {
    pub voltages: Vec<u16>, // mV
}

impl Cells {
    pub fn request() -> Request {
        Request::read(Register::Cells)
    }

    pub fn decode(payload: &[u8]) -> std::result::Result<Self, Error> {
        if payload.len() % 2 != 0 {
            log::warn!("Ignoring trailing byte of cell voltages {:02X?}", payload);
        }
        Ok(Self {
            voltages: payload
                .chunks_exact(2)
                .take(CELLS_MAX)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Hardware {
    pub id: String,
}

impl Hardware {
    pub fn request() -> Request {
        Request::read(Register::Hardware)
    }

    pub fn decode(payload: &[u8]) -> std::result::Result<Self, Error> {
        let id = &payload[..payload.len().min(HARDWARE_ID_MAX)];
        Ok(Self {
            id: String::from_utf8_lossy(id)
                .trim_end_matches('\0')
                .to_string(),
        })
    }
}
