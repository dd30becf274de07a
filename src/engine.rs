//! Request/response transactions on a half-duplex serial link.
//!
//! An [`Engine`] owns the byte transport and runs exactly one transaction at a
//! time: it waits until the configured delay since the previous transaction has
//! passed, optionally switches the line driver to transmit, writes the request,
//! switches back to receive and reads and validates the response.

use crate::protocol::{Request, Response, DEFAULT_DELAY, MAX_RESPONSE_PAYLOAD};
use crate::Error;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// A blocking byte stream connected to the device.
pub trait Transport: Read + Write {
    /// Drops every byte that has been received but not yet read.
    fn discard_input(&mut self) -> io::Result<()>;
}

/// Drives the direction line of a half-duplex (e.g. RS-485) transceiver.
pub trait DirectionControl {
    fn set_transmit(&mut self, transmit: bool) -> io::Result<()>;
}

impl<F> DirectionControl for F
where
    F: FnMut(bool) -> io::Result<()>,
{
    fn set_transmit(&mut self, transmit: bool) -> io::Result<()> {
        self(transmit)
    }
}

/// Monotonic time source used for pacing.
pub trait Clock {
    /// Time since an arbitrary but fixed origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by [`Instant`] and [`std::thread::sleep`].
///
/// All instances share one origin, so their readings can be compared.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        ORIGIN.get_or_init(Instant::now).elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// Time of the last completed transaction on a physical link.
///
/// Clones share the same state. Give every client talking over the same wire a
/// clone of one `Pacing` so they respect a common delay.
#[derive(Debug, Clone, Default)]
pub struct Pacing(Arc<Mutex<Option<Duration>>>);

impl Pacing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_transaction(&self) -> Option<Duration> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, at: Duration) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    fn remaining(&self, now: Duration, delay: Duration) -> Option<Duration> {
        let elapsed = now.saturating_sub(self.last_transaction()?);
        delay.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

/// Receives the raw bytes of every response frame.
pub type FrameObserver = Box<dyn FnMut(&[u8]) + Send>;

pub struct Engine<T, C = SystemClock> {
    transport: T,
    clock: C,
    pacing: Pacing,
    delay: Duration,
    direction: Option<Box<dyn DirectionControl + Send>>,
    observer: Option<FrameObserver>,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T) -> Self {
        Self::with_clock(transport, SystemClock)
    }
}

impl<T: Transport, C: Clock> Engine<T, C> {
    pub fn with_clock(transport: T, clock: C) -> Self {
        Self {
            transport,
            clock,
            pacing: Pacing::new(),
            delay: DEFAULT_DELAY,
            direction: None,
            observer: None,
        }
    }

    pub fn set_delay(&mut self, delay: Duration) {
        log::trace!("set delay to {delay:?}");
        self.delay = delay;
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Replaces the pacing state, e.g. with one shared with other clients.
    pub fn set_pacing(&mut self, pacing: Pacing) {
        self.pacing = pacing;
    }

    pub fn pacing(&self) -> &Pacing {
        &self.pacing
    }

    /// Enables direction switching. The line is put into receive mode at once.
    pub fn set_direction_control<D>(&mut self, mut direction: D) -> Result<(), Error>
    where
        D: DirectionControl + Send + 'static,
    {
        direction.set_transmit(false)?;
        self.direction = Some(Box::new(direction));
        Ok(())
    }

    pub fn set_frame_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Runs one transaction and returns the validated response.
    ///
    /// A response with a nonzero status yields [`Error::Device`]. The time of
    /// the transaction is recorded whenever the request reached the pacing
    /// step, also if it failed afterwards.
    pub fn execute(&mut self, request: &Request) -> Result<Response, Error> {
        let tx_buffer = request.encode()?;
        self.await_delay();
        let result = self.transceive(&tx_buffer);
        self.pacing.record(self.clock.now());
        result
    }

    fn await_delay(&self) {
        if let Some(remaining) = self.pacing.remaining(self.clock.now(), self.delay) {
            log::trace!("wait {remaining:?} before next command");
            self.clock.sleep(remaining);
        }
    }

    fn transceive(&mut self, tx_buffer: &[u8]) -> Result<Response, Error> {
        self.send_bytes(tx_buffer)?;

        let mut rx_buffer = Vec::with_capacity(MAX_RESPONSE_PAYLOAD + 7);
        let response = Response::read_from(&mut self.transport, &mut rx_buffer);
        log::trace!("receive_bytes: {rx_buffer:02X?}");
        if let Some(observer) = self.observer.as_mut() {
            observer(&rx_buffer);
        }

        let response = response?;
        if !response.is_ok() {
            log::warn!(
                "Device rejected register {:02X?} with status {:02X?}",
                response.register,
                response.status
            );
            return Err(Error::Device(response.status));
        }
        Ok(response)
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<(), Error> {
        self.set_transmit(true)?;
        let written = self.write_frame(tx_buffer);
        // the line must return to receive even if the write failed
        let switched = self.set_transmit(false);
        written?;
        switched
    }

    fn write_frame(&mut self, tx_buffer: &[u8]) -> Result<(), Error> {
        // stale bytes of an aborted exchange would be taken as the response
        self.transport.discard_input()?;
        log::trace!("write bytes: {tx_buffer:02X?}");
        self.transport.write_all(tx_buffer)?;
        self.transport.flush()?;
        Ok(())
    }

    fn set_transmit(&mut self, transmit: bool) -> Result<(), Error> {
        if let Some(direction) = self.direction.as_mut() {
            direction.set_transmit(transmit)?;
        }
        Ok(())
    }
}

impl<T, C> fmt::Debug for Engine<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("pacing", &self.pacing)
            .field("delay", &self.delay)
            .field("direction", &self.direction.is_some())
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Discard(usize),
        Write(Vec<u8>, Duration),
        Flush,
        Direction(bool),
        Sleep(Duration),
    }

    #[derive(Debug, Clone, Default)]
    pub struct Log(pub Arc<Mutex<Vec<Event>>>);

    impl Log {
        pub fn push(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }

        pub fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }

        pub fn writes(&self) -> Vec<(Vec<u8>, Duration)> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Write(bytes, at) => Some((bytes, at)),
                    _ => None,
                })
                .collect()
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MockClock {
        now: Arc<Mutex<Duration>>,
        log: Log,
    }

    impl MockClock {
        pub fn new(log: Log) -> Self {
            Self {
                now: Arc::default(),
                log,
            }
        }

        pub fn advance(&self, duration: Duration) {
            *self.now.lock().unwrap() += duration;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }

        fn sleep(&self, duration: Duration) {
            self.log.push(Event::Sleep(duration));
            self.advance(duration);
        }
    }

    /// Serial port replaying scripted responses.
    ///
    /// Each write moves the next scripted reply into the receive buffer.
    #[derive(Debug, Default)]
    pub struct MockPort {
        pub replies: VecDeque<Vec<u8>>,
        pub fail_write: bool,
        rx: VecDeque<u8>,
        clock: MockClock,
        log: Log,
    }

    impl MockPort {
        pub fn new(clock: MockClock, log: Log) -> Self {
            Self {
                clock,
                log,
                ..Default::default()
            }
        }

        pub fn reply(&mut self, frame: Vec<u8>) {
            self.replies.push_back(frame);
        }

        /// Puts bytes into the receive buffer as if they arrived unrequested.
        pub fn inject(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes);
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.rx.read(buf)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_write {
                return Ok(0);
            }
            self.log.push(Event::Write(buf.to_vec(), self.clock.now()));
            if let Some(reply) = self.replies.pop_front() {
                self.rx.extend(reply);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.log.push(Event::Flush);
            Ok(())
        }
    }

    impl Transport for MockPort {
        fn discard_input(&mut self) -> io::Result<()> {
            let pending = self.rx.len();
            self.rx.clear();
            self.log.push(Event::Discard(pending));
            Ok(())
        }
    }

    pub fn response_frame(register: u8, status: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xdd, register, status, payload.len() as u8];
        frame.extend_from_slice(payload);
        let crc = payload
            .iter()
            .fold(0u16.wrapping_sub(status as u16 + payload.len() as u16), |c, b| {
                c.wrapping_sub(*b as u16)
            });
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.push(0x77);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use crate::protocol::{Hardware, Register, Status, SwitchState, STATUS_ERROR, STATUS_OK};
    use crate::ErrorKind;

    fn setup() -> (Engine<MockPort, MockClock>, MockClock, Log) {
        let log = Log::default();
        let clock = MockClock::new(log.clone());
        let port = MockPort::new(clock.clone(), log.clone());
        (Engine::with_clock(port, clock.clone()), clock, log)
    }

    #[test]
    fn execute_read() {
        let (mut engine, _, log) = setup();
        engine
            .transport_mut()
            .reply(response_frame(0x05, STATUS_OK, b"JBD"));
        let response = engine.execute(&Hardware::request()).unwrap();
        assert_eq!(response.payload, b"JBD");
        assert_eq!(
            log.events(),
            [
                Event::Discard(0),
                Event::Write(
                    vec![0xdd, 0xa5, 0x05, 0x00, 0xff, 0xfb, 0x77],
                    Duration::ZERO
                ),
                Event::Flush,
            ]
        );
    }

    #[test]
    fn direction_wraps_the_write() {
        let (mut engine, _, log) = setup();
        let direction_log = log.clone();
        engine
            .set_direction_control(move |transmit: bool| -> io::Result<()> {
                direction_log.push(Event::Direction(transmit));
                Ok(())
            })
            .unwrap();
        engine
            .transport_mut()
            .reply(response_frame(0xe1, STATUS_OK, &[]));
        engine.execute(&SwitchState::Both.request()).unwrap();
        let events = log.events();
        assert_eq!(events[0], Event::Direction(false));
        assert_eq!(events[1], Event::Direction(true));
        assert_eq!(events[2], Event::Discard(0));
        assert!(matches!(events[3], Event::Write(..)));
        assert_eq!(events[4], Event::Flush);
        assert_eq!(events[5], Event::Direction(false));
        assert_eq!(events.len(), 6);
    }

    #[test]
    fn direction_is_released_after_failed_write() {
        let (mut engine, _, log) = setup();
        let direction_log = log.clone();
        engine
            .set_direction_control(move |transmit: bool| -> io::Result<()> {
                direction_log.push(Event::Direction(transmit));
                Ok(())
            })
            .unwrap();
        engine.transport_mut().fail_write = true;
        let err = engine.execute(&Status::request()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(log.events().last(), Some(&Event::Direction(false)));
    }

    #[test]
    fn stale_input_is_discarded() {
        let (mut engine, _, log) = setup();
        let port = engine.transport_mut();
        port.inject(&[0xdd, 0x03, 0x00]);
        port.reply(response_frame(0x05, STATUS_OK, b"Y"));
        let response = engine.execute(&Hardware::request()).unwrap();
        assert_eq!(response.payload, b"Y");
        assert!(log.events().contains(&Event::Discard(3)));
    }

    #[test]
    fn pacing_delays_second_command() {
        let (mut engine, clock, log) = setup();
        engine.set_delay(Duration::from_millis(60));
        engine
            .transport_mut()
            .reply(response_frame(0x05, STATUS_OK, b"A"));
        engine
            .transport_mut()
            .reply(response_frame(0x05, STATUS_OK, b"B"));

        engine.execute(&Hardware::request()).unwrap();
        clock.advance(Duration::from_millis(25));
        engine.execute(&Hardware::request()).unwrap();

        let writes = log.writes();
        assert_eq!(writes[1].1 - writes[0].1, Duration::from_millis(60));
        assert!(log
            .events()
            .contains(&Event::Sleep(Duration::from_millis(35))));
    }

    #[test]
    fn no_wait_after_delay_passed() {
        let (mut engine, clock, log) = setup();
        engine
            .transport_mut()
            .reply(response_frame(0x05, STATUS_OK, b"A"));
        engine
            .transport_mut()
            .reply(response_frame(0x05, STATUS_OK, b"B"));
        engine.execute(&Hardware::request()).unwrap();
        clock.advance(DEFAULT_DELAY);
        engine.execute(&Hardware::request()).unwrap();
        assert!(!log.events().iter().any(|e| matches!(e, Event::Sleep(_))));
    }

    #[test]
    fn failed_transaction_is_paced() {
        let (mut engine, clock, log) = setup();
        clock.advance(Duration::from_secs(1));
        engine
            .transport_mut()
            .reply(response_frame(0x03, STATUS_ERROR, &[]));
        let err = engine.execute(&Status::request()).unwrap_err();
        assert!(matches!(err, Error::Device(0x80)));
        assert_eq!(
            engine.pacing().last_transaction(),
            Some(Duration::from_secs(1))
        );

        // short read
        let err = engine.execute(&Status::request()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(
            engine.pacing().last_transaction(),
            Some(Duration::from_millis(1060))
        );
        assert_eq!(log.writes().len(), 2);
    }

    #[test]
    fn encoding_failure_touches_nothing() {
        let (mut engine, _, log) = setup();
        let request = Request::write(Register::Mosfet, vec![0; 40]);
        let err = engine.execute(&request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encoding);
        assert!(log.events().is_empty());
        assert_eq!(engine.pacing().last_transaction(), None);
    }

    #[test]
    fn observer_sees_raw_frames() {
        let (mut engine, _, _) = setup();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let captured = frames.clone();
        engine.set_frame_observer(move |raw| captured.lock().unwrap().push(raw.to_vec()));

        let ok = response_frame(0x05, STATUS_OK, b"ID");
        let mut corrupt = response_frame(0x05, STATUS_OK, b"ID");
        corrupt[4] ^= 0x01;
        engine.transport_mut().reply(ok.clone());
        engine.transport_mut().reply(corrupt.clone());

        engine.execute(&Hardware::request()).unwrap();
        let err = engine.execute(&Hardware::request()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(*frames.lock().unwrap(), [ok, corrupt]);
    }

    #[test]
    fn observer_sees_partial_frames() {
        let (mut engine, _, _) = setup();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let captured = frames.clone();
        engine.set_frame_observer(move |raw| captured.lock().unwrap().push(raw.to_vec()));

        let frame = response_frame(0x05, STATUS_OK, b"JBD-SP04S034");
        engine.transport_mut().reply(frame[..9].to_vec());

        let err = engine.execute(&Hardware::request()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(*frames.lock().unwrap(), [frame[..9].to_vec()]);
    }

    #[test]
    fn shared_pacing() {
        let log = Log::default();
        let clock = MockClock::new(log.clone());
        let mut first = Engine::with_clock(MockPort::new(clock.clone(), log.clone()), clock.clone());
        let mut second =
            Engine::with_clock(MockPort::new(clock.clone(), log.clone()), clock.clone());
        second.set_pacing(first.pacing().clone());

        first
            .transport_mut()
            .reply(response_frame(0x05, STATUS_OK, b"A"));
        second
            .transport_mut()
            .reply(response_frame(0x05, STATUS_OK, b"B"));
        first.execute(&Hardware::request()).unwrap();
        second.execute(&Hardware::request()).unwrap();

        let writes = log.writes();
        assert_eq!(writes[1].1 - writes[0].1, DEFAULT_DELAY);
    }
}
