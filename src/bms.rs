use crate::engine::{Clock, DirectionControl, Engine, Pacing, SystemClock, Transport};
use crate::protocol::*;
use crate::Error;
use std::time::Duration;

type Result<T> = std::result::Result<T, Error>;

/// Client for a JBD BMS connected over `T`.
///
/// Every method runs a single transaction. Failures are returned as they are,
/// callers decide whether to repeat a command.
#[derive(Debug)]
pub struct JbdBms<T, C = SystemClock> {
    engine: Engine<T, C>,
}

impl<T: Transport> JbdBms<T> {
    pub fn new(transport: T) -> Self {
        Self {
            engine: Engine::new(transport),
        }
    }
}

impl<T: Transport, C: Clock> JbdBms<T, C> {
    pub fn with_clock(transport: T, clock: C) -> Self {
        Self {
            engine: Engine::with_clock(transport, clock),
        }
    }

    /// Sets the minimum time between the end of one command and the start of the next.
    pub fn set_delay(&mut self, delay: Duration) {
        self.engine.set_delay(delay);
    }

    /// Shares the command timing with other clients on the same wire.
    pub fn set_pacing(&mut self, pacing: Pacing) {
        self.engine.set_pacing(pacing);
    }

    pub fn pacing(&self) -> &Pacing {
        self.engine.pacing()
    }

    pub fn set_direction_control<D>(&mut self, direction: D) -> Result<()>
    where
        D: DirectionControl + Send + 'static,
    {
        self.engine.set_direction_control(direction)
    }

    /// Calls `observer` with each received frame, including invalid ones.
    pub fn set_frame_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.engine.set_frame_observer(observer);
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.engine.transport_mut()
    }

    /// Sends a raw request and returns the validated response.
    pub fn execute(&mut self, request: &Request) -> Result<Response> {
        self.engine.execute(request)
    }

    pub fn get_status(&mut self) -> Result<Status> {
        log::trace!("get status");
        let response = self.engine.execute(&Status::request())?;
        Status::decode(&response.payload)
    }

    pub fn get_cells(&mut self) -> Result<Cells> {
        log::trace!("get cells");
        let response = self.engine.execute(&Cells::request())?;
        Cells::decode(&response.payload)
    }

    pub fn get_hardware(&mut self) -> Result<Hardware> {
        log::trace!("get hardware");
        let response = self.engine.execute(&Hardware::request())?;
        Hardware::decode(&response.payload)
    }

    pub fn set_mosfet_status(&mut self, state: SwitchState) -> Result<()> {
        log::trace!("set mosfet status to {state:?}");
        self.engine.execute(&state.request())?;
        Ok(())
    }
}
