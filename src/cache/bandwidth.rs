use crate::cache::{self, event, RequestStatus};

/// Data-port and fill-port occupancy accounting.
///
/// Each port has a saturating busy counter, decremented once per cycle.
#[derive(Debug)]
pub struct Manager {
    config: cache::Config,
    data_port_occupied_cycles: u64,
    fill_port_occupied_cycles: u64,
}

impl Manager {
    #[must_use]
    pub fn new(config: cache::Config) -> Self {
        Self {
            config,
            data_port_occupied_cycles: 0,
            fill_port_occupied_cycles: 0,
        }
    }

    /// Occupy the data port based on the outcome and events of an access.
    pub fn use_data_port(
        &mut self,
        data_size: u32,
        outcome: RequestStatus,
        events: &[event::Event],
    ) {
        let port_width = self.config.data_port_width as u64;
        match outcome {
            RequestStatus::HIT => {
                let data_size = u64::from(data_size);
                let data_cycles =
                    data_size / port_width + u64::from(data_size % port_width > 0);
                self.data_port_occupied_cycles += data_cycles;
            }
            RequestStatus::HIT_RESERVED | RequestStatus::MISS => {
                // the data array is read out in full for a writeback
                if event::was_writeback_sent(events) {
                    let data_cycles = u64::from(self.config.line_size) / port_width;
                    self.data_port_occupied_cycles += data_cycles;
                }
            }
            RequestStatus::RESERVATION_FAIL => {
                // consumes no port bandwidth
            }
        }
    }

    /// Occupy the fill port for one returned line.
    pub fn use_fill_port(&mut self) {
        let fill_cycles = u64::from(self.config.line_size) / self.config.data_port_width as u64;
        self.fill_port_occupied_cycles += fill_cycles;
    }

    /// Called once per cache cycle to free up the ports.
    pub fn replenish_port_bandwidth(&mut self) {
        self.data_port_occupied_cycles = self.data_port_occupied_cycles.saturating_sub(1);
        self.fill_port_occupied_cycles = self.fill_port_occupied_cycles.saturating_sub(1);
    }

    #[must_use]
    pub fn data_port_free(&self) -> bool {
        self.data_port_occupied_cycles == 0
    }

    #[must_use]
    pub fn fill_port_free(&self) -> bool {
        self.fill_port_occupied_cycles == 0
    }
}
